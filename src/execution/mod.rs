//! Execution module - the broker seam
//!
//! The strategy core never talks to a venue directly. It hands orders to an
//! [`ExecutionEngine`], which wraps any [`ExecutionVenue`] with timeouts,
//! bounded retries and a circuit breaker.

mod config;
mod engine;
mod order;
mod retry;
mod simulated;
mod venue;

pub use config::ExecutionConfig;
pub use engine::{ExecutionEngine, Fill};
pub use order::{OrderAck, OrderKind, OrderRequest, OrderSide, VenueOrder, VenuePosition};
pub use retry::{Backoff, BreakerState, CircuitBreaker};
pub use simulated::SimulatedVenue;
pub use venue::{ExecutionVenue, VenueError};
