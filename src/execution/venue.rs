//! Execution venue seam
//!
//! Every call is fallible. Transient failures (timeouts, rate limits, dropped
//! connections) are retried by [`super::ExecutionEngine`]; everything else is
//! surfaced to the caller on the first attempt.

use std::future::Future;

use thiserror::Error;

use super::order::{OrderAck, OrderRequest, VenueOrder, VenuePosition};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    #[error("venue call timed out after {0}ms")]
    Timeout(u64),
    #[error("rate limited by venue")]
    RateLimited,
    #[error("venue disconnected: {0}")]
    Disconnected(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("circuit open, venue calls suspended for {remaining_ms}ms")]
    CircuitOpen { remaining_ms: u64 },
    #[error("unknown order {0}")]
    UnknownOrder(u64),
    #[error("{0}")]
    Other(String),
}

impl VenueError {
    /// Worth retrying after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Timeout(_) | VenueError::RateLimited | VenueError::Disconnected(_)
        )
    }
}

/// Operations the engine needs from a broker
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &str;

    fn place_order(&self, request: &OrderRequest) -> impl Future<Output = Result<OrderAck, VenueError>> + Send;

    fn cancel_order(&self, order_id: u64) -> impl Future<Output = Result<(), VenueError>> + Send;

    fn query_open_positions(&self) -> impl Future<Output = Result<Vec<VenuePosition>, VenueError>> + Send;

    fn query_open_orders(&self) -> impl Future<Output = Result<Vec<VenueOrder>, VenueError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(VenueError::Timeout(500).is_transient());
        assert!(VenueError::RateLimited.is_transient());
        assert!(VenueError::Disconnected("reset".into()).is_transient());
        assert!(!VenueError::Rejected("margin".into()).is_transient());
        assert!(!VenueError::CircuitOpen { remaining_ms: 10 }.is_transient());
        assert!(!VenueError::UnknownOrder(7).is_transient());
    }
}
