// Library crate - breakout decision engine, execution plumbing and session recovery

pub mod config;
pub mod execution;
pub mod session;
pub mod trading_core;

// Re-export commonly used types
pub use config::{EngineConfig, SnapshotConfig};
pub use trading_core::{Clock, EngineEvent, TradingEngine};
