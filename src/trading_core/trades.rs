//! Tick types for trading core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw trade print from the market data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub size: u64,
    pub ts_event: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: &str, price: f64, size: u64, ts_event: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            size,
            ts_event,
        }
    }
}

/// Aggressor side inferred for a print
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}
