//! Order requests and the venue's view of orders and positions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trading_core::levels::Direction;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Side that opens a position in `direction`
    pub fn to_open(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Buy,
            Direction::Short => Self::Sell,
        }
    }

    /// Side that reduces a position in `direction`
    pub fn to_close(direction: Direction) -> Self {
        Self::to_open(direction).opposite()
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Stop,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MKT"),
            Self::Stop => write!(f, "STP"),
        }
    }
}

/// Order as sent to the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-side id, stable across retries of the same request
    pub client_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: u64,
    /// Trigger price for stop orders
    pub stop_price: Option<f64>,
    /// Price the engine expects, used by the simulator to fill market orders
    pub reference_price: f64,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: u64, reference_price: f64) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity,
            stop_price: None,
            reference_price,
        }
    }

    pub fn stop(symbol: &str, side: OrderSide, quantity: u64, stop_price: f64) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Stop,
            quantity,
            stop_price: Some(stop_price),
            reference_price: stop_price,
        }
    }
}

impl std::fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stop_price {
            Some(stop) => write!(f, "{} {} {} {} @ {:.2}", self.kind, self.side, self.quantity, self.symbol, stop),
            None => write!(f, "{} {} {} {}", self.kind, self.side, self.quantity, self.symbol),
        }
    }
}

/// Venue acknowledgement of a placed order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: u64,
    /// Average fill price for orders that filled immediately
    pub fill_price: Option<f64>,
}

/// Open position as the venue reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    /// Signed share count, positive long
    pub quantity: i64,
    pub avg_price: f64,
}

/// Working order as the venue reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: u64,
    pub stop_price: Option<f64>,
}
