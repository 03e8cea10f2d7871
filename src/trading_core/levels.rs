//! Pivot levels supplied by the pre-market scanner
//!
//! The scanner is an external collaborator. It hands the core one pivot per
//! symbol (a resistance to break upward or a support to break downward), an
//! ordered list of profit targets, and a quality score. The core treats all of
//! it as read-only for the session.

use serde::{Deserialize, Serialize};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// True when `price` is strictly beyond `level` in this direction
    pub fn is_beyond(self, price: f64, level: f64) -> bool {
        match self {
            Direction::Long => price > level,
            Direction::Short => price < level,
        }
    }

    /// True when `candidate` is at least as favorable as `current`
    pub fn at_least_as_favorable(self, candidate: f64, current: f64) -> bool {
        match self {
            Direction::Long => candidate >= current,
            Direction::Short => candidate <= current,
        }
    }

    /// Move `price` by `pct` percent in the favorable direction (negative pct moves against)
    pub fn offset_pct(self, price: f64, pct: f64) -> f64 {
        price * (1.0 + self.sign() * pct / 100.0)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "Long"),
            Direction::Short => write!(f, "Short"),
        }
    }
}

/// Type of pivot level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PivotKind {
    /// Resistance - broken upward for a long
    Resistance,
    /// Support - broken downward for a short
    Support,
}

impl PivotKind {
    pub fn breakout_direction(self) -> Direction {
        match self {
            PivotKind::Resistance => Direction::Long,
            PivotKind::Support => Direction::Short,
        }
    }
}

/// Scanner output for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotLevel {
    pub symbol: String,
    pub price: f64,
    pub kind: PivotKind,
    /// Profit targets in any order; consumers sort by distance
    #[serde(default)]
    pub targets: Vec<f64>,
    #[serde(default)]
    pub quality: f64,
}

impl PivotLevel {
    pub fn direction(&self) -> Direction {
        self.kind.breakout_direction()
    }

    /// Targets strictly beyond `price` in the breakout direction, nearest first
    pub fn targets_beyond(&self, price: f64) -> Vec<f64> {
        let direction = self.direction();
        let mut beyond: Vec<f64> = self
            .targets
            .iter()
            .copied()
            .filter(|t| t.is_finite() && direction.is_beyond(*t, price))
            .collect();
        beyond.sort_by(|a, b| (a - price).abs().total_cmp(&(b - price).abs()));
        beyond
    }

    /// Attempt-ledger key: pivot price in hundredths plus side
    pub fn key(&self) -> PivotKey {
        PivotKey {
            symbol: self.symbol.clone(),
            pivot_cents: (self.price * 100.0).round() as i64,
            direction: self.direction(),
        }
    }
}

/// Identifies one pivot/side combination for the attempt cap
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PivotKey {
    pub symbol: String,
    pub pivot_cents: i64,
    pub direction: Direction,
}

impl std::fmt::Display for PivotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:.2} {}",
            self.symbol,
            self.pivot_cents as f64 / 100.0,
            self.direction
        )
    }
}
