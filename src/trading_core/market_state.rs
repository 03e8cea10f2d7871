//! Market State Detection
//!
//! Determines if recent price action is Balanced (rotational, choppy) or
//! Imbalanced (directional). Breakouts out of a Balanced tape are blocked by
//! the pre-entry filters.

use serde::{Deserialize, Serialize};

use super::bars::Bar;
use super::indicators;

/// Market state classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    /// Rotational market - price oscillating around fair value
    Balanced,
    /// Directional market - price pushing toward new fair value
    Imbalanced,
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketState::Balanced => write!(f, "BALANCED"),
            MarketState::Imbalanced => write!(f, "IMBALANCED"),
        }
    }
}

/// Configuration for market state detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketStateConfig {
    /// Number of bars to look back for analysis (default: 20)
    pub lookback_bars: usize,
    /// Minimum rotations through fair value to be "balanced" (default: 4)
    pub rotation_threshold: u32,
    /// If window range > atr * this value, market is imbalanced (default: 3.0)
    pub range_expansion_mult: f64,
    /// |cumulative delta| / total volume at or above this is imbalanced (default: 0.3)
    pub delta_share_threshold: f64,
}

impl Default for MarketStateConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 20,
            rotation_threshold: 4,
            range_expansion_mult: 3.0,
            delta_share_threshold: 0.3,
        }
    }
}

/// Result of market state analysis over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStateResult {
    pub state: MarketState,
    /// VWAP of the window (midpoint of first open / last close without volume)
    pub fair_value: f64,
    pub atr: f64,
    /// Number of closes that crossed fair value
    pub rotation_count: u32,
    /// Window range / ATR
    pub range_ratio: f64,
    /// Buy minus sell volume over the window
    pub cumulative_delta: i64,
}

fn vwap(bars: &[&Bar]) -> Option<f64> {
    let (first, last) = (bars.first()?, bars.last()?);
    let mut sum_pv = 0.0;
    let mut sum_v = 0u64;
    for bar in bars {
        let typical_price = (bar.high + bar.low + bar.close) / 3.0;
        sum_pv += typical_price * bar.volume as f64;
        sum_v += bar.volume;
    }
    if sum_v == 0 {
        return Some((first.open + last.close) / 2.0);
    }
    Some(sum_pv / sum_v as f64)
}

fn count_fair_value_crosses(bars: &[&Bar], fair_value: f64) -> u32 {
    bars.windows(2)
        .filter(|pair| (pair[0].close > fair_value) != (pair[1].close > fair_value))
        .count() as u32
}

/// Classify the most recent `lookback_bars` of `bars`; None for an empty window
pub fn detect_market_state(bars: &[&Bar], config: &MarketStateConfig) -> Option<MarketStateResult> {
    let skip = bars.len().saturating_sub(config.lookback_bars);
    let window = &bars[skip..];

    let fair_value = vwap(window)?;
    let atr = indicators::atr(window)?;
    let rotation_count = count_fair_value_crosses(window, fair_value);

    let window_high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let window_low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let range_ratio = if atr > 0.0 {
        (window_high - window_low) / atr
    } else {
        0.0
    };

    let cumulative_delta: i64 = window
        .iter()
        .map(|b| b.buy_volume as i64 - b.sell_volume as i64)
        .sum();
    let total_volume: u64 = window.iter().map(|b| b.volume).sum();
    let delta_share = if total_volume > 0 {
        cumulative_delta.unsigned_abs() as f64 / total_volume as f64
    } else {
        0.0
    };

    // Expansion or one-sided flow wins over rotation count
    let state = if range_ratio >= config.range_expansion_mult
        || delta_share >= config.delta_share_threshold
    {
        MarketState::Imbalanced
    } else if rotation_count >= config.rotation_threshold {
        MarketState::Balanced
    } else {
        MarketState::Imbalanced
    };

    Some(MarketStateResult {
        state,
        fair_value,
        atr,
        rotation_count,
        range_ratio,
        cumulative_delta,
    })
}
