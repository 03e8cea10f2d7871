//! Pre-entry filters
//!
//! Run once, just before a confirmed breakout becomes an entry, whichever path
//! confirmed it. A rejection is an expected outcome and carries the measured
//! value and the threshold it failed against.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bars::{BarSeq, BarWindow};
use super::indicators;
use super::levels::{Direction, PivotLevel};
use super::market_state::{detect_market_state, MarketState, MarketStateConfig};

/// Filter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// ENTERED transitions allowed per pivot/side per session (default: 2)
    pub max_attempts: u32,
    /// Distance from pivot (%) that needs no extra volume (default: 1.0)
    pub max_distance_pct: f64,
    /// Volume ratio required at exactly `max_distance_pct`; scales linearly beyond (default: 1.5)
    pub distance_volume_base: f64,
    /// Entries farther than this (%) are always blocked (default: 3.0)
    pub hard_max_distance_pct: f64,
    /// Minimum distance (%) from entry to the next target (default: 1.0)
    pub min_room_pct: f64,
    /// Skip the choppiness check when false
    pub choppiness_enabled: bool,
    pub market_state: MarketStateConfig,
    /// Skip the RSI zone check when false
    pub rsi_enabled: bool,
    pub rsi_period: usize,
    /// Long entries need RSI in [rsi_min, rsi_max]; shorts use the mirror (default: 50..80)
    pub rsi_min: f64,
    pub rsi_max: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_distance_pct: 1.0,
            distance_volume_base: 1.5,
            hard_max_distance_pct: 3.0,
            min_room_pct: 1.0,
            choppiness_enabled: true,
            market_state: MarketStateConfig::default(),
            rsi_enabled: true,
            rsi_period: 14,
            rsi_min: 50.0,
            rsi_max: 80.0,
        }
    }
}

/// Which filter rejected an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    AttemptCap,
    MaxDistance,
    RoomToRun,
    Choppiness,
    MomentumZone,
}

impl std::fmt::Display for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterKind::AttemptCap => write!(f, "ATTEMPT_CAP"),
            FilterKind::MaxDistance => write!(f, "MAX_DISTANCE"),
            FilterKind::RoomToRun => write!(f, "ROOM_TO_RUN"),
            FilterKind::Choppiness => write!(f, "CHOPPINESS"),
            FilterKind::MomentumZone => write!(f, "MOMENTUM_ZONE"),
        }
    }
}

/// Structured reason for a blocked entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub filter: FilterKind,
    pub measured: f64,
    pub threshold: f64,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} measured {:.2} vs threshold {:.2}",
            self.filter, self.measured, self.threshold
        )
    }
}

/// Filter outcome
#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    Pass,
    Block(Rejection),
    /// Not enough bars to decide yet
    Defer,
}

/// Everything the filters look at for one candidate entry
#[derive(Debug, Clone, Copy)]
pub struct FilterInput<'a> {
    pub pivot: &'a PivotLevel,
    pub price: f64,
    /// Confirming volume relative to baseline
    pub volume_ratio: f64,
    pub breakout_seq: BarSeq,
    /// Bar being confirmed; later bars in the window are ignored
    pub confirm_seq: BarSeq,
    pub window: &'a BarWindow,
    pub attempts_used: u32,
}

#[derive(Debug, Clone)]
pub struct PreEntryFilters {
    config: FilterConfig,
}

impl PreEntryFilters {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Cheapest checks first; the first failure wins
    pub fn evaluate(&self, input: &FilterInput<'_>) -> FilterVerdict {
        let checks: [fn(&Self, &FilterInput<'_>) -> FilterVerdict; 5] = [
            Self::check_attempts,
            Self::check_distance,
            Self::check_room,
            Self::check_choppiness,
            Self::check_momentum_zone,
        ];
        for check in checks {
            match check(self, input) {
                FilterVerdict::Pass => continue,
                other => return other,
            }
        }
        FilterVerdict::Pass
    }

    fn check_attempts(&self, input: &FilterInput<'_>) -> FilterVerdict {
        if input.attempts_used >= self.config.max_attempts {
            return FilterVerdict::Block(Rejection {
                filter: FilterKind::AttemptCap,
                measured: f64::from(input.attempts_used),
                threshold: f64::from(self.config.max_attempts),
            });
        }
        FilterVerdict::Pass
    }

    fn check_distance(&self, input: &FilterInput<'_>) -> FilterVerdict {
        let pivot = input.pivot.price;
        if pivot <= 0.0 {
            return FilterVerdict::Pass;
        }
        let distance_pct = (input.price - pivot).abs() / pivot * 100.0;
        if distance_pct <= self.config.max_distance_pct {
            return FilterVerdict::Pass;
        }
        if distance_pct > self.config.hard_max_distance_pct {
            return FilterVerdict::Block(Rejection {
                filter: FilterKind::MaxDistance,
                measured: distance_pct,
                threshold: self.config.hard_max_distance_pct,
            });
        }
        let required = self.config.distance_volume_base * distance_pct / self.config.max_distance_pct;
        if input.volume_ratio < required {
            return FilterVerdict::Block(Rejection {
                filter: FilterKind::MaxDistance,
                measured: input.volume_ratio,
                threshold: required,
            });
        }
        FilterVerdict::Pass
    }

    fn check_room(&self, input: &FilterInput<'_>) -> FilterVerdict {
        let Some(next_target) = input.pivot.targets_beyond(input.price).first().copied() else {
            return FilterVerdict::Pass;
        };
        let room_pct = (next_target - input.price).abs() / input.price * 100.0;
        if room_pct < self.config.min_room_pct {
            return FilterVerdict::Block(Rejection {
                filter: FilterKind::RoomToRun,
                measured: room_pct,
                threshold: self.config.min_room_pct,
            });
        }
        FilterVerdict::Pass
    }

    /// Judged on the tape before the breakout; a short history is not held against the entry
    fn check_choppiness(&self, input: &FilterInput<'_>) -> FilterVerdict {
        if !self.config.choppiness_enabled {
            return FilterVerdict::Pass;
        }
        let lookback = self.config.market_state.lookback_bars;
        let bars = input.window.recent_before(input.breakout_seq, lookback);
        if bars.len() < lookback {
            debug!(
                "{}: choppiness skipped, {} of {} bars before breakout",
                input.pivot.symbol,
                bars.len(),
                lookback
            );
            return FilterVerdict::Pass;
        }
        match detect_market_state(&bars, &self.config.market_state) {
            Some(result) if result.state == MarketState::Balanced => FilterVerdict::Block(Rejection {
                filter: FilterKind::Choppiness,
                measured: f64::from(result.rotation_count),
                threshold: f64::from(self.config.market_state.rotation_threshold),
            }),
            _ => FilterVerdict::Pass,
        }
    }

    fn check_momentum_zone(&self, input: &FilterInput<'_>) -> FilterVerdict {
        if !self.config.rsi_enabled {
            return FilterVerdict::Pass;
        }
        let closes: Vec<f64> = input
            .window
            .recent_before(input.confirm_seq.next(), self.config.rsi_period * 4)
            .iter()
            .map(|b| b.close)
            .collect();
        let Some(rsi) = indicators::rsi(&closes, self.config.rsi_period) else {
            return FilterVerdict::Defer;
        };
        let (low, high) = match input.pivot.direction() {
            Direction::Long => (self.config.rsi_min, self.config.rsi_max),
            Direction::Short => (100.0 - self.config.rsi_max, 100.0 - self.config.rsi_min),
        };
        if rsi < low || rsi > high {
            let threshold = if rsi < low { low } else { high };
            return FilterVerdict::Block(Rejection {
                filter: FilterKind::MomentumZone,
                measured: rsi,
                threshold,
            });
        }
        FilterVerdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::levels::PivotKind;
    use chrono::Utc;

    fn pivot(targets: Vec<f64>) -> PivotLevel {
        PivotLevel {
            symbol: "AAPL".to_string(),
            price: 100.0,
            kind: PivotKind::Resistance,
            targets,
            quality: 1.0,
        }
    }

    fn loose() -> FilterConfig {
        FilterConfig {
            choppiness_enabled: false,
            rsi_enabled: false,
            ..FilterConfig::default()
        }
    }

    fn input<'a>(pivot: &'a PivotLevel, window: &'a BarWindow, price: f64, ratio: f64) -> FilterInput<'a> {
        FilterInput {
            pivot,
            price,
            volume_ratio: ratio,
            breakout_seq: BarSeq(0),
            confirm_seq: window.latest_seq().unwrap_or_default(),
            window,
            attempts_used: 0,
        }
    }

    #[test]
    fn test_attempt_cap_blocks_with_values() {
        let p = pivot(vec![]);
        let w = BarWindow::new(10);
        let filters = PreEntryFilters::new(loose());
        let mut i = input(&p, &w, 100.2, 1.0);
        i.attempts_used = 2;
        match filters.evaluate(&i) {
            FilterVerdict::Block(r) => {
                assert_eq!(r.filter, FilterKind::AttemptCap);
                assert_eq!(r.measured, 2.0);
                assert_eq!(r.threshold, 2.0);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn test_adaptive_distance() {
        let p = pivot(vec![]);
        let w = BarWindow::new(10);
        let filters = PreEntryFilters::new(loose());
        // 2% away needs 1.5 * 2 = 3x volume
        assert!(matches!(filters.evaluate(&input(&p, &w, 102.0, 2.0)), FilterVerdict::Block(_)));
        assert_eq!(filters.evaluate(&input(&p, &w, 102.0, 3.5)), FilterVerdict::Pass);
        // beyond the hard ceiling nothing helps
        assert!(matches!(filters.evaluate(&input(&p, &w, 104.0, 100.0)), FilterVerdict::Block(_)));
        assert_eq!(filters.evaluate(&input(&p, &w, 100.5, 0.1)), FilterVerdict::Pass);
    }

    #[test]
    fn test_room_to_run() {
        let p = pivot(vec![100.6, 105.0]);
        let w = BarWindow::new(10);
        let filters = PreEntryFilters::new(loose());
        match filters.evaluate(&input(&p, &w, 100.2, 1.0)) {
            FilterVerdict::Block(r) => assert_eq!(r.filter, FilterKind::RoomToRun),
            other => panic!("expected block, got {other:?}"),
        }
        // past the first target the next one has room
        assert_eq!(filters.evaluate(&input(&p, &w, 100.7, 1.0)), FilterVerdict::Pass);
    }

    #[test]
    fn test_rsi_defers_without_history() {
        let p = pivot(vec![]);
        let w = BarWindow::new(10);
        let filters = PreEntryFilters::new(FilterConfig {
            choppiness_enabled: false,
            ..FilterConfig::default()
        });
        assert_eq!(filters.evaluate(&input(&p, &w, 100.2, 1.0)), FilterVerdict::Defer);
    }

    #[test]
    fn test_rsi_overbought_blocks_long() {
        let p = pivot(vec![]);
        let mut agg = crate::trading_core::bars::BarAggregator::new("AAPL", 1, 100);
        let t0 = Utc::now();
        for i in 0..40 {
            let tick = crate::trading_core::trades::Tick::new(
                "AAPL",
                90.0 + i as f64 * 0.3,
                100,
                t0 + chrono::Duration::seconds(i),
            );
            agg.ingest(&tick);
        }
        let filters = PreEntryFilters::new(FilterConfig {
            choppiness_enabled: false,
            ..FilterConfig::default()
        });
        let verdict = filters.evaluate(&input(&p, agg.window(), 100.2, 1.0));
        match verdict {
            FilterVerdict::Block(r) => {
                assert_eq!(r.filter, FilterKind::MomentumZone);
                assert_eq!(r.threshold, 80.0);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }
}
