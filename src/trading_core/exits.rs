//! Exit strategies
//!
//! Partial-exit level sequencing and the stuck-position rule both sit behind
//! traits, selected from config:
//!
//! - [`ExitLadder`]: fixed risk multiples of the initial risk, or a sequence of
//!   technical levels (scanner targets and moving averages) ordered by
//!   distance from entry.
//! - [`StuckPolicy`]: tighten to a small buffer around entry once, or never.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::levels::Direction;

/// One partial-exit level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderLevel {
    pub price: f64,
    /// Fraction of the original size to close here
    pub fraction: f64,
}

/// What a ladder can see when a position opens
#[derive(Debug, Clone, Copy)]
pub struct LadderContext<'a> {
    pub direction: Direction,
    pub entry_price: f64,
    pub initial_stop: f64,
    /// Scanner targets for the symbol
    pub targets: &'a [f64],
    /// Moving averages at entry time
    pub moving_averages: &'a [f64],
}

impl LadderContext<'_> {
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }
}

pub trait ExitLadder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Levels nearest-first, all strictly beyond entry
    fn levels(&self, ctx: &LadderContext<'_>) -> Vec<LadderLevel>;
}

/// Levels at fixed multiples of the initial risk
#[derive(Debug, Clone)]
pub struct RiskMultipleLadder {
    pub multiples: Vec<f64>,
    pub fractions: Vec<f64>,
}

impl ExitLadder for RiskMultipleLadder {
    fn name(&self) -> &'static str {
        "risk_multiples"
    }

    fn levels(&self, ctx: &LadderContext<'_>) -> Vec<LadderLevel> {
        let risk = ctx.initial_risk();
        if risk <= 0.0 {
            return Vec::new();
        }
        self.multiples
            .iter()
            .zip(&self.fractions)
            .map(|(r, fraction)| LadderLevel {
                price: ctx.entry_price + ctx.direction.sign() * r * risk,
                fraction: *fraction,
            })
            .collect()
    }
}

/// Scanner targets and moving averages beyond entry, nearest first
#[derive(Debug, Clone)]
pub struct TechnicalLevelLadder {
    pub fractions: Vec<f64>,
    /// Levels closer together than this (%) collapse into one
    pub min_spacing_pct: f64,
}

impl ExitLadder for TechnicalLevelLadder {
    fn name(&self) -> &'static str {
        "technical_levels"
    }

    fn levels(&self, ctx: &LadderContext<'_>) -> Vec<LadderLevel> {
        let mut candidates: Vec<f64> = ctx
            .targets
            .iter()
            .chain(ctx.moving_averages)
            .copied()
            .filter(|p| p.is_finite() && ctx.direction.is_beyond(*p, ctx.entry_price))
            .collect();
        candidates.sort_by(|a, b| {
            (a - ctx.entry_price)
                .abs()
                .total_cmp(&(b - ctx.entry_price).abs())
        });

        let mut spaced: Vec<f64> = Vec::new();
        for price in candidates {
            let far_enough = spaced
                .last()
                .map_or(true, |prev| (price - prev).abs() / prev * 100.0 >= self.min_spacing_pct);
            if far_enough {
                spaced.push(price);
            }
        }

        spaced
            .into_iter()
            .zip(&self.fractions)
            .map(|(price, fraction)| LadderLevel {
                price,
                fraction: *fraction,
            })
            .collect()
    }
}

/// Facts the stuck rule needs about an open position
#[derive(Debug, Clone, Copy)]
pub struct StuckCheck {
    pub direction: Direction,
    pub entry_price: f64,
    pub initial_risk: f64,
    pub elapsed: Duration,
    pub partials_taken: usize,
    /// Best favorable move from entry so far, in price units
    pub max_favorable_excursion: f64,
}

pub trait StuckPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// New stop when the position counts as stuck
    fn tightened_stop(&self, check: &StuckCheck) -> Option<f64>;
}

/// Tighten to `entry -/+ buffer` when nothing happened within the window
#[derive(Debug, Clone)]
pub struct TightenToEntry {
    pub after: Duration,
    /// Excursion (in R) that counts as meaningful progress
    pub min_progress_r: f64,
    pub buffer_pct: f64,
}

impl StuckPolicy for TightenToEntry {
    fn name(&self) -> &'static str {
        "tighten_to_entry"
    }

    fn tightened_stop(&self, check: &StuckCheck) -> Option<f64> {
        if check.partials_taken > 0 || check.elapsed < self.after {
            return None;
        }
        let progress_r = if check.initial_risk > 0.0 {
            check.max_favorable_excursion / check.initial_risk
        } else {
            0.0
        };
        if progress_r >= self.min_progress_r {
            return None;
        }
        Some(check.direction.offset_pct(check.entry_price, -self.buffer_pct))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NeverStuck;

impl StuckPolicy for NeverStuck {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn tightened_stop(&self, _check: &StuckCheck) -> Option<f64> {
        None
    }
}

/// Serializable ladder selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LadderConfig {
    RiskMultiples {
        multiples: Vec<f64>,
        fractions: Vec<f64>,
    },
    TechnicalLevels {
        fractions: Vec<f64>,
        #[serde(default)]
        min_spacing_pct: f64,
        /// Moving-average periods (bars) offered as levels
        #[serde(default)]
        sma_periods: Vec<usize>,
    },
}

impl Default for LadderConfig {
    fn default() -> Self {
        LadderConfig::RiskMultiples {
            multiples: vec![1.0, 2.0],
            fractions: vec![0.5, 0.25],
        }
    }
}

impl LadderConfig {
    pub fn build(&self) -> Box<dyn ExitLadder> {
        match self {
            LadderConfig::RiskMultiples { multiples, fractions } => Box::new(RiskMultipleLadder {
                multiples: multiples.clone(),
                fractions: fractions.clone(),
            }),
            LadderConfig::TechnicalLevels {
                fractions,
                min_spacing_pct,
                ..
            } => Box::new(TechnicalLevelLadder {
                fractions: fractions.clone(),
                min_spacing_pct: *min_spacing_pct,
            }),
        }
    }

    pub fn sma_periods(&self) -> &[usize] {
        match self {
            LadderConfig::TechnicalLevels { sma_periods, .. } => sma_periods,
            LadderConfig::RiskMultiples { .. } => &[],
        }
    }
}

/// Serializable stuck-rule selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StuckConfig {
    TightenToEntry {
        after_minutes: i64,
        min_progress_r: f64,
        buffer_pct: f64,
    },
    Disabled,
}

impl Default for StuckConfig {
    fn default() -> Self {
        StuckConfig::TightenToEntry {
            after_minutes: 30,
            min_progress_r: 0.5,
            buffer_pct: 0.1,
        }
    }
}

impl StuckConfig {
    pub fn build(&self) -> Box<dyn StuckPolicy> {
        match self {
            StuckConfig::TightenToEntry {
                after_minutes,
                min_progress_r,
                buffer_pct,
            } => Box::new(TightenToEntry {
                after: Duration::minutes(*after_minutes),
                min_progress_r: *min_progress_r,
                buffer_pct: *buffer_pct,
            }),
            StuckConfig::Disabled => Box::new(NeverStuck),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(targets: &'a [f64], mas: &'a [f64]) -> LadderContext<'a> {
        LadderContext {
            direction: Direction::Long,
            entry_price: 100.0,
            initial_stop: 99.0,
            targets,
            moving_averages: mas,
        }
    }

    #[test]
    fn test_risk_multiples() {
        let ladder = LadderConfig::default().build();
        let levels = ladder.levels(&ctx(&[], &[]));
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 101.0);
        assert_eq!(levels[0].fraction, 0.5);
        assert_eq!(levels[1].price, 102.0);
    }

    #[test]
    fn test_risk_multiples_short() {
        let ladder = LadderConfig::default().build();
        let levels = ladder.levels(&LadderContext {
            direction: Direction::Short,
            entry_price: 100.0,
            initial_stop: 101.0,
            targets: &[],
            moving_averages: &[],
        });
        assert_eq!(levels[0].price, 99.0);
        assert_eq!(levels[1].price, 98.0);
    }

    #[test]
    fn test_technical_levels_sorted_and_spaced() {
        let ladder = TechnicalLevelLadder {
            fractions: vec![0.5, 0.25],
            min_spacing_pct: 0.2,
        };
        let levels = ladder.levels(&ctx(&[102.0, 105.0, 98.0], &[101.0, 101.1]));
        let prices: Vec<f64> = levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![101.0, 102.0]);
    }

    #[test]
    fn test_tighten_to_entry_once_stuck() {
        let policy = StuckConfig::default().build();
        let mut check = StuckCheck {
            direction: Direction::Long,
            entry_price: 100.0,
            initial_risk: 1.0,
            elapsed: Duration::minutes(29),
            partials_taken: 0,
            max_favorable_excursion: 0.2,
        };
        assert_eq!(policy.tightened_stop(&check), None);
        check.elapsed = Duration::minutes(30);
        let stop = policy.tightened_stop(&check).unwrap();
        assert!((stop - 99.9).abs() < 1e-9);
        check.max_favorable_excursion = 0.6;
        assert_eq!(policy.tightened_stop(&check), None);
    }

    #[test]
    fn test_config_round_trips_tagged() {
        let json = r#"{"kind":"technical_levels","fractions":[0.5,0.25],"sma_periods":[20]}"#;
        let cfg: LadderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.sma_periods(), &[20]);
        assert_eq!(cfg.build().name(), "technical_levels");
    }
}
