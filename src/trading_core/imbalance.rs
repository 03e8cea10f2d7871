//! Volume imbalance (buy vs sell pressure)
//!
//! Volume is attributed to the aggressor with the tick rule: a print above the
//! previous print is buyer-initiated, below is seller-initiated, and an
//! unchanged print inherits the side of the last price change. The very first
//! print of a stream has no reference and stays unclassified.
//!
//! Imbalance is always expressed in percent of total volume, unclassified
//! prints included:
//!
//! `imbalance_pct = (sell - buy) / total * 100`
//!
//! so -100 is all buying, +100 all selling. Absolute-volume thresholds are
//! deliberately absent so the same settings work on thin and liquid names.

use serde::{Deserialize, Serialize};

use super::bars::Bar;
use super::levels::Direction;
use super::trades::{Side, Tick};

/// Thresholds for imbalance classification and the CVD confirmation path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceConfig {
    /// |imbalance_pct| at or beyond this is directional (default: 20)
    pub threshold_pct: f64,
    /// Single bar at or beyond this confirms on its own (default: 45)
    pub strong_bar_pct: f64,
    /// Lower per-bar threshold for a run of consecutive bars (default: 20)
    pub sustained_pct: f64,
    /// Consecutive bars needed at `sustained_pct` (default: 3)
    pub sustained_bars: u32,
}

impl Default for ImbalanceConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 20.0,
            strong_bar_pct: 45.0,
            sustained_pct: 20.0,
            sustained_bars: 3,
        }
    }
}

/// Stateful uptick/downtick classifier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickRuleClassifier {
    last_price: Option<f64>,
    last_side: Option<Side>,
}

impl TickRuleClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a reference price (e.g. the previous bar's close)
    pub fn with_reference(price: f64) -> Self {
        Self {
            last_price: Some(price),
            last_side: None,
        }
    }

    /// Classify a print relative to the previous one
    pub fn classify(&mut self, price: f64) -> Option<Side> {
        let side = match self.last_price {
            None => None,
            Some(prev) if price > prev => Some(Side::Buy),
            Some(prev) if price < prev => Some(Side::Sell),
            Some(_) => self.last_side,
        };
        self.last_price = Some(price);
        if side.is_some() {
            self.last_side = side;
        }
        side
    }
}

/// Directional label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImbalanceBias {
    Bullish,
    Bearish,
    Neutral,
}

impl ImbalanceBias {
    pub fn favors(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (ImbalanceBias::Bullish, Direction::Long) | (ImbalanceBias::Bearish, Direction::Short)
        )
    }
}

impl std::fmt::Display for ImbalanceBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImbalanceBias::Bullish => write!(f, "BULLISH"),
            ImbalanceBias::Bearish => write!(f, "BEARISH"),
            ImbalanceBias::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Classified reading for a bar or window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceSignal {
    pub imbalance_pct: f64,
    pub bias: ImbalanceBias,
}

impl ImbalanceSignal {
    /// Imbalance magnitude in favor of `direction` (negative when it opposes)
    pub fn strength_for(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => -self.imbalance_pct,
            Direction::Short => self.imbalance_pct,
        }
    }
}

/// Aggressor volume totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeImbalance {
    pub buy_volume: u64,
    pub sell_volume: u64,
    /// Prints with no reference price (first of a stream)
    #[serde(default)]
    pub unclassified_volume: u64,
}

impl VolumeImbalance {
    pub fn add(&mut self, side: Side, size: u64) {
        match side {
            Side::Buy => self.buy_volume += size,
            Side::Sell => self.sell_volume += size,
        }
    }

    /// Classify every tick in order. `reference` is the last price before the first tick.
    pub fn from_ticks(ticks: &[Tick], reference: Option<f64>) -> Self {
        let mut classifier = match reference {
            Some(price) => TickRuleClassifier::with_reference(price),
            None => TickRuleClassifier::new(),
        };
        let mut totals = Self::default();
        for tick in ticks {
            match classifier.classify(tick.price) {
                Some(side) => totals.add(side, tick.size),
                None => totals.unclassified_volume += tick.size,
            }
        }
        totals
    }

    /// Sum the per-bar aggressor volumes of a window
    pub fn from_bars<'a>(bars: impl IntoIterator<Item = &'a Bar>) -> Self {
        bars.into_iter().fold(Self::default(), |mut acc, bar| {
            acc.buy_volume += bar.buy_volume;
            acc.sell_volume += bar.sell_volume;
            acc.unclassified_volume += bar.volume.saturating_sub(bar.buy_volume + bar.sell_volume);
            acc
        })
    }

    pub fn total(&self) -> u64 {
        self.buy_volume + self.sell_volume + self.unclassified_volume
    }

    /// Signed percentage of total volume; None when nothing was classified
    pub fn imbalance_pct(&self) -> Option<f64> {
        if self.buy_volume + self.sell_volume == 0 {
            return None;
        }
        let total = self.total();
        Some((self.sell_volume as f64 - self.buy_volume as f64) / total as f64 * 100.0)
    }

    /// Label against a percentage threshold; None when nothing was classified
    pub fn signal(&self, threshold_pct: f64) -> Option<ImbalanceSignal> {
        let pct = self.imbalance_pct()?;
        let bias = if pct <= -threshold_pct {
            ImbalanceBias::Bullish
        } else if pct >= threshold_pct {
            ImbalanceBias::Bearish
        } else {
            ImbalanceBias::Neutral
        };
        Some(ImbalanceSignal {
            imbalance_pct: pct,
            bias,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ticks(prices: &[(f64, u64)]) -> Vec<Tick> {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, (p, s))| Tick::new("AAPL", *p, *s, t0 + chrono::Duration::milliseconds(i as i64)))
            .collect()
    }

    #[test]
    fn test_zero_tick_inherits_last_side() {
        let mut c = TickRuleClassifier::new();
        assert_eq!(c.classify(10.0), None);
        assert_eq!(c.classify(10.01), Some(Side::Buy));
        assert_eq!(c.classify(10.01), Some(Side::Buy));
        assert_eq!(c.classify(10.00), Some(Side::Sell));
        assert_eq!(c.classify(10.00), Some(Side::Sell));
    }

    #[test]
    fn test_all_buy_is_minus_100() {
        let t = ticks(&[(10.0, 100), (10.01, 200), (10.02, 300)]);
        let imb = VolumeImbalance::from_ticks(&t, Some(9.99));
        assert_eq!(imb.sell_volume, 0);
        assert_eq!(imb.imbalance_pct(), Some(-100.0));
        assert_eq!(imb.signal(20.0).unwrap().bias, ImbalanceBias::Bullish);
    }

    #[test]
    fn test_all_sell_is_plus_100() {
        let t = ticks(&[(10.0, 100), (9.99, 200), (9.98, 300)]);
        let imb = VolumeImbalance::from_ticks(&t, Some(10.01));
        assert_eq!(imb.imbalance_pct(), Some(100.0));
        assert_eq!(imb.signal(20.0).unwrap().bias, ImbalanceBias::Bearish);
    }

    #[test]
    fn test_balanced_is_zero() {
        let imb = VolumeImbalance {
            buy_volume: 500,
            sell_volume: 500,
            ..VolumeImbalance::default()
        };
        assert_eq!(imb.imbalance_pct(), Some(0.0));
        assert_eq!(imb.signal(20.0).unwrap().bias, ImbalanceBias::Neutral);
    }

    #[test]
    fn test_full_population_not_tail() {
        // A heavy early buy burst must still count even though the tail is selling
        let mut prices = vec![(10.0, 5000), (10.05, 5000)];
        for i in 0..50 {
            prices.push((10.05 - 0.001 * (i + 1) as f64, 10));
        }
        let imb = VolumeImbalance::from_ticks(&ticks(&prices), Some(9.99));
        assert!(imb.imbalance_pct().unwrap() < -80.0);
    }

    #[test]
    fn test_unclassified_first_print_counts_in_total() {
        // 100 unclassified, 300 buy: -300 / 400
        let t = ticks(&[(10.0, 100), (10.01, 300)]);
        let imb = VolumeImbalance::from_ticks(&t, None);
        assert_eq!(imb.unclassified_volume, 100);
        assert_eq!(imb.total(), 400);
        assert_eq!(imb.imbalance_pct(), Some(-75.0));
    }

    #[test]
    fn test_only_unclassified_has_no_reading() {
        let imb = VolumeImbalance::from_ticks(&ticks(&[(10.0, 100)]), None);
        assert_eq!(imb.imbalance_pct(), None);
    }

    #[test]
    fn test_empty_has_no_reading() {
        let imb = VolumeImbalance::default();
        assert_eq!(imb.imbalance_pct(), None);
        assert!(imb.signal(20.0).is_none());
    }

    #[test]
    fn test_strength_for_direction() {
        let sig = ImbalanceSignal {
            imbalance_pct: -60.0,
            bias: ImbalanceBias::Bullish,
        };
        assert_eq!(sig.strength_for(Direction::Long), 60.0);
        assert_eq!(sig.strength_for(Direction::Short), -60.0);
        assert!(sig.bias.favors(Direction::Long));
    }
}
