//! Tick-to-bar aggregation with a bounded rolling window
//!
//! Two index spaces exist and must never be confused:
//!
//! - [`BarSeq`] - absolute sequence number of a bar. Strictly increasing for
//!   the life of the instrument (and across restarts via
//!   [`BarWindow::resume_from`]); never reused.
//! - [`Slot`] - position inside the window's array view, `0..capacity`. Valid
//!   only until the next bar closes.
//!
//! Callers keep `BarSeq` values across bars and resolve them with
//! [`BarWindow::map_absolute_to_array`] / [`BarWindow::get`] every time. A
//! `None` from those lookups means the bar rotated out and is an ordinary
//! outcome, not an error.
//!
//! The window has `capacity` slots and the last one is reserved for the bar
//! currently forming, so at most `capacity - 1` closed bars are retained.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::imbalance::{TickRuleClassifier, VolumeImbalance};
use super::trades::{Side, Tick};

/// Absolute bar sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BarSeq(pub u64);

impl BarSeq {
    pub fn next(self) -> Self {
        BarSeq(self.0 + 1)
    }

    /// Bars elapsed from `earlier` to `self`; None if `earlier` is ahead
    pub fn bars_since(self, earlier: BarSeq) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }

    pub fn offset(self, bars: u64) -> Self {
        BarSeq(self.0 + bars)
    }
}

impl std::fmt::Display for BarSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Window-relative array position. Do not store across bar closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot(pub usize);

/// Fixed-duration OHLCV bar, immutable once closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub seq: BarSeq,
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Buyer-initiated volume by the tick rule
    pub buy_volume: u64,
    /// Seller-initiated volume by the tick rule
    pub sell_volume: u64,
    pub trade_count: u64,
}

impl Bar {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn imbalance(&self) -> VolumeImbalance {
        VolumeImbalance {
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            unclassified_volume: self.volume.saturating_sub(self.buy_volume + self.sell_volume),
        }
    }
}

/// Requested range cannot be served from the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("bar {requested} evicted (oldest retained is {oldest:?})")]
    Evicted { requested: BarSeq, oldest: Option<BarSeq> },
    #[error("bar {requested} not closed yet (latest closed is {latest:?})")]
    NotYetClosed { requested: BarSeq, latest: Option<BarSeq> },
    #[error("inverted range {from}..={to}")]
    InvertedRange { from: BarSeq, to: BarSeq },
}

/// Bounded rolling window of closed bars for one instrument
#[derive(Debug, Clone)]
pub struct BarWindow {
    capacity: usize,
    bars: VecDeque<Bar>,
    next_seq: BarSeq,
}

impl BarWindow {
    /// `capacity` counts the forming slot; values below 2 are raised to 2
    pub fn new(capacity: usize) -> Self {
        Self::resume_from(capacity, BarSeq(0))
    }

    /// Continue numbering from a persisted sequence after a restart
    pub fn resume_from(capacity: usize, next_seq: BarSeq) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            bars: VecDeque::with_capacity(capacity - 1),
            next_seq,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Absolute index of the head (the bar forming next). Monotonic, never capped.
    pub fn absolute_index(&self) -> BarSeq {
        self.next_seq
    }

    /// Array position of the head, `0..capacity`
    pub fn array_index(&self) -> Slot {
        Slot(self.bars.len())
    }

    pub fn oldest_seq(&self) -> Option<BarSeq> {
        self.bars.front().map(|b| b.seq)
    }

    pub fn latest_seq(&self) -> Option<BarSeq> {
        self.bars.back().map(|b| b.seq)
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Resolve an absolute index to its current slot; None once evicted or not yet closed
    pub fn map_absolute_to_array(&self, seq: BarSeq) -> Option<Slot> {
        let oldest = self.oldest_seq()?;
        let offset = seq.bars_since(oldest)?;
        let slot = usize::try_from(offset).ok()?;
        (slot < self.bars.len()).then_some(Slot(slot))
    }

    pub fn get(&self, seq: BarSeq) -> Option<&Bar> {
        let Slot(slot) = self.map_absolute_to_array(seq)?;
        self.bars.get(slot)
    }

    /// Closed bars `from..=to` in order, or why they cannot all be served
    pub fn bars_in_range(&self, from: BarSeq, to: BarSeq) -> Result<Vec<&Bar>, WindowError> {
        if from > to {
            return Err(WindowError::InvertedRange { from, to });
        }
        let latest = self.latest_seq();
        if latest.map_or(true, |l| to > l) {
            return Err(WindowError::NotYetClosed { requested: to, latest });
        }
        let Slot(start) = self.map_absolute_to_array(from).ok_or(WindowError::Evicted {
            requested: from,
            oldest: self.oldest_seq(),
        })?;
        let Slot(end) = self.map_absolute_to_array(to).ok_or(WindowError::Evicted {
            requested: to,
            oldest: self.oldest_seq(),
        })?;
        Ok(self.bars.range(start..=end).collect())
    }

    /// Last `n` closed bars, oldest first
    pub fn recent(&self, n: usize) -> Vec<&Bar> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).collect()
    }

    /// Closed bars strictly before `seq`, at most `n`, oldest first
    pub fn recent_before(&self, seq: BarSeq, n: usize) -> Vec<&Bar> {
        let before: Vec<&Bar> = self.bars.iter().take_while(|b| b.seq < seq).collect();
        let skip = before.len().saturating_sub(n);
        before.into_iter().skip(skip).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    /// Freeze a bar into the window, assigning the next absolute index
    fn append(&mut self, mut bar: Bar) -> Bar {
        bar.seq = self.next_seq;
        self.next_seq = self.next_seq.next();
        self.bars.push_back(bar.clone());
        while self.bars.len() > self.capacity - 1 {
            self.bars.pop_front();
        }
        bar
    }
}

/// Bar under construction
#[derive(Debug, Clone)]
struct BarBuilder {
    start_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    buy_volume: u64,
    sell_volume: u64,
    trade_count: u64,
}

impl BarBuilder {
    fn new(start_time: DateTime<Utc>, price: f64) -> Self {
        Self {
            start_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            buy_volume: 0,
            sell_volume: 0,
            trade_count: 0,
        }
    }

    fn add_trade(&mut self, price: f64, size: u64, side: Option<Side>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
        match side {
            Some(Side::Buy) => self.buy_volume += size,
            Some(Side::Sell) => self.sell_volume += size,
            None => {}
        }
        self.trade_count += 1;
    }

    fn to_bar(&self, symbol: &str) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            seq: BarSeq::default(),
            start_time: self.start_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            trade_count: self.trade_count,
        }
    }
}

/// Aggregates ticks for one symbol into fixed-duration bars
#[derive(Debug, Clone)]
pub struct BarAggregator {
    symbol: String,
    bar_duration: Duration,
    window: BarWindow,
    current: Option<BarBuilder>,
    classifier: TickRuleClassifier,
    /// Start of the bucket following the last closed bar
    next_bucket: Option<DateTime<Utc>>,
    last_close: Option<f64>,
    last_tick_time: Option<DateTime<Utc>>,
}

impl BarAggregator {
    pub fn new(symbol: &str, bar_seconds: u32, capacity: usize) -> Self {
        Self::with_window(symbol, bar_seconds, BarWindow::new(capacity))
    }

    pub fn with_window(symbol: &str, bar_seconds: u32, window: BarWindow) -> Self {
        Self {
            symbol: symbol.to_string(),
            bar_duration: Duration::seconds(i64::from(bar_seconds.max(1))),
            window,
            current: None,
            classifier: TickRuleClassifier::new(),
            next_bucket: None,
            last_close: None,
            last_tick_time: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn window(&self) -> &BarWindow {
        &self.window
    }

    pub fn bar_duration(&self) -> Duration {
        self.bar_duration
    }

    /// Floor a timestamp to its bucket start
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.bar_duration.num_milliseconds();
        let floored = ts.timestamp_millis().div_euclid(width) * width;
        DateTime::<Utc>::from_timestamp_millis(floored).unwrap_or(ts)
    }

    /// Add a tick; returns every bar closed as a consequence (including gap fillers)
    pub fn ingest(&mut self, tick: &Tick) -> Vec<Bar> {
        if let Some(last) = self.last_tick_time {
            if tick.ts_event < last {
                warn!(
                    "{}: out-of-order tick at {} (last {}), dropped",
                    self.symbol, tick.ts_event, last
                );
                return Vec::new();
            }
        }
        if !tick.price.is_finite() || tick.price <= 0.0 {
            warn!("{}: invalid tick price {}, dropped", self.symbol, tick.price);
            return Vec::new();
        }
        self.last_tick_time = Some(tick.ts_event);

        let bucket = self.bucket_start(tick.ts_event);
        let mut closed = self.close_if_due(tick.ts_event);

        if self.current.is_none() {
            closed.extend(self.fill_gaps(bucket));
            self.current = Some(BarBuilder::new(bucket, tick.price));
        }

        let side = self.classifier.classify(tick.price);
        if let Some(bar) = self.current.as_mut() {
            bar.add_trade(tick.price, tick.size, side);
        }
        closed
    }

    /// Freeze the forming bar if its bucket has elapsed at `now`
    pub fn close_if_due(&mut self, now: DateTime<Utc>) -> Vec<Bar> {
        let Some(builder) = self.current.as_ref() else {
            return Vec::new();
        };
        if now < builder.start_time + self.bar_duration {
            return Vec::new();
        }
        let bar = builder.to_bar(&self.symbol);
        self.current = None;
        self.next_bucket = Some(bar.start_time + self.bar_duration);
        self.last_close = Some(bar.close);
        vec![self.window.append(bar)]
    }

    /// Zero-volume bars at the previous close for buckets skipped before `bucket`
    fn fill_gaps(&mut self, bucket: DateTime<Utc>) -> Vec<Bar> {
        let (Some(mut next), Some(close)) = (self.next_bucket, self.last_close) else {
            return Vec::new();
        };
        let mut filled = Vec::new();
        let max_fill = self.window.capacity();
        while next < bucket {
            if filled.len() >= max_fill {
                debug!(
                    "{}: gap longer than window ({} bars), skipping ahead to {}",
                    self.symbol, max_fill, bucket
                );
                break;
            }
            let gap = BarBuilder::new(next, close);
            filled.push(self.window.append(gap.to_bar(&self.symbol)));
            next = next + self.bar_duration;
        }
        self.next_bucket = Some(bucket);
        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap()
    }

    fn tick(secs: i64, price: f64, size: u64) -> Tick {
        Tick::new("AAPL", price, size, t0() + Duration::milliseconds(secs * 1000))
    }

    fn bar_at(seq: u64) -> Bar {
        Bar {
            symbol: "AAPL".to_string(),
            seq: BarSeq(seq),
            start_time: t0(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
            buy_volume: 0,
            sell_volume: 0,
            trade_count: 1,
        }
    }

    #[test]
    fn test_capacity_four_scenario() {
        let mut w = BarWindow::new(4);
        for i in 0..=5 {
            w.append(bar_at(i));
        }
        assert_eq!(w.map_absolute_to_array(BarSeq(1)), None);
        assert_eq!(w.map_absolute_to_array(BarSeq(3)), Some(Slot(0)));
        assert_eq!(w.map_absolute_to_array(BarSeq(5)), Some(Slot(2)));
        assert_eq!(w.absolute_index(), BarSeq(6));
        assert_eq!(w.array_index(), Slot(3));
    }

    #[test]
    fn test_bars_in_range() {
        let mut w = BarWindow::new(4);
        for i in 0..=5 {
            w.append(bar_at(i));
        }
        let seqs: Vec<u64> = w
            .bars_in_range(BarSeq(3), BarSeq(5))
            .unwrap()
            .iter()
            .map(|b| b.seq.0)
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        assert!(matches!(
            w.bars_in_range(BarSeq(2), BarSeq(4)),
            Err(WindowError::Evicted { .. })
        ));
        assert!(matches!(
            w.bars_in_range(BarSeq(4), BarSeq(6)),
            Err(WindowError::NotYetClosed { .. })
        ));
        assert!(matches!(
            w.bars_in_range(BarSeq(5), BarSeq(4)),
            Err(WindowError::InvertedRange { .. })
        ));
    }

    #[test]
    fn test_resume_keeps_numbering() {
        let mut w = BarWindow::resume_from(10, BarSeq(1000));
        let bar = w.append(bar_at(0));
        assert_eq!(bar.seq, BarSeq(1000));
        assert_eq!(w.absolute_index(), BarSeq(1001));
    }

    #[test]
    fn test_ingest_builds_ohlcv() {
        let mut agg = BarAggregator::new("AAPL", 5, 100);
        assert!(agg.ingest(&tick(0, 10.0, 100)).is_empty());
        assert!(agg.ingest(&tick(1, 10.2, 50)).is_empty());
        assert!(agg.ingest(&tick(2, 9.9, 70)).is_empty());
        assert!(agg.ingest(&tick(4, 10.1, 30)).is_empty());

        let closed = agg.ingest(&tick(5, 10.3, 10));
        assert_eq!(closed.len(), 1);
        let bar = &closed[0];
        assert_eq!(bar.seq, BarSeq(0));
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.high, 10.2);
        assert_eq!(bar.low, 9.9);
        assert_eq!(bar.close, 10.1);
        assert_eq!(bar.volume, 250);
        // first print unclassified, then up, down, up
        assert_eq!(bar.buy_volume, 80);
        assert_eq!(bar.sell_volume, 70);
    }

    #[test]
    fn test_gap_filled_at_previous_close() {
        let mut agg = BarAggregator::new("AAPL", 5, 100);
        agg.ingest(&tick(0, 10.0, 100));
        agg.ingest(&tick(3, 10.5, 100));
        // next print 3 buckets later: closes bucket 0, fills buckets 1 and 2
        let closed = agg.ingest(&tick(16, 11.0, 10));
        assert_eq!(closed.len(), 3);
        assert_eq!(closed[0].close, 10.5);
        for gap in &closed[1..] {
            assert_eq!(gap.volume, 0);
            assert_eq!(gap.open, 10.5);
            assert_eq!(gap.close, 10.5);
        }
        let seqs: Vec<u64> = closed.iter().map(|b| b.seq.0).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_close_if_due_then_gap() {
        let mut agg = BarAggregator::new("AAPL", 5, 100);
        agg.ingest(&tick(0, 10.0, 100));
        assert!(agg.close_if_due(t0() + Duration::seconds(4)).is_empty());
        let closed = agg.close_if_due(t0() + Duration::seconds(5));
        assert_eq!(closed.len(), 1);
        assert!(agg.close_if_due(t0() + Duration::seconds(30)).is_empty());

        let closed = agg.ingest(&tick(12, 10.1, 5));
        assert_eq!(closed.len(), 1, "bucket 5..10 filled before opening 10..15");
        assert_eq!(closed[0].volume, 0);
        assert_eq!(closed[0].seq, BarSeq(1));
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let mut agg = BarAggregator::new("AAPL", 5, 100);
        agg.ingest(&tick(6, 10.0, 100));
        assert!(agg.ingest(&tick(2, 9.0, 100)).is_empty());
        let closed = agg.ingest(&tick(10, 10.0, 1));
        assert_eq!(closed[0].low, 10.0);
    }
}
