//! Breakout Confirmation State Machine
//!
//! One machine per instrument, fed every closed bar:
//!
//! 1. IDLE - wait for a close beyond the pivot
//! 2. BREAKOUT_DETECTED - wait for the enclosing candle (N bars) to close
//! 3. Candle close: strong volume and size -> MOMENTUM (enter now), otherwise
//!    WEAK_TRACKING with three parallel paths, any of which may confirm:
//!    - PULLBACK_RETEST: touch the pivot band, then re-cross on a volume spike
//!    - SUSTAINED_HOLD: stay on the breakout side for N bars
//!    - CVD_MONITORING: one strong imbalance bar or a run of moderate ones
//! 4. ENTERED / BLOCKED / EXPIRED, then back to IDLE (disarmed until price
//!    returns to the pivot's near side)
//!
//! The machine judges the bar it is handed; the window only serves history
//! (candle, volume baseline, filters). A gap can close several bars in one
//! call and each must be fed in order.
//!
//! All bar positions are absolute [`BarSeq`] values resolved through the
//! window on every use. Missing bars defer the decision to the next bar, and a
//! candle partly evicted (e.g. after a restart) is judged on what remains.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::bars::{Bar, BarSeq, BarWindow, WindowError};
use super::filters::{FilterConfig, FilterInput, FilterVerdict, PreEntryFilters, Rejection};
use super::imbalance::ImbalanceConfig;
use super::indicators;
use super::levels::{Direction, PivotLevel};

/// Configuration for breakout confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutConfig {
    /// Aggregator bars per confirmation candle (default: 12 = 1 minute of 5s bars)
    pub bars_per_candle: u64,
    /// Bars before the candle used for the volume baseline (default: 60)
    pub volume_lookback_bars: usize,
    /// Candle volume / baseline candle volume for a strong breakout (default: 2.0)
    pub strong_volume_ratio: f64,
    /// Candle high-low range as % of pivot for a strong breakout (default: 0.3)
    pub strong_candle_pct: f64,
    pub retest_enabled: bool,
    /// Band around the pivot (%) counted as a retest touch (default: 0.3)
    pub retest_tolerance_pct: f64,
    /// Bars after the touch allowed for the re-cross (default: 24)
    pub retest_window_bars: u64,
    /// Re-cross bar volume / baseline bar volume (default: 1.5)
    pub retest_volume_spike: f64,
    pub hold_enabled: bool,
    /// Bars on the breakout side needed to confirm (default: 24)
    pub hold_bars: u64,
    /// Pullback through the pivot (%) tolerated while holding (default: 0.2)
    pub hold_max_pullback_pct: f64,
    pub cvd_enabled: bool,
    pub imbalance: ImbalanceConfig,
    /// Close this far (%) back through the pivot fails the breakout (default: 1.0)
    pub failure_pct: f64,
    /// Bars after the breakout before a pending state is force-expired (default: 120)
    pub max_pending_bars: u64,
    pub filters: FilterConfig,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            bars_per_candle: 12,
            volume_lookback_bars: 60,
            strong_volume_ratio: 2.0,
            strong_candle_pct: 0.3,
            retest_enabled: true,
            retest_tolerance_pct: 0.3,
            retest_window_bars: 24,
            retest_volume_spike: 1.5,
            hold_enabled: true,
            hold_bars: 24,
            hold_max_pullback_pct: 0.2,
            cvd_enabled: true,
            imbalance: ImbalanceConfig::default(),
            failure_pct: 1.0,
            max_pending_bars: 120,
            filters: FilterConfig::default(),
        }
    }
}

/// Which path confirmed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmPath {
    Momentum,
    PullbackRetest,
    SustainedHold,
    CvdImbalance,
}

impl std::fmt::Display for ConfirmPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmPath::Momentum => write!(f, "MOMENTUM"),
            ConfirmPath::PullbackRetest => write!(f, "PULLBACK_RETEST"),
            ConfirmPath::SustainedHold => write!(f, "SUSTAINED_HOLD"),
            ConfirmPath::CvdImbalance => write!(f, "CVD_MONITORING"),
        }
    }
}

/// Phase label for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    BreakoutDetected,
    Momentum,
    WeakTracking,
    PullbackRetest,
    SustainedHold,
    CvdMonitoring,
    Entered,
    Blocked,
    Expired,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "IDLE"),
            Phase::BreakoutDetected => write!(f, "BREAKOUT_DETECTED"),
            Phase::Momentum => write!(f, "MOMENTUM"),
            Phase::WeakTracking => write!(f, "WEAK_TRACKING"),
            Phase::PullbackRetest => write!(f, "PULLBACK_RETEST"),
            Phase::SustainedHold => write!(f, "SUSTAINED_HOLD"),
            Phase::CvdMonitoring => write!(f, "CVD_MONITORING"),
            Phase::Entered => write!(f, "ENTERED"),
            Phase::Blocked => write!(f, "BLOCKED"),
            Phase::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Pullback/retest path progress
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RetestPath {
    Disabled,
    AwaitingPullback,
    Touched { touched_seq: BarSeq },
    /// Touched but no qualifying re-cross in time
    Exhausted,
}

/// Live weak-breakout tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakTracking {
    pub breakout_seq: BarSeq,
    pub breakout_price: f64,
    /// Volume ratio of the weak candle
    pub volume_ratio: f64,
    pub retest: RetestPath,
    /// Start of the current uninterrupted hold; None after a violation
    pub hold_start: Option<BarSeq>,
    /// Consecutive bars at the sustained imbalance threshold
    pub cvd_consecutive: u32,
}

/// Persistable breakout state, one variant per pending phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BreakoutState {
    Idle {
        /// False after a terminal outcome until price returns to the near side
        armed: bool,
    },
    AwaitingCandle {
        breakout_seq: BarSeq,
        breakout_price: f64,
        candle_close_seq: BarSeq,
    },
    WeakTracking(WeakTracking),
}

impl Default for BreakoutState {
    fn default() -> Self {
        BreakoutState::Idle { armed: true }
    }
}

impl BreakoutState {
    pub fn is_pending(&self) -> bool {
        !matches!(self, BreakoutState::Idle { .. })
    }

    pub fn breakout_seq(&self) -> Option<BarSeq> {
        match self {
            BreakoutState::Idle { .. } => None,
            BreakoutState::AwaitingCandle { breakout_seq, .. } => Some(*breakout_seq),
            BreakoutState::WeakTracking(t) => Some(t.breakout_seq),
        }
    }
}

/// Confirmed entry handed to the position manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub direction: Direction,
    pub pivot_price: f64,
    pub path: ConfirmPath,
    /// Close of the confirming bar
    pub price: f64,
    pub seq: BarSeq,
    pub volume_ratio: f64,
}

/// Outcome of one bar
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Wait,
    BreakoutDetected { seq: BarSeq, price: f64 },
    Enter(EntrySignal),
    Block(Rejection),
    Expire { reason: String },
}

impl Decision {
    /// Transition this decision reports, None for Wait
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Decision::Wait => None,
            Decision::BreakoutDetected { .. } => Some(Phase::BreakoutDetected),
            Decision::Enter(_) => Some(Phase::Entered),
            Decision::Block(_) => Some(Phase::Blocked),
            Decision::Expire { .. } => Some(Phase::Expired),
        }
    }
}

/// Shared-ledger facts the machine cannot own
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryContext {
    /// Entries already taken on this pivot/side this session
    pub attempts_used: u32,
}

pub struct BreakoutMachine {
    config: BreakoutConfig,
    filters: PreEntryFilters,
    pivot: PivotLevel,
    state: BreakoutState,
}

impl BreakoutMachine {
    pub fn new(pivot: PivotLevel, config: BreakoutConfig) -> Self {
        let filters = PreEntryFilters::new(config.filters.clone());
        Self {
            config,
            filters,
            pivot,
            state: BreakoutState::default(),
        }
    }

    pub fn pivot(&self) -> &PivotLevel {
        &self.pivot
    }

    pub fn direction(&self) -> Direction {
        self.pivot.direction()
    }

    pub fn state(&self) -> &BreakoutState {
        &self.state
    }

    /// Reinstate a persisted state after restart
    pub fn restore(&mut self, state: BreakoutState) {
        self.state = state;
    }

    /// Back to IDLE, armed (new session)
    pub fn reset(&mut self) {
        self.state = BreakoutState::default();
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            BreakoutState::Idle { .. } => Phase::Idle,
            BreakoutState::AwaitingCandle { .. } => Phase::BreakoutDetected,
            BreakoutState::WeakTracking(t) => {
                if matches!(t.retest, RetestPath::Touched { .. }) {
                    Phase::PullbackRetest
                } else if t.hold_start.is_some() && self.config.hold_enabled {
                    Phase::SustainedHold
                } else if t.cvd_consecutive > 0 {
                    Phase::CvdMonitoring
                } else {
                    Phase::WeakTracking
                }
            }
        }
    }

    /// Evaluate one closed bar; `window` must already hold it
    pub fn on_bar(&mut self, bar: &Bar, window: &BarWindow, ctx: EntryContext) -> Decision {
        if window.get(bar.seq).is_none() {
            debug!("{}: bar {} not in window, skipped", self.pivot.symbol, bar.seq);
            return Decision::Wait;
        }

        match self.state.clone() {
            BreakoutState::Idle { armed } => self.on_idle(bar, armed, window, ctx),
            BreakoutState::AwaitingCandle {
                breakout_seq,
                breakout_price,
                candle_close_seq,
            } => self.on_awaiting_candle(bar, breakout_seq, breakout_price, candle_close_seq, window, ctx),
            BreakoutState::WeakTracking(tracking) => self.on_weak_tracking(bar, tracking, window, ctx),
        }
    }

    fn on_idle(&mut self, bar: &Bar, armed: bool, window: &BarWindow, ctx: EntryContext) -> Decision {
        let direction = self.direction();
        let beyond = direction.is_beyond(bar.close, self.pivot.price);

        if !armed {
            if !beyond {
                debug!("{}: re-armed at {:.2}", self.pivot.symbol, bar.close);
                self.state = BreakoutState::Idle { armed: true };
            }
            return Decision::Wait;
        }
        if !beyond {
            return Decision::Wait;
        }
        if ctx.attempts_used >= self.config.filters.max_attempts {
            return Decision::Wait;
        }

        let bpc = self.config.bars_per_candle.max(1);
        let candle_start = (bar.seq.0 / bpc) * bpc;
        let candle_close_seq = BarSeq(candle_start + bpc - 1);
        info!(
            "STATE: BREAKOUT {} {} @ {:.2} | bar {} | candle closes at {}",
            self.pivot.symbol, direction, bar.close, bar.seq, candle_close_seq
        );
        self.state = BreakoutState::AwaitingCandle {
            breakout_seq: bar.seq,
            breakout_price: bar.close,
            candle_close_seq,
        };

        if bar.seq >= candle_close_seq {
            return match self.on_awaiting_candle(bar, bar.seq, bar.close, candle_close_seq, window, ctx) {
                Decision::Wait => Decision::BreakoutDetected {
                    seq: bar.seq,
                    price: bar.close,
                },
                decided => decided,
            };
        }
        Decision::BreakoutDetected {
            seq: bar.seq,
            price: bar.close,
        }
    }

    fn on_awaiting_candle(
        &mut self,
        bar: &Bar,
        breakout_seq: BarSeq,
        breakout_price: f64,
        candle_close_seq: BarSeq,
        window: &BarWindow,
        ctx: EntryContext,
    ) -> Decision {
        if let Some(decision) = self.check_expiry(bar, breakout_seq) {
            return decision;
        }
        if bar.seq < candle_close_seq {
            return Decision::Wait;
        }

        let bpc = self.config.bars_per_candle.max(1);
        let candle_start = BarSeq(candle_close_seq.0 + 1 - bpc);
        let candle = match window.bars_in_range(candle_start, candle_close_seq) {
            Ok(bars) => bars,
            Err(WindowError::NotYetClosed { .. }) => return Decision::Wait,
            Err(WindowError::Evicted { oldest: Some(oldest), .. }) => {
                // Whole candle gone: judge what closed since
                let to = if oldest <= candle_close_seq { candle_close_seq } else { bar.seq };
                match window.bars_in_range(oldest, to) {
                    Ok(bars) => {
                        debug!(
                            "{}: candle {}..={} partly evicted, judging {}..={}",
                            self.pivot.symbol, candle_start, candle_close_seq, oldest, to
                        );
                        bars
                    }
                    Err(e) => {
                        debug!("{}: breakout candle deferred: {}", self.pivot.symbol, e);
                        return Decision::Wait;
                    }
                }
            }
            Err(e) => {
                debug!("{}: breakout candle deferred: {}", self.pivot.symbol, e);
                return Decision::Wait;
            }
        };
        let (Some(first), Some(last)) = (candle.first(), candle.last()) else {
            return Decision::Wait;
        };

        let direction = self.direction();
        if !direction.is_beyond(last.close, self.pivot.price) {
            return self.expire(format!(
                "candle closed back through pivot ({:.2} vs {:.2})",
                last.close, self.pivot.price
            ));
        }

        let candle_volume: u64 = candle.iter().map(|b| b.volume).sum();
        let candle_high = candle.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let candle_low = candle.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let size_pct = (candle_high - candle_low) / self.pivot.price * 100.0;
        // No baseline yet reads as weak; the slower paths can still confirm
        let volume_ratio = self
            .baseline_bar_volume(window, first.seq)
            .map(|avg| candle_volume as f64 / (avg * candle.len() as f64))
            .unwrap_or(0.0);

        if volume_ratio >= self.config.strong_volume_ratio && size_pct >= self.config.strong_candle_pct {
            info!(
                "STATE: MOMENTUM {} | vol ratio {:.2} | candle {:.2}%",
                self.pivot.symbol, volume_ratio, size_pct
            );
            return self
                .confirm(ConfirmPath::Momentum, bar, breakout_seq, volume_ratio, window, ctx)
                .unwrap_or(Decision::Wait);
        }

        info!(
            "STATE: WEAK_TRACKING {} | vol ratio {:.2} | candle {:.2}%",
            self.pivot.symbol, volume_ratio, size_pct
        );
        self.state = BreakoutState::WeakTracking(WeakTracking {
            breakout_seq,
            breakout_price,
            volume_ratio,
            retest: if self.config.retest_enabled {
                RetestPath::AwaitingPullback
            } else {
                RetestPath::Disabled
            },
            hold_start: Some(candle_close_seq),
            cvd_consecutive: 0,
        });
        Decision::Wait
    }

    fn on_weak_tracking(
        &mut self,
        bar: &Bar,
        mut tracking: WeakTracking,
        window: &BarWindow,
        ctx: EntryContext,
    ) -> Decision {
        if let Some(decision) = self.check_expiry(bar, tracking.breakout_seq) {
            return decision;
        }
        let direction = self.direction();
        let pivot = self.pivot.price;

        let failure_level = direction.offset_pct(pivot, -self.config.failure_pct);
        if !direction.at_least_as_favorable(bar.close, failure_level) {
            return self.expire(format!("failed back through pivot ({:.2})", bar.close));
        }

        let mut confirmed: Vec<(ConfirmPath, f64)> = Vec::new();

        // Pullback / retest
        match tracking.retest {
            RetestPath::AwaitingPullback => {
                let band_edge = direction.offset_pct(pivot, self.config.retest_tolerance_pct);
                let extreme = match direction {
                    Direction::Long => bar.low,
                    Direction::Short => bar.high,
                };
                if !direction.is_beyond(extreme, band_edge) {
                    debug!("{}: retest touch at bar {}", self.pivot.symbol, bar.seq);
                    tracking.retest = RetestPath::Touched { touched_seq: bar.seq };
                }
            }
            RetestPath::Touched { touched_seq } => match bar.seq.bars_since(touched_seq) {
                Some(elapsed) if elapsed > self.config.retest_window_bars => {
                    debug!("{}: retest window exhausted", self.pivot.symbol);
                    tracking.retest = RetestPath::Exhausted;
                }
                Some(_) => {
                    if direction.is_beyond(bar.close, pivot) {
                        if let Some(avg) = self.baseline_bar_volume(window, bar.seq) {
                            let spike = bar.volume as f64 / avg;
                            if spike >= self.config.retest_volume_spike {
                                confirmed.push((ConfirmPath::PullbackRetest, spike));
                            }
                        }
                    }
                }
                None => {
                    error!(
                        "{}: retest touch {} ahead of bar {}, discarding",
                        self.pivot.symbol, touched_seq, bar.seq
                    );
                    tracking.retest = RetestPath::AwaitingPullback;
                }
            },
            RetestPath::Disabled | RetestPath::Exhausted => {}
        }

        // Sustained hold
        if self.config.hold_enabled {
            let floor = direction.offset_pct(pivot, -self.config.hold_max_pullback_pct);
            if !direction.is_beyond(bar.close, floor) {
                if tracking.hold_start.is_some() {
                    debug!("{}: hold violated at bar {}", self.pivot.symbol, bar.seq);
                }
                tracking.hold_start = None;
            } else {
                let start = *tracking.hold_start.get_or_insert(bar.seq);
                match bar.seq.bars_since(start) {
                    Some(bars_held) if bars_held >= self.config.hold_bars => {
                        confirmed.push((ConfirmPath::SustainedHold, tracking.volume_ratio));
                    }
                    Some(_) => {}
                    None => {
                        error!(
                            "{}: hold start {} ahead of bar {}, restarting hold",
                            self.pivot.symbol, start, bar.seq
                        );
                        tracking.hold_start = Some(bar.seq);
                    }
                }
            }
        }

        // Volume imbalance
        if self.config.cvd_enabled {
            let imbalance = &self.config.imbalance;
            match bar.imbalance().signal(imbalance.threshold_pct) {
                Some(signal) => {
                    let strength = signal.strength_for(direction);
                    if strength >= imbalance.strong_bar_pct {
                        confirmed.push((ConfirmPath::CvdImbalance, tracking.volume_ratio));
                    } else if strength >= imbalance.sustained_pct {
                        tracking.cvd_consecutive += 1;
                        if tracking.cvd_consecutive >= imbalance.sustained_bars {
                            confirmed.push((ConfirmPath::CvdImbalance, tracking.volume_ratio));
                        }
                    } else {
                        tracking.cvd_consecutive = 0;
                    }
                }
                None => tracking.cvd_consecutive = 0,
            }
        }

        let breakout_seq = tracking.breakout_seq;
        self.state = BreakoutState::WeakTracking(tracking);

        for (path, volume_ratio) in confirmed {
            if let Some(decision) = self.confirm(path, bar, breakout_seq, volume_ratio, window, ctx) {
                return decision;
            }
        }

        if let BreakoutState::WeakTracking(t) = &self.state {
            let retest_dead = matches!(t.retest, RetestPath::Disabled | RetestPath::Exhausted);
            if retest_dead && !self.config.hold_enabled && !self.config.cvd_enabled {
                return self.expire("all confirmation paths exhausted".to_string());
            }
        }
        Decision::Wait
    }

    /// Re-validate and filter a confirmation. None means the confirmation was
    /// discarded and the machine keeps waiting.
    fn confirm(
        &mut self,
        path: ConfirmPath,
        bar: &Bar,
        breakout_seq: BarSeq,
        volume_ratio: f64,
        window: &BarWindow,
        ctx: EntryContext,
    ) -> Option<Decision> {
        let direction = self.direction();
        if !direction.is_beyond(bar.close, self.pivot.price) {
            info!(
                "{}: {} confirmation discarded, price {:.2} back through pivot {:.2}",
                self.pivot.symbol, path, bar.close, self.pivot.price
            );
            self.reset_path(path);
            return None;
        }

        let input = FilterInput {
            pivot: &self.pivot,
            price: bar.close,
            volume_ratio,
            breakout_seq,
            confirm_seq: bar.seq,
            window,
            attempts_used: ctx.attempts_used,
        };
        match self.filters.evaluate(&input) {
            FilterVerdict::Pass => {
                self.state = BreakoutState::Idle { armed: false };
                Some(Decision::Enter(EntrySignal {
                    symbol: self.pivot.symbol.clone(),
                    direction,
                    pivot_price: self.pivot.price,
                    path,
                    price: bar.close,
                    seq: bar.seq,
                    volume_ratio,
                }))
            }
            FilterVerdict::Block(rejection) => {
                info!("BLOCKED: {} {} via {} | {}", self.pivot.symbol, direction, path, rejection);
                self.state = BreakoutState::Idle { armed: false };
                Some(Decision::Block(rejection))
            }
            FilterVerdict::Defer => {
                debug!("{}: {} confirmation deferred, filters not ready", self.pivot.symbol, path);
                Some(Decision::Wait)
            }
        }
    }

    fn reset_path(&mut self, path: ConfirmPath) {
        if let BreakoutState::WeakTracking(t) = &mut self.state {
            match path {
                ConfirmPath::PullbackRetest => t.retest = RetestPath::AwaitingPullback,
                ConfirmPath::SustainedHold => t.hold_start = None,
                ConfirmPath::CvdImbalance => t.cvd_consecutive = 0,
                ConfirmPath::Momentum => {}
            }
        }
    }

    fn check_expiry(&mut self, bar: &Bar, breakout_seq: BarSeq) -> Option<Decision> {
        match bar.seq.bars_since(breakout_seq) {
            Some(age) if age > self.config.max_pending_bars => {
                Some(self.expire(format!("max pending age {} bars", self.config.max_pending_bars)))
            }
            Some(_) => None,
            None => {
                error!(
                    "{}: breakout bar {} ahead of current bar {}, expiring",
                    self.pivot.symbol, breakout_seq, bar.seq
                );
                Some(self.expire("breakout index ahead of window".to_string()))
            }
        }
    }

    fn expire(&mut self, reason: String) -> Decision {
        info!("STATE: EXPIRED {} | {}", self.pivot.symbol, reason);
        self.state = BreakoutState::Idle { armed: false };
        Decision::Expire { reason }
    }

    fn baseline_bar_volume(&self, window: &BarWindow, before: BarSeq) -> Option<f64> {
        let bars = window.recent_before(before, self.config.volume_lookback_bars);
        indicators::average_volume(&bars).filter(|avg| *avg > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::filters::FilterKind;
    use crate::trading_core::levels::PivotKind;

    /// Pushes hand-built bars through the window's public surface
    struct Tape {
        agg: crate::trading_core::bars::BarAggregator,
        t: i64,
        last: f64,
    }

    impl Tape {
        fn new(capacity: usize) -> Self {
            Self {
                agg: crate::trading_core::bars::BarAggregator::new("TEST", 1, capacity),
                t: 0,
                last: 49.0,
            }
        }

        /// One bar: open at `last`, ticks through `prices` with `size` each
        fn bar(&mut self, prices: &[f64], size: u64) -> &BarWindow {
            let base = chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap();
            for (i, p) in prices.iter().enumerate() {
                let ts = base + chrono::Duration::seconds(self.t) + chrono::Duration::milliseconds(i as i64);
                self.agg.ingest(&crate::trading_core::trades::Tick::new("TEST", *p, size, ts));
                self.last = *p;
            }
            self.t += 1;
            self.agg.close_if_due(base + chrono::Duration::seconds(self.t));
            self.agg.window()
        }

        fn flat(&mut self, price: f64, size: u64) -> &BarWindow {
            self.bar(&[price], size)
        }
    }

    fn pivot() -> PivotLevel {
        PivotLevel {
            symbol: "TEST".to_string(),
            price: 50.0,
            kind: PivotKind::Resistance,
            targets: vec![55.0],
            quality: 1.0,
        }
    }

    fn config() -> BreakoutConfig {
        BreakoutConfig {
            bars_per_candle: 4,
            volume_lookback_bars: 8,
            hold_bars: 6,
            retest_window_bars: 5,
            max_pending_bars: 40,
            filters: FilterConfig {
                choppiness_enabled: false,
                rsi_enabled: false,
                ..FilterConfig::default()
            },
            ..BreakoutConfig::default()
        }
    }

    fn machine(config: BreakoutConfig) -> BreakoutMachine {
        BreakoutMachine::new(pivot(), config)
    }

    /// Feed the newest closed bar
    fn step(m: &mut BreakoutMachine, window: &BarWindow, ctx: EntryContext) -> Decision {
        let bar = window.latest().cloned().expect("closed bar");
        m.on_bar(&bar, window, ctx)
    }

    #[test]
    fn test_strong_candle_enters_momentum() {
        let mut m = machine(config());
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            let w = tape.flat(49.5, 100);
            assert_eq!(step(&mut m, w, EntryContext::default()), Decision::Wait);
        }
        // bars 8..11 form the candle; breakout on bar 8
        let w = tape.bar(&[49.6, 50.2, 50.3], 400);
        assert!(matches!(step(&mut m, w, EntryContext::default()), Decision::BreakoutDetected { .. }));
        assert_eq!(m.phase(), Phase::BreakoutDetected);
        for _ in 0..2 {
            let w = tape.bar(&[50.3, 50.4], 400);
            assert_eq!(step(&mut m, w, EntryContext::default()), Decision::Wait);
        }
        let w = tape.bar(&[50.4, 50.5], 400);
        match step(&mut m, w, EntryContext::default()) {
            Decision::Enter(signal) => {
                assert_eq!(signal.path, ConfirmPath::Momentum);
                assert_eq!(signal.seq, BarSeq(11));
            }
            other => panic!("expected entry, got {other:?}"),
        }
        assert_eq!(m.state(), &BreakoutState::Idle { armed: false });
    }

    #[test]
    fn test_candle_closing_back_expires() {
        let mut m = machine(config());
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        step(&mut m, tape.flat(50.2, 100), EntryContext::default());
        step(&mut m, tape.flat(50.1, 100), EntryContext::default());
        step(&mut m, tape.flat(50.0, 100), EntryContext::default());
        let decision = step(&mut m, tape.flat(49.8, 100), EntryContext::default());
        assert!(matches!(decision, Decision::Expire { .. }));
        // stays disarmed while beyond, re-arms once back below
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_weak_candle_then_sustained_hold() {
        let mut m = machine(BreakoutConfig {
            retest_enabled: false,
            cvd_enabled: false,
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        for _ in 0..4 {
            step(&mut m, tape.flat(50.1, 100), EntryContext::default());
        }
        assert_eq!(m.phase(), Phase::SustainedHold);
        // hold started at candle close (bar 11); needs 6 bars held
        let mut entered = None;
        for _ in 0..6 {
            if let Decision::Enter(s) = step(&mut m, tape.flat(50.15, 100), EntryContext::default()) {
                entered = Some(s);
                break;
            }
        }
        let signal = entered.expect("hold should confirm");
        assert_eq!(signal.path, ConfirmPath::SustainedHold);
        assert_eq!(signal.seq, BarSeq(17));
    }

    #[test]
    fn test_hold_violation_restarts_count() {
        let mut m = machine(BreakoutConfig {
            retest_enabled: false,
            cvd_enabled: false,
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        for _ in 0..4 {
            step(&mut m, tape.flat(50.1, 100), EntryContext::default());
        }
        for _ in 0..3 {
            assert_eq!(step(&mut m, tape.flat(50.15, 100), EntryContext::default()), Decision::Wait);
        }
        // 0.5% below pivot breaks the hold but not the breakout
        assert_eq!(step(&mut m, tape.flat(49.75, 100), EntryContext::default()), Decision::Wait);
        match m.state() {
            BreakoutState::WeakTracking(t) => assert_eq!(t.hold_start, None),
            other => panic!("unexpected {other:?}"),
        }
        for _ in 0..6 {
            assert_eq!(step(&mut m, tape.flat(50.15, 100), EntryContext::default()), Decision::Wait);
        }
        assert!(matches!(
            step(&mut m, tape.flat(50.15, 100), EntryContext::default()),
            Decision::Enter(_)
        ));
    }

    #[test]
    fn test_hold_uses_absolute_indices_after_restore() {
        let mut m = machine(BreakoutConfig {
            retest_enabled: false,
            cvd_enabled: false,
            hold_bars: 24,
            max_pending_bars: 1_000,
            ..config()
        });
        m.restore(BreakoutState::WeakTracking(WeakTracking {
            breakout_seq: BarSeq(600),
            breakout_price: 50.1,
            volume_ratio: 1.0,
            retest: RetestPath::Disabled,
            hold_start: Some(BarSeq(620)),
            cvd_consecutive: 0,
        }));
        let mut agg = crate::trading_core::bars::BarAggregator::with_window(
            "TEST",
            1,
            BarWindow::resume_from(50, BarSeq(1003)),
        );
        let t0 = chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        agg.ingest(&crate::trading_core::trades::Tick::new("TEST", 50.2, 100, t0));
        let closed = agg.close_if_due(t0 + chrono::Duration::seconds(1));
        assert_eq!(closed[0].seq, BarSeq(1003));
        match m.on_bar(&closed[0], agg.window(), EntryContext::default()) {
            Decision::Enter(signal) => assert_eq!(signal.path, ConfirmPath::SustainedHold),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    /// Machine restored from a snapshot over a fresh window resumed at `next_seq`
    fn restored_awaiting_candle(next_seq: u64) -> (BreakoutMachine, crate::trading_core::bars::BarAggregator) {
        let mut m = machine(config());
        m.restore(BreakoutState::AwaitingCandle {
            breakout_seq: BarSeq(8),
            breakout_price: 50.2,
            candle_close_seq: BarSeq(11),
        });
        let agg = crate::trading_core::bars::BarAggregator::with_window(
            "TEST",
            1,
            BarWindow::resume_from(100, BarSeq(next_seq)),
        );
        (m, agg)
    }

    #[test]
    fn test_restored_candle_judged_on_retained_bars() {
        let (mut m, mut agg) = restored_awaiting_candle(10);
        let t0 = chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let mut decisions = Vec::new();
        agg.ingest(&crate::trading_core::trades::Tick::new("TEST", 50.2, 100, t0));
        let mut closed = agg.ingest(&crate::trading_core::trades::Tick::new(
            "TEST",
            50.3,
            100,
            t0 + chrono::Duration::seconds(1),
        ));
        closed.extend(agg.close_if_due(t0 + chrono::Duration::seconds(2)));
        let seqs: Vec<BarSeq> = closed.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![BarSeq(10), BarSeq(11)]);
        for bar in &closed {
            decisions.push(m.on_bar(bar, agg.window(), EntryContext::default()));
        }
        // bars 8 and 9 predate the restart; 10..=11 still close above the pivot
        assert_eq!(decisions, vec![Decision::Wait, Decision::Wait]);
        match m.state() {
            BreakoutState::WeakTracking(t) => {
                assert_eq!(t.breakout_seq, BarSeq(8));
                assert_eq!(t.hold_start, Some(BarSeq(11)));
            }
            other => panic!("expected weak tracking, got {other:?}"),
        }
    }

    #[test]
    fn test_restored_candle_fully_evicted_uses_current_bar() {
        let (mut m, mut agg) = restored_awaiting_candle(20);
        let t0 = chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        agg.ingest(&crate::trading_core::trades::Tick::new("TEST", 50.2, 100, t0));
        let closed = agg.close_if_due(t0 + chrono::Duration::seconds(1));
        assert_eq!(closed[0].seq, BarSeq(20));
        assert_eq!(m.on_bar(&closed[0], agg.window(), EntryContext::default()), Decision::Wait);
        assert_eq!(m.phase(), Phase::SustainedHold);
    }

    #[test]
    fn test_cvd_confirmation_rejected_when_price_reverted() {
        let mut m = machine(BreakoutConfig {
            retest_enabled: false,
            hold_enabled: false,
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        for _ in 0..4 {
            step(&mut m, tape.flat(50.1, 100), EntryContext::default());
        }
        assert!(m.state().is_pending());
        // heavy buying printed while the close sits back under the pivot
        let w = tape.bar(&[49.7, 49.8, 49.85, 49.9, 49.95], 1_000);
        assert_eq!(step(&mut m, w, EntryContext::default()), Decision::Wait);
        match m.state() {
            BreakoutState::WeakTracking(t) => assert_eq!(t.cvd_consecutive, 0),
            other => panic!("unexpected {other:?}"),
        }
        // same buying above the pivot confirms
        let w = tape.bar(&[50.0, 50.1, 50.2], 1_000);
        match step(&mut m, w, EntryContext::default()) {
            Decision::Enter(s) => assert_eq!(s.path, ConfirmPath::CvdImbalance),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn test_retest_with_volume_spike() {
        let mut m = machine(BreakoutConfig {
            hold_enabled: false,
            cvd_enabled: false,
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        for _ in 0..4 {
            step(&mut m, tape.flat(50.5, 100), EntryContext::default());
        }
        assert_eq!(step(&mut m, tape.flat(50.05, 100), EntryContext::default()), Decision::Wait);
        assert_eq!(m.phase(), Phase::PullbackRetest);
        // re-cross without volume does nothing
        assert_eq!(step(&mut m, tape.flat(50.3, 100), EntryContext::default()), Decision::Wait);
        match step(&mut m, tape.flat(50.4, 400), EntryContext::default()) {
            Decision::Enter(s) => assert_eq!(s.path, ConfirmPath::PullbackRetest),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn test_retest_only_expires_when_window_passes() {
        let mut m = machine(BreakoutConfig {
            hold_enabled: false,
            cvd_enabled: false,
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        for _ in 0..4 {
            step(&mut m, tape.flat(50.5, 100), EntryContext::default());
        }
        step(&mut m, tape.flat(50.05, 100), EntryContext::default());
        let mut outcome = Decision::Wait;
        for _ in 0..10 {
            outcome = step(&mut m, tape.flat(50.3, 100), EntryContext::default());
            if outcome != Decision::Wait {
                break;
            }
        }
        assert!(matches!(outcome, Decision::Expire { .. }));
    }

    #[test]
    fn test_max_pending_age_expires() {
        let mut m = machine(BreakoutConfig {
            retest_enabled: false,
            cvd_enabled: false,
            hold_bars: 100,
            max_pending_bars: 10,
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        let mut last = Decision::Wait;
        for _ in 0..12 {
            last = step(&mut m, tape.flat(50.1, 100), EntryContext::default());
            if matches!(last, Decision::Expire { .. }) {
                break;
            }
        }
        assert!(matches!(last, Decision::Expire { .. }));
    }

    #[test]
    fn test_attempt_cap_suppresses_detection() {
        let mut m = machine(config());
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        let capped = EntryContext { attempts_used: 2 };
        assert_eq!(step(&mut m, tape.flat(50.5, 100), capped), Decision::Wait);
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_block_reports_filter() {
        let mut m = machine(BreakoutConfig {
            filters: FilterConfig {
                min_room_pct: 20.0,
                choppiness_enabled: false,
                rsi_enabled: false,
                ..FilterConfig::default()
            },
            ..config()
        });
        let mut tape = Tape::new(100);
        for _ in 0..8 {
            step(&mut m, tape.flat(49.5, 100), EntryContext::default());
        }
        step(&mut m, tape.bar(&[49.6, 50.2, 50.3], 400), EntryContext::default());
        step(&mut m, tape.bar(&[50.3, 50.4], 400), EntryContext::default());
        step(&mut m, tape.bar(&[50.3, 50.4], 400), EntryContext::default());
        match step(&mut m, tape.bar(&[50.4, 50.5], 400), EntryContext::default()) {
            Decision::Block(r) => assert_eq!(r.filter, FilterKind::RoomToRun),
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn test_state_serializes_tagged() {
        let state = BreakoutState::AwaitingCandle {
            breakout_seq: BarSeq(8),
            breakout_price: 50.2,
            candle_close_seq: BarSeq(11),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"phase\":\"awaiting_candle\""));
        let back: BreakoutState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
