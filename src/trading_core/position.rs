//! Position sizing, partial exits and stop progression
//!
//! The manager exclusively owns open positions. Every stop change goes
//! through one helper that only ever moves the stop in the favorable
//! direction.
//!
//! Per-bar exit evaluation order is fixed:
//! 1. hard stop (full exit)
//! 2. partial-exit ladder (stop to breakeven, then to the previous level)
//! 3. stuck-position tightening (once per position)
//! 4. runner trailing stop once the ladder is used up
//! 5. flat by time of day

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::bars::Bar;
use super::breakout::{ConfirmPath, EntrySignal};
use super::exits::{ExitLadder, LadderConfig, LadderContext, LadderLevel, StuckCheck, StuckConfig, StuckPolicy};
use super::levels::Direction;

/// Risk and exit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Account value used for sizing (default: 100000)
    pub account_value: f64,
    /// Fraction of account risked per trade (default: 0.005)
    pub risk_fraction: f64,
    pub min_shares: u64,
    pub max_shares: u64,
    /// Stop buffer beyond pivot (%) for momentum entries (default: 0.0)
    pub momentum_stop_buffer_pct: f64,
    /// Stop buffer beyond pivot (%) for retest/hold/imbalance entries (default: 0.2)
    pub confirmed_stop_buffer_pct: f64,
    /// Runner trails the best price by this percent (default: 1.0)
    pub trail_pct: f64,
    pub ladder: LadderConfig,
    pub stuck: StuckConfig,
    /// Local time after which everything is flattened (default: 15:55)
    pub flat_time: NaiveTime,
    pub timezone: Tz,
    /// Realized loss (account currency) that stops new entries (default: 1000)
    pub daily_loss_limit: f64,
    /// Losing trades that stop new entries; 0 disables (default: 3)
    pub max_daily_losses: u32,
    /// Stop distance (%) for positions found at the venue without a stop (default: 2.0)
    pub emergency_stop_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_value: 100_000.0,
            risk_fraction: 0.005,
            min_shares: 1,
            max_shares: 1_000,
            momentum_stop_buffer_pct: 0.0,
            confirmed_stop_buffer_pct: 0.2,
            trail_pct: 1.0,
            ladder: LadderConfig::default(),
            stuck: StuckConfig::default(),
            flat_time: NaiveTime::from_hms_opt(15, 55, 0).unwrap_or_default(),
            timezone: chrono_tz::America::New_York,
            daily_loss_limit: 1_000.0,
            max_daily_losses: 3,
            emergency_stop_pct: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("stop {stop:.2} is not on the losing side of entry {entry:.2} for a {direction}")]
    StopOnWrongSide { direction: Direction, entry: f64, stop: f64 },
    #[error("{0} already has an open position")]
    AlreadyOpen(String),
    #[error("entries halted for the day: {0}")]
    DailyLimit(String),
}

/// Why a stop moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Breakeven,
    PriorLevel,
    Stuck,
    Trailing,
    Manual,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Breakeven => write!(f, "BREAKEVEN"),
            StopReason::PriorLevel => write!(f, "PRIOR_LEVEL"),
            StopReason::Stuck => write!(f, "STUCK"),
            StopReason::Trailing => write!(f, "TRAILING"),
            StopReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Why shares were sold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Stop,
    Target,
    TimeOfDay,
    Flatten,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Stop => write!(f, "STOP"),
            ExitReason::Target => write!(f, "TARGET"),
            ExitReason::TimeOfDay => write!(f, "TIME_OF_DAY"),
            ExitReason::Flatten => write!(f, "FLATTEN"),
        }
    }
}

/// Record of one partial exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialExit {
    pub level: usize,
    pub price: f64,
    pub shares: u64,
    pub time: DateTime<Utc>,
}

/// Stop progression flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopFlags {
    pub breakeven: bool,
    pub stuck_tightened: bool,
    pub trailing: bool,
}

/// Open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Shares at entry
    pub size: u64,
    pub remaining_shares: u64,
    pub stop_price: f64,
    pub initial_stop: f64,
    pub pivot_price: f64,
    pub path: Option<ConfirmPath>,
    pub ladder: Vec<LadderLevel>,
    /// Index of the next untaken ladder level
    pub next_level: usize,
    pub partial_exits: Vec<PartialExit>,
    pub flags: StopFlags,
    /// Most favorable price seen since entry
    pub best_price: f64,
    pub realized_pnl: f64,
    /// Reconstructed from the venue without strategy metadata
    #[serde(default)]
    pub metadata_light: bool,
    #[serde(default)]
    pub stop_order_id: Option<String>,
}

impl Position {
    pub fn remaining_fraction(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.remaining_shares as f64 / self.size as f64
    }

    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    pub fn unrealized(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * self.remaining_shares as f64
    }

    fn pnl_for(&self, price: f64, shares: u64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * shares as f64
    }

    fn ladder_done(&self) -> bool {
        self.next_level >= self.ladder.len()
    }
}

/// What the caller must do at the venue
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    Partial {
        symbol: String,
        direction: Direction,
        shares: u64,
        price: f64,
        level: usize,
        remaining_shares: u64,
    },
    Close {
        symbol: String,
        direction: Direction,
        shares: u64,
        price: f64,
        reason: ExitReason,
        pnl: f64,
        stop_order_id: Option<String>,
    },
    StopMoved {
        symbol: String,
        direction: Direction,
        from: f64,
        to: f64,
        reason: StopReason,
        remaining_shares: u64,
        stop_order_id: Option<String>,
    },
}

/// Daily P&L summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPnL {
    pub date: NaiveDate,
    pub realized_pnl: f64,
    pub trade_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Set once a daily guard trips
    pub halted: Option<String>,
}

impl DailyPnL {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            realized_pnl: 0.0,
            trade_count: 0,
            wins: 0,
            losses: 0,
            largest_win: 0.0,
            largest_loss: 0.0,
            halted: None,
        }
    }

    fn record_partial(&mut self, pnl: f64) {
        self.realized_pnl += pnl;
    }

    fn record_close(&mut self, final_pnl: f64, trade_pnl: f64) {
        self.realized_pnl += final_pnl;
        self.trade_count += 1;
        if trade_pnl > 0.0 {
            self.wins += 1;
            self.largest_win = self.largest_win.max(trade_pnl);
        } else if trade_pnl < 0.0 {
            self.losses += 1;
            self.largest_loss = self.largest_loss.min(trade_pnl);
        }
    }
}

/// Per-symbol merge input from the venue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VenueView {
    /// Signed share count, positive long
    pub quantity: i64,
    pub avg_price: f64,
    /// Working stop order price, if any
    pub stop_price: Option<f64>,
    pub stop_order_id: Option<u64>,
}

/// Result of merging one symbol against the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    Matched,
    Adjusted,
    Dropped,
    Reconstructed,
    Flat,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::Matched => write!(f, "MATCHED"),
            SyncOutcome::Adjusted => write!(f, "ADJUSTED"),
            SyncOutcome::Dropped => write!(f, "DROPPED"),
            SyncOutcome::Reconstructed => write!(f, "RECONSTRUCTED"),
            SyncOutcome::Flat => write!(f, "FLAT"),
        }
    }
}

/// Owns every open position plus the daily accumulators
pub struct PositionManager {
    config: RiskConfig,
    ladder: Box<dyn ExitLadder>,
    stuck: Box<dyn StuckPolicy>,
    positions: BTreeMap<String, Position>,
    daily: DailyPnL,
}

impl PositionManager {
    pub fn new(config: RiskConfig, session_date: NaiveDate) -> Self {
        let ladder = config.ladder.build();
        let stuck = config.stuck.build();
        info!(
            "Position manager: ladder={} stuck={} risk={:.3}% of {:.0}",
            ladder.name(),
            stuck.name(),
            config.risk_fraction * 100.0,
            config.account_value
        );
        Self {
            config,
            ladder,
            stuck,
            positions: BTreeMap::new(),
            daily: DailyPnL::new(session_date),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn daily(&self) -> &DailyPnL {
        &self.daily
    }

    pub fn is_flat(&self) -> bool {
        self.positions.is_empty()
    }

    /// Replace everything from a recovered snapshot
    pub fn restore(&mut self, positions: Vec<Position>, daily: DailyPnL) {
        self.positions = positions.into_iter().map(|p| (p.symbol.clone(), p)).collect();
        self.daily = daily;
    }

    /// New trading day: clear accumulators, keep any carried positions
    pub fn roll_day(&mut self, date: NaiveDate) {
        info!(
            "Daily stats reset ({} -> {}). Realized: {:.2}",
            self.daily.date, date, self.daily.realized_pnl
        );
        self.daily = DailyPnL::new(date);
    }

    /// Stop for a fresh entry: the pivot itself for momentum, a buffer beyond it otherwise
    pub fn initial_stop(&self, signal: &EntrySignal) -> f64 {
        let buffer = match signal.path {
            ConfirmPath::Momentum => self.config.momentum_stop_buffer_pct,
            _ => self.config.confirmed_stop_buffer_pct,
        };
        signal.direction.offset_pct(signal.pivot_price, -buffer)
    }

    /// Shares risking `risk_fraction` of the account, clamped to [min, max]
    pub fn size_position(&self, direction: Direction, entry: f64, stop: f64) -> Result<u64, PositionError> {
        if !direction.is_beyond(entry, stop) {
            return Err(PositionError::StopOnWrongSide { direction, entry, stop });
        }
        let risk_per_share = (entry - stop).abs();
        let raw = (self.config.risk_fraction * self.config.account_value / risk_per_share).floor();
        let shares = if raw.is_finite() && raw > 0.0 { raw as u64 } else { 0 };
        Ok(shares.clamp(self.config.min_shares, self.config.max_shares.max(self.config.min_shares)))
    }

    /// Refuse entries once a daily guard tripped or the symbol is already held
    pub fn can_enter(&mut self, symbol: &str) -> Result<(), PositionError> {
        if self.positions.contains_key(symbol) {
            return Err(PositionError::AlreadyOpen(symbol.to_string()));
        }
        if let Some(reason) = &self.daily.halted {
            return Err(PositionError::DailyLimit(reason.clone()));
        }
        Ok(())
    }

    /// Open a position after the entry fill
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        signal: &EntrySignal,
        fill_price: f64,
        shares: u64,
        stop: f64,
        targets: &[f64],
        moving_averages: &[f64],
        now: DateTime<Utc>,
    ) -> Result<&Position, PositionError> {
        self.can_enter(&signal.symbol)?;
        let direction = signal.direction;
        if !direction.is_beyond(fill_price, stop) {
            return Err(PositionError::StopOnWrongSide {
                direction,
                entry: fill_price,
                stop,
            });
        }

        let ladder = self.ladder.levels(&LadderContext {
            direction,
            entry_price: fill_price,
            initial_stop: stop,
            targets,
            moving_averages,
        });
        info!(
            "ENTRY: {} {} {} @ {:.2} | Stop: {:.2} | Path: {} | Levels: {:?}",
            signal.symbol,
            direction,
            shares,
            fill_price,
            stop,
            signal.path,
            ladder.iter().map(|l| l.price).collect::<Vec<_>>()
        );

        let position = Position {
            symbol: signal.symbol.clone(),
            direction,
            entry_price: fill_price,
            entry_time: now,
            size: shares,
            remaining_shares: shares,
            stop_price: stop,
            initial_stop: stop,
            pivot_price: signal.pivot_price,
            path: Some(signal.path),
            ladder,
            next_level: 0,
            partial_exits: Vec::new(),
            flags: StopFlags::default(),
            best_price: fill_price,
            realized_pnl: 0.0,
            metadata_light: false,
            stop_order_id: None,
        };
        let symbol = signal.symbol.clone();
        Ok(self.positions.entry(symbol).or_insert(position))
    }

    pub fn set_stop_order(&mut self, symbol: &str, order_id: Option<String>) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.stop_order_id = order_id;
        }
    }

    /// Explicit stop request; loosening is refused loudly
    pub fn tighten_stop(&mut self, symbol: &str, candidate: f64) -> Option<ExitAction> {
        let pos = self.positions.get_mut(symbol)?;
        if !pos.direction.is_beyond(candidate, pos.stop_price) {
            error!(
                "{}: refused stop move {:.2} -> {:.2}, would widen risk on {}",
                symbol, pos.stop_price, candidate, pos.direction
            );
            return None;
        }
        move_stop(pos, candidate, StopReason::Manual)
    }

    /// Run the exit rules against one closed bar
    pub fn evaluate_bar(&mut self, bar: &Bar, now: DateTime<Utc>) -> Vec<ExitAction> {
        let Some(pos) = self.positions.get_mut(&bar.symbol) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let direction = pos.direction;

        // (a) hard stop, filled at the stop or the open if it gapped through
        let adverse = match direction {
            Direction::Long => bar.low,
            Direction::Short => bar.high,
        };
        if !direction.is_beyond(adverse, pos.stop_price) {
            let fill = if direction.is_beyond(bar.open, pos.stop_price) {
                pos.stop_price
            } else {
                bar.open
            };
            actions.push(self.close(&bar.symbol, fill, ExitReason::Stop));
            return actions;
        }

        let favorable = match direction {
            Direction::Long => bar.high,
            Direction::Short => bar.low,
        };
        if direction.is_beyond(favorable, pos.best_price) {
            pos.best_price = favorable;
        }

        // (b) ladder
        while let Some(level) = pos.ladder.get(pos.next_level).copied() {
            if !direction.at_least_as_favorable(favorable, level.price) {
                break;
            }
            let index = pos.next_level;
            pos.next_level += 1;

            let shares = ((pos.size as f64 * level.fraction).round() as u64).min(pos.remaining_shares);
            if shares > 0 && shares < pos.remaining_shares {
                pos.remaining_shares -= shares;
                let pnl = pos.pnl_for(level.price, shares);
                pos.realized_pnl += pnl;
                pos.partial_exits.push(PartialExit {
                    level: index,
                    price: level.price,
                    shares,
                    time: now,
                });
                self.daily.record_partial(pnl);
                info!(
                    "EXIT PARTIAL: {} {} {} @ {:.2} (level {}) | Remaining: {:.0}% | P&L: {:+.2}",
                    pos.symbol,
                    direction,
                    shares,
                    level.price,
                    index + 1,
                    pos.remaining_fraction() * 100.0,
                    pnl
                );
                actions.push(ExitAction::Partial {
                    symbol: pos.symbol.clone(),
                    direction,
                    shares,
                    price: level.price,
                    level: index,
                    remaining_shares: pos.remaining_shares,
                });
            } else if shares >= pos.remaining_shares && shares > 0 {
                let symbol = pos.symbol.clone();
                actions.push(self.close(&symbol, level.price, ExitReason::Target));
                return actions;
            }

            let (target, reason) = if index == 0 {
                (pos.entry_price, StopReason::Breakeven)
            } else {
                (pos.ladder[index - 1].price, StopReason::PriorLevel)
            };
            if let Some(moved) = move_stop(pos, target, reason) {
                if reason == StopReason::Breakeven {
                    pos.flags.breakeven = true;
                }
                actions.push(moved);
            }
        }

        // (c) stuck position
        if !pos.flags.stuck_tightened {
            let check = StuckCheck {
                direction,
                entry_price: pos.entry_price,
                initial_risk: pos.initial_risk(),
                elapsed: now - pos.entry_time,
                partials_taken: pos.partial_exits.len(),
                max_favorable_excursion: (pos.best_price - pos.entry_price) * direction.sign(),
            };
            if let Some(stop) = self.stuck.tightened_stop(&check) {
                pos.flags.stuck_tightened = true;
                info!(
                    "{}: stuck for {}m without progress, tightening toward {:.2}",
                    pos.symbol,
                    check.elapsed.num_minutes(),
                    stop
                );
                if let Some(moved) = move_stop(pos, stop, StopReason::Stuck) {
                    actions.push(moved);
                }
            }
        }

        // (d) runner trail
        if pos.ladder_done() && self.config.trail_pct > 0.0 {
            let trail = direction.offset_pct(pos.best_price, -self.config.trail_pct);
            if let Some(moved) = move_stop(pos, trail, StopReason::Trailing) {
                pos.flags.trailing = true;
                actions.push(moved);
            }
        }

        // (e) flat by time of day
        let local = now.with_timezone(&self.config.timezone);
        if local.time() >= self.config.flat_time {
            actions.push(self.close(&bar.symbol, bar.close, ExitReason::TimeOfDay));
        }

        actions
    }

    /// Flatten every open position at the supplied prices (entry price when unknown)
    pub fn close_all(&mut self, price_of: impl Fn(&str) -> Option<f64>, reason: ExitReason) -> Vec<ExitAction> {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols
            .into_iter()
            .map(|symbol| {
                let price = price_of(&symbol)
                    .or_else(|| self.positions.get(&symbol).map(|p| p.entry_price))
                    .unwrap_or(0.0);
                self.close(&symbol, price, reason)
            })
            .collect()
    }

    /// Remove a position whose exit was already executed elsewhere
    pub fn forget(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    fn close(&mut self, symbol: &str, price: f64, reason: ExitReason) -> ExitAction {
        let Some(pos) = self.positions.remove(symbol) else {
            error!("{}: close requested without a position", symbol);
            return ExitAction::Close {
                symbol: symbol.to_string(),
                direction: Direction::Long,
                shares: 0,
                price,
                reason,
                pnl: 0.0,
                stop_order_id: None,
            };
        };
        let final_pnl = pos.pnl_for(price, pos.remaining_shares);
        let trade_pnl = pos.realized_pnl + final_pnl;
        self.daily.record_close(final_pnl, trade_pnl);

        let verdict = if trade_pnl > 0.0 {
            "WIN"
        } else if trade_pnl < 0.0 {
            "LOSS"
        } else {
            "BREAKEVEN"
        };
        info!(
            "EXIT {}: {} {} {} @ {:.2} | Trade P&L: {:+.2} | {}",
            reason, pos.symbol, pos.direction, pos.remaining_shares, price, trade_pnl, verdict
        );
        self.check_daily_guards();

        ExitAction::Close {
            symbol: pos.symbol,
            direction: pos.direction,
            shares: pos.remaining_shares,
            price,
            reason,
            pnl: trade_pnl,
            stop_order_id: pos.stop_order_id,
        }
    }

    fn check_daily_guards(&mut self) {
        if self.daily.halted.is_some() {
            return;
        }
        if self.daily.realized_pnl <= -self.config.daily_loss_limit {
            let reason = format!(
                "daily loss limit {:.2} reached ({:.2})",
                self.config.daily_loss_limit, self.daily.realized_pnl
            );
            warn!("{}", reason);
            self.daily.halted = Some(reason);
        } else if self.config.max_daily_losses > 0 && self.daily.losses >= self.config.max_daily_losses {
            let reason = format!("max daily losses ({}) reached", self.config.max_daily_losses);
            warn!("{}", reason);
            self.daily.halted = Some(reason);
        }
    }

    /// Merge the venue's view of one symbol into local state
    pub fn apply_venue_view(&mut self, symbol: &str, view: Option<VenueView>, now: DateTime<Utc>) -> SyncOutcome {
        let venue = view.filter(|v| v.quantity != 0);
        let local = self.positions.get_mut(symbol);

        match (local, venue) {
            (None, None) => SyncOutcome::Flat,
            (Some(pos), None) => {
                warn!(
                    "RECONCILE: {} local {} {} @ {:.2} but venue is flat, dropping",
                    symbol, pos.direction, pos.remaining_shares, pos.entry_price
                );
                self.positions.remove(symbol);
                SyncOutcome::Dropped
            }
            (Some(pos), Some(v)) if direction_of(v.quantity) == pos.direction => {
                let qty = v.quantity.unsigned_abs();
                let same = qty == pos.remaining_shares && (v.avg_price - pos.entry_price).abs() < 1e-9;
                if same {
                    return SyncOutcome::Matched;
                }
                warn!(
                    "RECONCILE: {} local {} @ {:.4} vs venue {} @ {:.4}, trusting venue",
                    symbol, pos.remaining_shares, pos.entry_price, qty, v.avg_price
                );
                pos.remaining_shares = qty;
                pos.size = pos.size.max(qty);
                pos.entry_price = v.avg_price;
                if !pos.direction.is_beyond(pos.best_price, pos.entry_price) {
                    pos.best_price = pos.entry_price;
                }
                if let Some(id) = v.stop_order_id {
                    pos.stop_order_id = Some(id.to_string());
                }
                SyncOutcome::Adjusted
            }
            (local, Some(v)) => {
                if let Some(pos) = local {
                    error!(
                        "RECONCILE: {} local {} but venue holds {}, rebuilding from venue",
                        symbol, pos.direction, v.quantity
                    );
                }
                let position = self.reconstruct(symbol, v, now);
                warn!(
                    "RECONCILE: {} reconstructed {} {} @ {:.2} | Stop: {:.2} (metadata-light)",
                    symbol, position.direction, position.remaining_shares, position.entry_price, position.stop_price
                );
                self.positions.insert(symbol.to_string(), position);
                SyncOutcome::Reconstructed
            }
        }
    }

    fn reconstruct(&self, symbol: &str, view: VenueView, now: DateTime<Utc>) -> Position {
        let direction = direction_of(view.quantity);
        let shares = view.quantity.unsigned_abs();
        let emergency = direction.offset_pct(view.avg_price, -self.config.emergency_stop_pct);
        let stop = view
            .stop_price
            .filter(|s| direction.is_beyond(view.avg_price, *s))
            .unwrap_or(emergency);
        Position {
            symbol: symbol.to_string(),
            direction,
            entry_price: view.avg_price,
            entry_time: now,
            size: shares,
            remaining_shares: shares,
            stop_price: stop,
            initial_stop: stop,
            pivot_price: view.avg_price,
            path: None,
            ladder: Vec::new(),
            next_level: 0,
            partial_exits: Vec::new(),
            flags: StopFlags {
                stuck_tightened: true,
                ..StopFlags::default()
            },
            best_price: view.avg_price,
            realized_pnl: 0.0,
            metadata_light: true,
            stop_order_id: view.stop_order_id.map(|id| id.to_string()),
        }
    }
}

fn direction_of(quantity: i64) -> Direction {
    if quantity >= 0 {
        Direction::Long
    } else {
        Direction::Short
    }
}

/// The only place a stop changes. Returns None unless the move is strictly favorable.
fn move_stop(pos: &mut Position, candidate: f64, reason: StopReason) -> Option<ExitAction> {
    if !candidate.is_finite() || !pos.direction.is_beyond(candidate, pos.stop_price) {
        debug!(
            "{}: {} stop {:.2} not tighter than {:.2}, kept",
            pos.symbol, reason, candidate, pos.stop_price
        );
        return None;
    }
    let from = pos.stop_price;
    pos.stop_price = candidate;
    info!("STOP {}: {} {:.2} -> {:.2}", reason, pos.symbol, from, candidate);
    Some(ExitAction::StopMoved {
        symbol: pos.symbol.clone(),
        direction: pos.direction,
        from,
        to: candidate,
        reason,
        remaining_shares: pos.remaining_shares,
        stop_order_id: pos.stop_order_id.clone(),
    })
}
