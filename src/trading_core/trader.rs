//! Core Trading Loop
//!
//! Broker-agnostic engine that wires bars, breakout machines and the
//! position manager to an execution venue:
//! - one [`Instrument`] per symbol owns its aggregator and breakout machine
//! - open positions, daily P&L and attempt counters live in the shared
//!   [`SessionBook`] and are only mutated under its lock
//! - every venue call is bounded by the execution engine's timeout and retry
//!   budget; a failed call flags the symbol for a position sync on the next
//!   maintenance pass instead of stalling the loop

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::attempts::AttemptLedger;
use super::bars::{Bar, BarAggregator, BarSeq, BarWindow};
use super::breakout::{BreakoutMachine, ConfirmPath, Decision, EntryContext, EntrySignal, Phase};
use super::filters::Rejection;
use super::indicators;
use super::levels::{Direction, PivotLevel};
use super::position::{ExitAction, ExitReason, PositionManager, StopReason, SyncOutcome};
use super::trades::Tick;
use crate::config::EngineConfig;
use crate::execution::{Backoff, ExecutionEngine, ExecutionVenue, VenueError};
use crate::session::{
    reconcile, trust_snapshot, venue_view, InstrumentSnapshot, Recovered, SessionSnapshot, SnapshotError,
    SnapshotStore, SNAPSHOT_VERSION,
};

/// Decision and execution events for collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    BreakoutDetected {
        symbol: String,
        seq: BarSeq,
        price: f64,
    },
    Entered {
        symbol: String,
        direction: Direction,
        path: ConfirmPath,
        shares: u64,
        price: f64,
        stop: f64,
    },
    Blocked {
        symbol: String,
        rejection: Rejection,
    },
    /// Confirmed signal not taken (position open, daily halt, past flat time)
    Skipped {
        symbol: String,
        reason: String,
    },
    Expired {
        symbol: String,
        reason: String,
    },
    PartialExit {
        symbol: String,
        shares: u64,
        price: f64,
        remaining_shares: u64,
    },
    StopMoved {
        symbol: String,
        from: f64,
        to: f64,
        reason: StopReason,
    },
    Closed {
        symbol: String,
        reason: ExitReason,
        shares: u64,
        price: f64,
        pnl: f64,
    },
    Reconciled {
        symbol: String,
        outcome: SyncOutcome,
    },
    VenueFailure {
        symbol: String,
        operation: &'static str,
        error: VenueError,
    },
}

/// Where maintenance passes read the time from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Live feed: wall-clock time
    Wall,
    /// Replayed feed: the latest tick timestamp
    Feed,
}

/// Cross-instrument state behind one lock
pub struct SessionBook {
    pub positions: PositionManager,
    pub attempts: AttemptLedger,
}

struct Instrument {
    aggregator: BarAggregator,
    machine: BreakoutMachine,
}

pub struct TradingEngine<V> {
    config: EngineConfig,
    session_date: NaiveDate,
    instruments: HashMap<String, Instrument>,
    book: Arc<Mutex<SessionBook>>,
    execution: ExecutionEngine<V>,
    store: SnapshotStore,
    events: broadcast::Sender<EngineEvent>,
    needs_sync: BTreeSet<String>,
    last_tick: Option<DateTime<Utc>>,
}

impl<V: ExecutionVenue> TradingEngine<V> {
    pub fn new(config: EngineConfig, pivots: Vec<PivotLevel>, venue: V, session_date: NaiveDate) -> Self {
        let mut instruments = HashMap::new();
        for pivot in pivots {
            if instruments.contains_key(&pivot.symbol) {
                warn!("{}: duplicate pivot {:.2} ignored", pivot.symbol, pivot.price);
                continue;
            }
            info!(
                "{}: {:?} pivot {:.2} | {} targets | quality {:.2}",
                pivot.symbol,
                pivot.kind,
                pivot.price,
                pivot.targets.len(),
                pivot.quality
            );
            let aggregator = BarAggregator::new(&pivot.symbol, config.bar_seconds, config.window_capacity);
            let symbol = pivot.symbol.clone();
            let machine = BreakoutMachine::new(pivot, config.breakout.clone());
            instruments.insert(symbol, Instrument { aggregator, machine });
        }

        let book = SessionBook {
            positions: PositionManager::new(config.risk.clone(), session_date),
            attempts: AttemptLedger::new(),
        };
        let execution = ExecutionEngine::new(venue, config.execution.clone());
        let store = SnapshotStore::new(config.snapshot.dir.clone());
        let (events, _) = broadcast::channel(1000);

        Self {
            config,
            session_date,
            instruments,
            book: Arc::new(Mutex::new(book)),
            execution,
            store,
            events,
            needs_sync: BTreeSet::new(),
            last_tick: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session_date(&self) -> NaiveDate {
        self.session_date
    }

    pub fn book(&self) -> Arc<Mutex<SessionBook>> {
        Arc::clone(&self.book)
    }

    pub fn execution(&self) -> &ExecutionEngine<V> {
        &self.execution
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self, symbol: &str) -> Option<Phase> {
        self.instruments.get(symbol).map(|i| i.machine.phase())
    }

    pub fn window(&self, symbol: &str) -> Option<&BarWindow> {
        self.instruments.get(symbol).map(|i| i.aggregator.window())
    }

    /// Symbols waiting for a position sync
    pub fn pending_sync(&self) -> &BTreeSet<String> {
        &self.needs_sync
    }

    fn bar_duration(&self) -> Duration {
        Duration::seconds(i64::from(self.config.bar_seconds.max(1)))
    }

    fn emit(&self, events: &mut Vec<EngineEvent>, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        events.push(event);
    }

    fn venue_failure(&mut self, symbol: &str, operation: &'static str, error: VenueError, events: &mut Vec<EngineEvent>) {
        warn!("{}: {} failed ({}), flagged for position sync", symbol, operation, error);
        self.needs_sync.insert(symbol.to_string());
        self.emit(
            events,
            EngineEvent::VenueFailure {
                symbol: symbol.to_string(),
                operation,
                error,
            },
        );
    }

    /// Load the latest snapshot, reconcile it against the venue and install the result
    pub async fn recover(&mut self, now: DateTime<Utc>) -> Recovered {
        let store = self.store.clone();
        let date = self.session_date;
        let snapshot = match tokio::task::spawn_blocking(move || store.load_latest(date)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Snapshot load task failed: {}, starting clean", e);
                None
            }
        };

        let venue_state = match self.execution.query_positions().await {
            Ok(positions) => match self.execution.query_orders().await {
                Ok(orders) => Ok((positions, orders)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (recovered, venue_orders) = match venue_state {
            Ok((positions, orders)) => {
                let recovered = reconcile(snapshot, &positions, &orders, &self.config.risk, date, now);
                (recovered, Some((positions, orders)))
            }
            Err(e) => {
                warn!("RECOVERY: venue unreachable ({}), trusting snapshot until the next sync", e);
                (trust_snapshot(snapshot, date, now), None)
            }
        };

        self.install(&recovered).await;

        let mut events = Vec::new();
        for (symbol, outcome) in &recovered.outcomes {
            self.emit(
                &mut events,
                EngineEvent::Reconciled {
                    symbol: symbol.clone(),
                    outcome: *outcome,
                },
            );
        }

        match venue_orders {
            Some((positions, orders)) => {
                if self.config.execution.protective_stops {
                    for position in &recovered.positions {
                        let venue_stop = venue_view(&position.symbol, &positions, &orders).and_then(|v| v.stop_price);
                        self.ensure_protective_stop(&position.symbol, venue_stop, &mut events).await;
                    }
                }
            }
            None => {
                for position in &recovered.positions {
                    self.needs_sync.insert(position.symbol.clone());
                }
            }
        }

        info!(
            "RECOVERY: {} positions, {} attempt counters, {} instruments restored",
            recovered.positions.len(),
            recovered.attempts.len(),
            recovered.instruments.len()
        );
        recovered
    }

    async fn install(&mut self, recovered: &Recovered) {
        for snap in &recovered.instruments {
            let Some(instrument) = self.instruments.get_mut(&snap.symbol) else {
                debug!("{}: in snapshot but not traded this run", snap.symbol);
                continue;
            };
            // Numbering never restarts, whatever happens to the pivot
            let window = BarWindow::resume_from(self.config.window_capacity, snap.next_seq);
            instrument.aggregator = BarAggregator::with_window(&snap.symbol, self.config.bar_seconds, window);
            if instrument.machine.pivot().key() == snap.pivot {
                instrument.machine.restore(snap.state.clone());
                info!(
                    "{}: restored {} at bar {}",
                    snap.symbol,
                    instrument.machine.phase(),
                    snap.next_seq
                );
            } else {
                info!("{}: pivot changed since snapshot ({}), starting IDLE", snap.symbol, snap.pivot);
            }
        }

        let mut book = self.book.lock().await;
        book.positions
            .restore(recovered.positions.clone(), recovered.daily.clone());
        book.attempts = AttemptLedger::from_records(&recovered.attempts);
    }

    /// Feed one tick; returns the events it caused
    pub async fn on_tick(&mut self, tick: &Tick) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.last_tick = Some(self.last_tick.map_or(tick.ts_event, |t| t.max(tick.ts_event)));
        self.check_session_date(tick.ts_event).await;

        let Some(instrument) = self.instruments.get_mut(&tick.symbol) else {
            debug!("{}: tick for untracked symbol", tick.symbol);
            return events;
        };
        let bars = instrument.aggregator.ingest(tick);
        for bar in bars {
            self.on_bar(&bar, &mut events).await;
        }
        events
    }

    /// Idle bar closes, flat-by-time for quiet symbols and the flagged-symbol sync
    pub async fn on_maintenance(&mut self, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.check_session_date(now).await;

        let mut symbols: Vec<String> = self.instruments.keys().cloned().collect();
        symbols.sort();
        for symbol in &symbols {
            let bars = match self.instruments.get_mut(symbol) {
                Some(instrument) => instrument.aggregator.close_if_due(now),
                None => continue,
            };
            for bar in bars {
                self.on_bar(&bar, &mut events).await;
            }
        }

        self.flatten_if_past_time(now, &mut events).await;
        self.sync_flagged(now, &mut events).await;
        events
    }

    async fn check_session_date(&mut self, ts: DateTime<Utc>) {
        let local_date = ts.with_timezone(&self.config.risk.timezone).date_naive();
        if local_date <= self.session_date {
            return;
        }
        info!("SESSION: {} -> {}", self.session_date, local_date);
        for instrument in self.instruments.values_mut() {
            instrument.machine.reset();
        }
        let mut book = self.book.lock().await;
        book.positions.roll_day(local_date);
        book.attempts.clear();
        drop(book);
        self.session_date = local_date;
    }

    async fn on_bar(&mut self, bar: &Bar, events: &mut Vec<EngineEvent>) {
        let symbol = bar.symbol.clone();
        let now = bar.start_time + self.bar_duration();

        let actions = self.book.lock().await.positions.evaluate_bar(bar, now);
        if !actions.is_empty() {
            self.execute_exits(&symbol, actions, events).await;
        }

        let Some(key) = self.instruments.get(&symbol).map(|i| i.machine.pivot().key()) else {
            return;
        };
        let attempts_used = self.book.lock().await.attempts.used(&key);
        let Some(instrument) = self.instruments.get_mut(&symbol) else {
            return;
        };
        let decision = instrument
            .machine
            .on_bar(bar, instrument.aggregator.window(), EntryContext { attempts_used });

        match decision {
            Decision::Wait => {}
            Decision::BreakoutDetected { seq, price } => {
                self.emit(events, EngineEvent::BreakoutDetected { symbol, seq, price });
            }
            Decision::Block(rejection) => {
                self.emit(events, EngineEvent::Blocked { symbol, rejection });
            }
            Decision::Expire { reason } => {
                self.emit(events, EngineEvent::Expired { symbol, reason });
            }
            Decision::Enter(signal) => self.enter(signal, now, events).await,
        }
    }

    async fn enter(&mut self, signal: EntrySignal, now: DateTime<Utc>, events: &mut Vec<EngineEvent>) {
        let symbol = signal.symbol.clone();
        let direction = signal.direction;

        let local = now.with_timezone(&self.config.risk.timezone);
        if local.time() >= self.config.risk.flat_time {
            info!("SKIPPED: {} {} entry after flat time {}", symbol, direction, self.config.risk.flat_time);
            self.emit(
                events,
                EngineEvent::Skipped {
                    symbol,
                    reason: format!("past flat time {}", self.config.risk.flat_time),
                },
            );
            return;
        }

        let sizing = {
            let mut book = self.book.lock().await;
            match book.positions.can_enter(&symbol) {
                Err(e) => Err(e.to_string()),
                Ok(()) => {
                    let stop = book.positions.initial_stop(&signal);
                    book.positions
                        .size_position(direction, signal.price, stop)
                        .map(|shares| (stop, shares))
                        .map_err(|e| e.to_string())
                }
            }
        };
        let (stop, shares) = match sizing {
            Ok(sized) => sized,
            Err(reason) => {
                info!("SKIPPED: {} {} entry | {}", symbol, direction, reason);
                self.emit(events, EngineEvent::Skipped { symbol, reason });
                return;
            }
        };

        let fill = match self.execution.place_entry(&symbol, direction, shares, signal.price).await {
            Ok(fill) => fill,
            Err(e) => {
                self.venue_failure(&symbol, "place_entry", e, events);
                return;
            }
        };

        let (key, targets, moving_averages) = match self.instruments.get(&symbol) {
            Some(instrument) => (
                instrument.machine.pivot().key(),
                instrument.machine.pivot().targets_beyond(fill.price),
                moving_averages(instrument.aggregator.window(), self.config.risk.ladder.sma_periods()),
            ),
            None => return,
        };

        let opened = {
            let mut book = self.book.lock().await;
            let used = book.attempts.record_entry(&key);
            info!(
                "{}: attempt {}/{} on {}",
                symbol, used, self.config.breakout.filters.max_attempts, key
            );
            book.positions
                .open(&signal, fill.price, fill.quantity, stop, &targets, &moving_averages, now)
                .map(|p| p.stop_price)
        };

        let stop = match opened {
            Ok(stop) => stop,
            Err(e) => {
                error!(
                    "{}: filled {} @ {:.2} but cannot manage it ({}), flattening",
                    symbol, fill.quantity, fill.price, e
                );
                if let Err(e) = self.execution.place_exit(&symbol, direction, fill.quantity, fill.price).await {
                    self.venue_failure(&symbol, "place_exit", e, events);
                }
                return;
            }
        };

        self.emit(
            events,
            EngineEvent::Entered {
                symbol: symbol.clone(),
                direction,
                path: signal.path,
                shares: fill.quantity,
                price: fill.price,
                stop,
            },
        );

        if self.config.execution.protective_stops {
            match self.execution.place_stop(&symbol, direction, fill.quantity, stop).await {
                Ok(order_id) => self
                    .book
                    .lock()
                    .await
                    .positions
                    .set_stop_order(&symbol, Some(order_id.to_string())),
                Err(e) => self.venue_failure(&symbol, "place_stop", e, events),
            }
        }
    }

    async fn execute_exits(&mut self, symbol: &str, actions: Vec<ExitAction>, events: &mut Vec<EngineEvent>) {
        let mut stop_dirty = false;
        for action in actions {
            match action {
                ExitAction::Partial {
                    symbol,
                    direction,
                    shares,
                    price,
                    remaining_shares,
                    ..
                } => {
                    self.emit(
                        events,
                        EngineEvent::PartialExit {
                            symbol: symbol.clone(),
                            shares,
                            price,
                            remaining_shares,
                        },
                    );
                    if let Err(e) = self.execution.place_exit(&symbol, direction, shares, price).await {
                        self.venue_failure(&symbol, "place_exit", e, events);
                    }
                    stop_dirty = true;
                }
                ExitAction::StopMoved {
                    symbol, from, to, reason, ..
                } => {
                    self.emit(events, EngineEvent::StopMoved { symbol, from, to, reason });
                    stop_dirty = true;
                }
                ExitAction::Close {
                    symbol,
                    direction,
                    shares,
                    price,
                    reason,
                    pnl,
                    stop_order_id,
                } => {
                    self.emit(
                        events,
                        EngineEvent::Closed {
                            symbol: symbol.clone(),
                            reason,
                            shares,
                            price,
                            pnl,
                        },
                    );
                    if shares > 0 {
                        if let Err(e) = self.execution.place_exit(&symbol, direction, shares, price).await {
                            self.venue_failure(&symbol, "place_exit", e, events);
                        }
                    }
                    if let Some(order_id) = parse_order_id(stop_order_id.as_deref()) {
                        if let Err(e) = self.execution.cancel_stop(order_id).await {
                            self.venue_failure(&symbol, "cancel_stop", e, events);
                        }
                    }
                    stop_dirty = false;
                }
            }
        }

        if stop_dirty && self.config.execution.protective_stops {
            self.refresh_protective_stop(symbol, events).await;
        }
    }

    /// Replace the venue stop with the local stop and remaining size
    async fn refresh_protective_stop(&mut self, symbol: &str, events: &mut Vec<EngineEvent>) {
        let current = self.book.lock().await.positions.get(symbol).map(|p| {
            (
                p.direction,
                p.remaining_shares,
                p.stop_price,
                parse_order_id(p.stop_order_id.as_deref()),
            )
        });
        let Some((direction, shares, stop, existing)) = current else {
            return;
        };
        let result = self
            .execution
            .replace_stop(symbol, direction, shares, existing, stop)
            .await;
        match result {
            Ok(order_id) => {
                self.book
                    .lock()
                    .await
                    .positions
                    .set_stop_order(symbol, Some(order_id.to_string()));
            }
            Err(e) => {
                // The old order may already be cancelled; let the sync find out
                self.book.lock().await.positions.set_stop_order(symbol, None);
                self.venue_failure(symbol, "replace_stop", e, events);
            }
        }
    }

    async fn ensure_protective_stop(&mut self, symbol: &str, venue_stop: Option<f64>, events: &mut Vec<EngineEvent>) {
        let stale = self.book.lock().await.positions.get(symbol).is_some_and(|p| {
            p.stop_order_id.is_none() || venue_stop.map_or(true, |s| (s - p.stop_price).abs() > 1e-9)
        });
        if stale {
            self.refresh_protective_stop(symbol, events).await;
        }
    }

    async fn flatten_if_past_time(&mut self, now: DateTime<Utc>, events: &mut Vec<EngineEvent>) {
        let local = now.with_timezone(&self.config.risk.timezone);
        if local.time() < self.config.risk.flat_time {
            return;
        }
        let last_closes: HashMap<String, f64> = self
            .instruments
            .iter()
            .filter_map(|(symbol, i)| i.aggregator.window().latest().map(|b| (symbol.clone(), b.close)))
            .collect();
        let actions = {
            let mut book = self.book.lock().await;
            if book.positions.is_flat() {
                return;
            }
            book.positions
                .close_all(|symbol| last_closes.get(symbol).copied(), ExitReason::TimeOfDay)
        };
        let symbols: Vec<String> = actions
            .iter()
            .filter_map(|a| match a {
                ExitAction::Close { symbol, .. } => Some(symbol.clone()),
                _ => None,
            })
            .collect();
        for (symbol, action) in symbols.iter().zip(actions) {
            self.execute_exits(symbol, vec![action], events).await;
        }
    }

    async fn sync_flagged(&mut self, now: DateTime<Utc>, events: &mut Vec<EngineEvent>) {
        if self.needs_sync.is_empty() {
            return;
        }
        let positions = match self.execution.query_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!("SYNC: deferred for {:?}, {}", self.needs_sync, e);
                return;
            }
        };
        let orders = match self.execution.query_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("SYNC: deferred for {:?}, {}", self.needs_sync, e);
                return;
            }
        };

        let symbols = std::mem::take(&mut self.needs_sync);
        for symbol in symbols {
            let view = venue_view(&symbol, &positions, &orders);
            let outcome = self
                .book
                .lock()
                .await
                .positions
                .apply_venue_view(&symbol, view, now);
            info!("SYNC: {} -> {}", symbol, outcome);
            self.emit(
                events,
                EngineEvent::Reconciled {
                    symbol: symbol.clone(),
                    outcome,
                },
            );
            if self.config.execution.protective_stops {
                self.ensure_protective_stop(&symbol, view.and_then(|v| v.stop_price), events)
                    .await;
            }
        }
    }

    /// Current session state in snapshot form
    pub async fn snapshot(&self, saved_at: DateTime<Utc>) -> SessionSnapshot {
        let mut instruments: Vec<InstrumentSnapshot> = self
            .instruments
            .iter()
            .map(|(symbol, instrument)| InstrumentSnapshot {
                symbol: symbol.clone(),
                pivot: instrument.machine.pivot().key(),
                next_seq: instrument.aggregator.window().absolute_index(),
                state: instrument.machine.state().clone(),
            })
            .collect();
        instruments.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let book = self.book.lock().await;
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_date: self.session_date,
            saved_at,
            instruments,
            positions: book.positions.positions().values().cloned().collect(),
            attempts: book.attempts.records(),
            daily: book.positions.daily().clone(),
        }
    }

    /// Write a snapshot off the decision path, bounded by timeout and retries
    pub async fn save_snapshot(&self) -> Result<(), SnapshotError> {
        let snapshot = self.snapshot(Utc::now()).await;
        let cfg = &self.config.snapshot;
        let backoff = Backoff {
            base: StdDuration::from_millis(100),
            max: StdDuration::from_secs(2),
        };
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let snap = snapshot.clone();
            let task = tokio::task::spawn_blocking(move || store.save(&snap));
            let result = match tokio::time::timeout(StdDuration::from_millis(cfg.write_timeout_ms), task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(SnapshotError::Task(join.to_string())),
                // The blocking write may still finish; a retry now would race it
                Err(_) => return Err(SnapshotError::Timeout),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < cfg.max_retries => {
                    attempt += 1;
                    let delay = backoff.delay(attempt);
                    warn!("Snapshot write failed ({}), retry {}/{} in {:?}", e, attempt, cfg.max_retries, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn status(&self) -> String {
        let book = self.book.lock().await;
        let daily = book.positions.daily();
        format!(
            "Session {} | Open: {} | Trades: {} ({}W/{}L) | Realized: {:+.2}{}",
            self.session_date,
            book.positions.positions().len(),
            daily.trade_count,
            daily.wins,
            daily.losses,
            daily.realized_pnl,
            daily
                .halted
                .as_ref()
                .map(|r| format!(" | HALTED: {r}"))
                .unwrap_or_default()
        )
    }

    fn clock_now(&self, clock: Clock) -> DateTime<Utc> {
        match clock {
            Clock::Wall => Utc::now(),
            Clock::Feed => self.last_tick.unwrap_or_else(Utc::now),
        }
    }

    /// Main loop: ticks, maintenance and snapshots until the feed ends or `shutdown` fires
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<Tick>,
        clock: Clock,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut maintenance = tokio::time::interval(StdDuration::from_secs(self.config.maintenance_secs.max(1)));
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshots = tokio::time::interval(StdDuration::from_secs(self.config.snapshot.interval_secs.max(1)));
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Trading loop started: {} instruments, {:?} clock", self.instruments.len(), clock);
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(tick) => {
                        self.on_tick(&tick).await;
                    }
                    None => {
                        info!("Tick stream ended");
                        if clock == Clock::Feed {
                            let end = self.clock_now(clock) + self.bar_duration();
                            self.on_maintenance(end).await;
                        }
                        break;
                    }
                },
                _ = maintenance.tick() => {
                    let now = self.clock_now(clock);
                    self.on_maintenance(now).await;
                }
                _ = snapshots.tick() => {
                    if let Err(e) = self.save_snapshot().await {
                        warn!("Snapshot failed: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        if let Err(e) = self.save_snapshot().await {
            error!("Final snapshot failed: {}", e);
        }
        info!("{}", self.status().await);
        info!("Trading loop ended");
        Ok(())
    }
}

/// SMA of closes for each period the window can already cover
fn moving_averages(window: &BarWindow, periods: &[usize]) -> Vec<f64> {
    if periods.is_empty() {
        return Vec::new();
    }
    let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
    periods
        .iter()
        .filter_map(|period| indicators::sma(&closes, *period))
        .collect()
}

fn parse_order_id(id: Option<&str>) -> Option<u64> {
    id.and_then(|s| s.parse().ok())
}
