//! Startup reconciliation
//!
//! The snapshot is a cache, the venue is the source of truth for whether a
//! position exists and how large it is. For every symbol either side knows
//! about, the venue's size and price win and the snapshot contributes the
//! strategy metadata (pivot, ladder, partials taken). Every disagreement is
//! logged with both values by [`PositionManager::apply_venue_view`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

use super::snapshot::{InstrumentSnapshot, SessionSnapshot};
use crate::execution::{OrderKind, OrderSide, VenueOrder, VenuePosition};
use crate::trading_core::attempts::AttemptRecord;
use crate::trading_core::levels::Direction;
use crate::trading_core::position::{DailyPnL, Position, PositionManager, RiskConfig, SyncOutcome, VenueView};

/// Reconciled session state, ready to install
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub session_date: NaiveDate,
    pub instruments: Vec<InstrumentSnapshot>,
    pub positions: Vec<Position>,
    pub attempts: Vec<AttemptRecord>,
    pub daily: DailyPnL,
    pub outcomes: BTreeMap<String, SyncOutcome>,
}

impl Recovered {
    /// Snapshot equivalent of this state
    pub fn to_snapshot(&self, saved_at: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            instruments: self.instruments.clone(),
            positions: self.positions.clone(),
            attempts: self.attempts.clone(),
            daily: self.daily.clone(),
            ..SessionSnapshot::empty(self.session_date, saved_at)
        }
    }
}

/// Install a snapshot without venue data (venue unreachable at startup)
pub fn trust_snapshot(snapshot: Option<SessionSnapshot>, session_date: NaiveDate, now: DateTime<Utc>) -> Recovered {
    let snapshot = snapshot.unwrap_or_else(|| SessionSnapshot::empty(session_date, now));
    Recovered {
        session_date,
        instruments: snapshot.instruments,
        positions: snapshot.positions,
        attempts: snapshot.attempts,
        daily: snapshot.daily,
        outcomes: BTreeMap::new(),
    }
}

/// The venue's view of one symbol, including its working protective stop
pub fn venue_view(symbol: &str, positions: &[VenuePosition], orders: &[VenueOrder]) -> Option<VenueView> {
    let position = positions.iter().find(|p| p.symbol == symbol && p.quantity != 0)?;
    let direction = if position.quantity > 0 {
        Direction::Long
    } else {
        Direction::Short
    };
    let closing_side = OrderSide::to_close(direction);
    // Latest working stop on the closing side protects the position
    let stop = orders
        .iter()
        .filter(|o| o.symbol == symbol && o.kind == OrderKind::Stop && o.side == closing_side)
        .max_by_key(|o| o.order_id);
    Some(VenueView {
        quantity: position.quantity,
        avg_price: position.avg_price,
        stop_price: stop.and_then(|o| o.stop_price),
        stop_order_id: stop.map(|o| o.order_id),
    })
}

/// Merge a snapshot (if any) with the venue's positions and orders.
///
/// Deterministic for identical inputs: symbols are visited in sorted order
/// and nothing depends on wall-clock time except `now`, which stamps
/// reconstructed positions.
pub fn reconcile(
    snapshot: Option<SessionSnapshot>,
    venue_positions: &[VenuePosition],
    venue_orders: &[VenueOrder],
    risk: &RiskConfig,
    session_date: NaiveDate,
    now: DateTime<Utc>,
) -> Recovered {
    let snapshot = snapshot.unwrap_or_else(|| SessionSnapshot::empty(session_date, now));

    let mut manager = PositionManager::new(risk.clone(), session_date);
    manager.restore(snapshot.positions, snapshot.daily);

    let symbols: BTreeSet<String> = manager
        .positions()
        .keys()
        .cloned()
        .chain(
            venue_positions
                .iter()
                .filter(|p| p.quantity != 0)
                .map(|p| p.symbol.clone()),
        )
        .collect();

    let mut outcomes = BTreeMap::new();
    for symbol in symbols {
        let view = venue_view(&symbol, venue_positions, venue_orders);
        let outcome = manager.apply_venue_view(&symbol, view, now);
        if outcome != SyncOutcome::Matched {
            info!("RECONCILE: {} -> {}", symbol, outcome);
        }
        outcomes.insert(symbol, outcome);
    }

    Recovered {
        session_date,
        instruments: snapshot.instruments,
        positions: manager.positions().values().cloned().collect(),
        attempts: snapshot.attempts,
        daily: manager.daily().clone(),
        outcomes,
    }
}
