//! Backoff and circuit breaker for venue calls
//!
//! The breaker trips after a run of consecutive transient failures and
//! blocks every call until the cooldown elapses. The first call after the
//! cooldown is a probe: success closes the breaker, failure re-opens it.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::venue::VenueError;

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped, plus up to 25% jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(2u32.pow(exp)).min(self.max);
        let jitter_ms = (raw.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        raw + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are refused until the cooldown elapses
    Open,
    /// Cooldown elapsed, next result decides
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_trips: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    max_consecutive_failures: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(max_consecutive_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                total_trips: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn total_trips(&self) -> u32 {
        self.lock().total_trips
    }

    /// Gate a call. Moves Open to HalfOpen once the cooldown has elapsed.
    pub fn check(&self) -> Result<(), VenueError> {
        let mut inner = self.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }
        let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
        if elapsed >= self.cooldown {
            info!("Venue breaker HALF_OPEN, probing");
            inner.state = BreakerState::HalfOpen;
            Ok(())
        } else {
            Err(VenueError::CircuitOpen {
                remaining_ms: (self.cooldown - elapsed).as_millis() as u64,
            })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            info!("Venue breaker CLOSED after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Returns true when this failure tripped the breaker
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == BreakerState::HalfOpen
            || (inner.state == BreakerState::Closed && inner.consecutive_failures >= self.max_consecutive_failures);
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.total_trips += 1;
            warn!(
                "Venue breaker OPEN after {} consecutive failures, cooling down {:?}",
                inner.consecutive_failures, self.cooldown
            );
        }
        trip
    }
}
