//! Execution engine - timeouts, retries and the circuit breaker around a venue
//!
//! Every venue call goes through [`ExecutionEngine::call`]: the breaker gates
//! it, each attempt is bounded by a timeout, transient failures are retried
//! with exponential backoff and counted toward the breaker. Rejections and
//! other permanent failures return on the first attempt.

use std::future::Future;

use tracing::{debug, info, warn};

use super::config::ExecutionConfig;
use super::order::{OrderRequest, OrderSide, VenueOrder, VenuePosition};
use super::retry::{BreakerState, CircuitBreaker};
use super::venue::{ExecutionVenue, VenueError};
use crate::trading_core::levels::Direction;

/// Executed market order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub order_id: u64,
    pub price: f64,
    pub quantity: u64,
}

pub struct ExecutionEngine<V> {
    config: ExecutionConfig,
    venue: V,
    breaker: CircuitBreaker,
}

impl<V: ExecutionVenue> ExecutionEngine<V> {
    pub fn new(venue: V, config: ExecutionConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_failures, config.breaker_cooldown());
        info!(
            "Execution engine on {} venue: timeout={}ms retries={} breaker={}x/{}ms",
            venue.name(),
            config.call_timeout_ms,
            config.max_retries,
            config.breaker_failures,
            config.breaker_cooldown_ms
        );
        Self { config, venue, breaker }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn venue(&self) -> &V {
        &self.venue
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn call<T, F, Fut>(&self, op: &str, f: F) -> Result<T, VenueError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        let backoff = self.config.backoff();
        let mut attempt = 0u32;
        loop {
            self.breaker.check()?;
            let result = match tokio::time::timeout(self.config.call_timeout(), f()).await {
                Ok(result) => result,
                Err(_) => Err(VenueError::Timeout(self.config.call_timeout_ms)),
            };
            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    let tripped = self.breaker.record_failure();
                    if tripped || attempt >= self.config.max_retries {
                        warn!("VENUE: {} failed after {} attempt(s): {}", op, attempt + 1, err);
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = backoff.delay(attempt);
                    warn!(
                        "VENUE: {} failed ({}), retry {}/{} in {:?}",
                        op, err, attempt, self.config.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!("VENUE: {} refused: {}", op, err);
                    return Err(err);
                }
            }
        }
    }

    async fn market(&self, op: &str, request: OrderRequest) -> Result<Fill, VenueError> {
        // Same client id on every retry so the venue can drop duplicates
        let ack = self.call(op, || self.venue.place_order(&request)).await?;
        let price = ack.fill_price.unwrap_or(request.reference_price);
        info!("FILL: {} @ {:.2} (order #{})", request, price, ack.order_id);
        Ok(Fill {
            order_id: ack.order_id,
            price,
            quantity: request.quantity,
        })
    }

    /// Open `shares` in `direction` at market
    pub async fn place_entry(
        &self,
        symbol: &str,
        direction: Direction,
        shares: u64,
        reference_price: f64,
    ) -> Result<Fill, VenueError> {
        let request = OrderRequest::market(symbol, OrderSide::to_open(direction), shares, reference_price);
        self.market("place_entry", request).await
    }

    /// Reduce a `direction` position by `shares` at market
    pub async fn place_exit(
        &self,
        symbol: &str,
        direction: Direction,
        shares: u64,
        reference_price: f64,
    ) -> Result<Fill, VenueError> {
        let request = OrderRequest::market(symbol, OrderSide::to_close(direction), shares, reference_price);
        self.market("place_exit", request).await
    }

    /// Rest a protective stop for a `direction` position
    pub async fn place_stop(
        &self,
        symbol: &str,
        direction: Direction,
        shares: u64,
        stop_price: f64,
    ) -> Result<u64, VenueError> {
        let request = OrderRequest::stop(symbol, OrderSide::to_close(direction), shares, stop_price);
        let ack = self.call("place_stop", || self.venue.place_order(&request)).await?;
        debug!("STOP WORKING: {} (order #{})", request, ack.order_id);
        Ok(ack.order_id)
    }

    /// Cancel a stop; one that is already gone counts as cancelled
    pub async fn cancel_stop(&self, order_id: u64) -> Result<(), VenueError> {
        match self.call("cancel_stop", || self.venue.cancel_order(order_id)).await {
            Err(VenueError::UnknownOrder(id)) => {
                debug!("Stop #{} already gone at venue", id);
                Ok(())
            }
            other => other,
        }
    }

    /// Cancel the working stop (if any) and rest a new one at `stop_price`
    pub async fn replace_stop(
        &self,
        symbol: &str,
        direction: Direction,
        shares: u64,
        existing: Option<u64>,
        stop_price: f64,
    ) -> Result<u64, VenueError> {
        if let Some(order_id) = existing {
            self.cancel_stop(order_id).await?;
        }
        self.place_stop(symbol, direction, shares, stop_price).await
    }

    pub async fn query_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        self.call("query_positions", || self.venue.query_open_positions()).await
    }

    pub async fn query_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        self.call("query_orders", || self.venue.query_open_orders()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::execution::order::OrderKind;
    use crate::execution::simulated::SimulatedVenue;

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            call_timeout_ms: 50,
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            breaker_failures: 3,
            breaker_cooldown_ms: 60_000,
            protective_stops: true,
        }
    }

    #[tokio::test]
    async fn test_entry_and_exit_fill() {
        let engine = ExecutionEngine::new(SimulatedVenue::new(), fast_config());
        let fill = engine.place_entry("AAPL", Direction::Long, 100, 50.25).await.unwrap();
        assert_eq!(fill.price, 50.25);
        assert_eq!(fill.quantity, 100);

        let positions = engine.query_positions().await.unwrap();
        assert_eq!(positions[0].quantity, 100);

        engine.place_exit("AAPL", Direction::Long, 100, 51.0).await.unwrap();
        assert!(engine.query_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let engine = ExecutionEngine::new(SimulatedVenue::new(), fast_config());
        engine.venue().fail_times(2, VenueError::RateLimited).await;

        let fill = engine.place_entry("AAPL", Direction::Short, 10, 20.0).await.unwrap();
        assert_eq!(fill.quantity, 10);
        assert_eq!(engine.venue().call_count(), 3);
        assert_eq!(engine.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let engine = ExecutionEngine::new(SimulatedVenue::new(), fast_config());
        engine.venue().fail_next(VenueError::Rejected("no margin".into())).await;

        let err = engine.place_entry("AAPL", Direction::Long, 10, 20.0).await.unwrap_err();
        assert_eq!(err, VenueError::Rejected("no margin".into()));
        assert_eq!(engine.venue().call_count(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let engine = ExecutionEngine::new(SimulatedVenue::new(), fast_config());
        engine
            .venue()
            .fail_times(10, VenueError::Disconnected("reset".into()))
            .await;

        let err = engine.query_orders().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(engine.venue().call_count(), 3);
        assert_eq!(engine.breaker_state(), BreakerState::Open);

        let err = engine.query_orders().await.unwrap_err();
        assert!(matches!(err, VenueError::CircuitOpen { .. }));
        assert_eq!(engine.venue().call_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_venue_times_out() {
        let config = ExecutionConfig {
            max_retries: 0,
            ..fast_config()
        };
        let engine = ExecutionEngine::new(SimulatedVenue::new(), config);
        engine.venue().set_latency(Duration::from_millis(200));

        let err = engine.query_positions().await.unwrap_err();
        assert_eq!(err, VenueError::Timeout(50));
    }

    #[tokio::test]
    async fn test_replace_stop_cancels_previous() {
        let engine = ExecutionEngine::new(SimulatedVenue::new(), fast_config());
        let first = engine.place_stop("AAPL", Direction::Long, 100, 49.0).await.unwrap();
        let second = engine
            .replace_stop("AAPL", Direction::Long, 100, Some(first), 49.5)
            .await
            .unwrap();
        assert_ne!(first, second);

        let orders = engine.query_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::Stop);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].stop_price, Some(49.5));

        // already-gone stops do not fail the replacement
        let third = engine
            .replace_stop("AAPL", Direction::Long, 50, Some(first), 50.0)
            .await
            .unwrap();
        assert!(third > second);
    }
}
