//! In-memory venue with immediate fills
//!
//! Market orders fill at their reference price, stop orders rest until
//! cancelled. Failures can be queued to exercise the retry and breaker paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::order::{OrderAck, OrderKind, OrderRequest, OrderSide, VenueOrder, VenuePosition};
use super::venue::{ExecutionVenue, VenueError};

#[derive(Debug, Default)]
struct Book {
    positions: BTreeMap<String, (i64, f64)>,
    orders: BTreeMap<u64, VenueOrder>,
    next_order_id: u64,
    scripted_failures: VecDeque<VenueError>,
}

impl Book {
    fn next_id(&mut self) -> u64 {
        self.next_order_id += 1;
        self.next_order_id
    }

    fn take_failure(&mut self) -> Result<(), VenueError> {
        match self.scripted_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_fill(&mut self, symbol: &str, side: OrderSide, quantity: u64, price: f64) {
        let signed = match side {
            OrderSide::Buy => quantity as i64,
            OrderSide::Sell => -(quantity as i64),
        };
        let (qty, avg) = self.positions.get(symbol).copied().unwrap_or((0, 0.0));
        let new_qty = qty + signed;
        let new_avg = if new_qty == 0 {
            0.0
        } else if qty == 0 || qty.signum() != new_qty.signum() {
            price
        } else if qty.signum() == signed.signum() {
            (avg * qty.abs() as f64 + price * quantity as f64) / new_qty.abs() as f64
        } else {
            avg
        };
        if new_qty == 0 {
            self.positions.remove(symbol);
        } else {
            self.positions.insert(symbol.to_string(), (new_qty, new_avg));
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulatedVenue {
    book: Mutex<Book>,
    calls: AtomicU32,
    latency_ms: AtomicU64,
}

impl SimulatedVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next venue call with `err`
    pub async fn fail_next(&self, err: VenueError) {
        self.book.lock().await.scripted_failures.push_back(err);
    }

    /// Fail the next `times` venue calls with `err`
    pub async fn fail_times(&self, times: usize, err: VenueError) {
        let mut book = self.book.lock().await;
        for _ in 0..times {
            book.scripted_failures.push_back(err.clone());
        }
    }

    /// Seed a position as if it had been opened before the process started
    pub async fn seed_position(&self, symbol: &str, quantity: i64, avg_price: f64) {
        let mut book = self.book.lock().await;
        if quantity == 0 {
            book.positions.remove(symbol);
        } else {
            book.positions.insert(symbol.to_string(), (quantity, avg_price));
        }
    }

    /// Seed a resting stop order, returns its id
    pub async fn seed_stop(&self, symbol: &str, side: OrderSide, quantity: u64, stop_price: f64) -> u64 {
        let mut book = self.book.lock().await;
        let order_id = book.next_id();
        book.orders.insert(
            order_id,
            VenueOrder {
                order_id,
                symbol: symbol.to_string(),
                side,
                kind: OrderKind::Stop,
                quantity,
                stop_price: Some(stop_price),
            },
        );
        order_id
    }

    /// Delay every call by `latency` before it touches the book
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total calls received, including failed ones
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn begin_call(&self) -> tokio::sync::MutexGuard<'_, Book> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.book.lock().await
    }
}

impl ExecutionVenue for SimulatedVenue {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, VenueError> {
        let mut book = self.begin_call().await;
        book.take_failure()?;
        if request.quantity == 0 {
            return Err(VenueError::Rejected(format!("zero quantity for {}", request.symbol)));
        }

        let order_id = book.next_id();
        match request.kind {
            OrderKind::Market => {
                book.apply_fill(&request.symbol, request.side, request.quantity, request.reference_price);
                debug!("SIM FILL: #{} {} @ {:.2}", order_id, request, request.reference_price);
                Ok(OrderAck {
                    order_id,
                    fill_price: Some(request.reference_price),
                })
            }
            OrderKind::Stop => {
                book.orders.insert(
                    order_id,
                    VenueOrder {
                        order_id,
                        symbol: request.symbol.clone(),
                        side: request.side,
                        kind: OrderKind::Stop,
                        quantity: request.quantity,
                        stop_price: request.stop_price,
                    },
                );
                debug!("SIM WORKING: #{} {}", order_id, request);
                Ok(OrderAck {
                    order_id,
                    fill_price: None,
                })
            }
        }
    }

    async fn cancel_order(&self, order_id: u64) -> Result<(), VenueError> {
        let mut book = self.begin_call().await;
        book.take_failure()?;
        match book.orders.remove(&order_id) {
            Some(_) => Ok(()),
            None => Err(VenueError::UnknownOrder(order_id)),
        }
    }

    async fn query_open_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        let mut book = self.begin_call().await;
        book.take_failure()?;
        Ok(book
            .positions
            .iter()
            .map(|(symbol, (quantity, avg_price))| VenuePosition {
                symbol: symbol.clone(),
                quantity: *quantity,
                avg_price: *avg_price,
            })
            .collect())
    }

    async fn query_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        let mut book = self.begin_call().await;
        book.take_failure()?;
        Ok(book.orders.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_fills_update_position() {
        let venue = SimulatedVenue::new();
        venue
            .place_order(&OrderRequest::market("AAPL", OrderSide::Buy, 100, 50.0))
            .await
            .unwrap();
        venue
            .place_order(&OrderRequest::market("AAPL", OrderSide::Buy, 100, 52.0))
            .await
            .unwrap();
        let positions = venue.query_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 200);
        assert!((positions[0].avg_price - 51.0).abs() < 1e-9);

        venue
            .place_order(&OrderRequest::market("AAPL", OrderSide::Sell, 200, 53.0))
            .await
            .unwrap();
        assert!(venue.query_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_rests_until_cancelled() {
        let venue = SimulatedVenue::new();
        let ack = venue
            .place_order(&OrderRequest::stop("AAPL", OrderSide::Sell, 100, 49.0))
            .await
            .unwrap();
        assert_eq!(ack.fill_price, None);
        assert_eq!(venue.query_open_orders().await.unwrap().len(), 1);

        venue.cancel_order(ack.order_id).await.unwrap();
        assert!(venue.query_open_orders().await.unwrap().is_empty());
        assert_eq!(
            venue.cancel_order(ack.order_id).await,
            Err(VenueError::UnknownOrder(ack.order_id))
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_consumed_in_order() {
        let venue = SimulatedVenue::new();
        venue.fail_next(VenueError::RateLimited).await;
        assert_eq!(venue.query_open_orders().await, Err(VenueError::RateLimited));
        assert!(venue.query_open_orders().await.is_ok());
        assert_eq!(venue.call_count(), 2);
    }
}
