//! In-memory broker session for tests.

use crate::error::{BrokerError, BrokerResult};
use crate::session::{BoxFuture, BrokerSession};
use crate::types::{BrokerPosition, OrderParams, OrderRecord, TradeRecord};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Mock broker session.
///
/// Placed orders are recorded and, unless configured otherwise, appear in
/// the order book as `complete` at the configured fill price.
pub struct MockBrokerSession {
    placed: Mutex<Vec<OrderParams>>,
    cancelled: Mutex<Vec<String>>,
    orders: Mutex<Vec<OrderRecord>>,
    trades: Mutex<Vec<TradeRecord>>,
    positions: Mutex<Option<Vec<BrokerPosition>>>,
    ltp: Mutex<HashMap<String, Decimal>>,
    /// Status given to orders placed from now on.
    fill_status: Mutex<String>,
    fill_price: Mutex<Decimal>,
    fail_place: Mutex<Option<String>>,
    fail_books: Mutex<bool>,
    fail_cancel: Mutex<bool>,
    place_delay: Mutex<Duration>,
    positions_delay: Mutex<Duration>,
    next_id: AtomicU64,
}

impl Default for MockBrokerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrokerSession {
    pub fn new() -> Self {
        Self {
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            trades: Mutex::new(Vec::new()),
            positions: Mutex::new(None),
            ltp: Mutex::new(HashMap::new()),
            fill_status: Mutex::new("complete".to_string()),
            fill_price: Mutex::new(Decimal::ZERO),
            fail_place: Mutex::new(None),
            fail_books: Mutex::new(false),
            fail_cancel: Mutex::new(false),
            place_delay: Mutex::new(Duration::ZERO),
            positions_delay: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
        }
    }

    /// Set the LTP returned for `symbol` (any exchange).
    pub fn set_ltp(&self, symbol: &str, price: Decimal) {
        self.ltp.lock().insert(symbol.to_string(), price);
    }

    /// Status and average price given to subsequently placed orders.
    pub fn set_fill(&self, status: &str, average_price: Decimal) {
        *self.fill_status.lock() = status.to_string();
        *self.fill_price.lock() = average_price;
    }

    /// Make `place_order` fail with `message`, or succeed again with `None`.
    pub fn set_place_failure(&self, message: Option<&str>) {
        *self.fail_place.lock() = message.map(str::to_string);
    }

    /// Make order/trade/position queries fail.
    pub fn set_books_failure(&self, fail: bool) {
        *self.fail_books.lock() = fail;
    }

    /// Make `cancel_order` fail.
    pub fn set_cancel_failure(&self, fail: bool) {
        *self.fail_cancel.lock() = fail;
    }

    /// Move an existing order to `status`, as a late venue update would.
    pub fn set_order_status(&self, order_id: &str, status: &str, average_price: Decimal) {
        if let Some(order) = self.orders.lock().iter_mut().find(|o| o.order_id == order_id) {
            order.status = status.to_string();
            order.average_price = average_price;
        }
    }

    pub fn set_place_delay(&self, delay: Duration) {
        *self.place_delay.lock() = delay;
    }

    /// Delay every `positions` query by `delay`.
    pub fn set_positions_delay(&self, delay: Duration) {
        *self.positions_delay.lock() = delay;
    }

    pub fn set_positions(&self, positions: Option<Vec<BrokerPosition>>) {
        *self.positions.lock() = positions;
    }

    pub fn push_order(&self, order: OrderRecord) {
        self.orders.lock().push(order);
    }

    pub fn push_trade(&self, trade: TradeRecord) {
        self.trades.lock().push(trade);
    }

    pub fn placed_orders(&self) -> Vec<OrderParams> {
        self.placed.lock().clone()
    }

    pub fn place_count(&self) -> usize {
        self.placed.lock().len()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    fn books_result<T: Clone>(&self, rows: &Mutex<T>) -> BrokerResult<T> {
        if *self.fail_books.lock() {
            return Err(BrokerError::HttpClient("mock outage".to_string()));
        }
        Ok(rows.lock().clone())
    }
}

impl BrokerSession for MockBrokerSession {
    fn place_order(&self, params: OrderParams) -> BoxFuture<'_, BrokerResult<String>> {
        Box::pin(async move {
            let delay = *self.place_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.placed.lock().push(params.clone());
            if let Some(message) = self.fail_place.lock().clone() {
                return Err(BrokerError::Api {
                    code: "MOCK".to_string(),
                    message,
                });
            }

            let order_id = format!("MOCK-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            let status = self.fill_status.lock().clone();
            let filled = status.eq_ignore_ascii_case("complete");
            self.orders.lock().push(OrderRecord {
                order_id: order_id.clone(),
                trading_symbol: params.trading_symbol.clone(),
                exchange: params.exchange.clone(),
                transaction_type: params.transaction_type.clone(),
                status,
                average_price: *self.fill_price.lock(),
                filled_shares: if filled {
                    params.quantity.parse().unwrap_or(Decimal::ZERO)
                } else {
                    Decimal::ZERO
                },
                text: String::new(),
            });
            Ok(order_id)
        })
    }

    fn cancel_order<'a>(
        &'a self,
        _variety: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            if *self.fail_cancel.lock() {
                return Err(BrokerError::Api {
                    code: "MOCK".to_string(),
                    message: "cancel refused".to_string(),
                });
            }
            self.cancelled.lock().push(order_id.to_string());
            if let Some(order) = self
                .orders
                .lock()
                .iter_mut()
                .find(|o| o.order_id == order_id && !o.is_terminal())
            {
                order.status = "cancelled".to_string();
            }
            Ok(())
        })
    }

    fn order_book(&self) -> BoxFuture<'_, BrokerResult<Vec<OrderRecord>>> {
        Box::pin(async move { self.books_result(&self.orders) })
    }

    fn trade_book(&self) -> BoxFuture<'_, BrokerResult<Vec<TradeRecord>>> {
        Box::pin(async move { self.books_result(&self.trades) })
    }

    fn ltp_data<'a>(
        &'a self,
        exchange: &'a str,
        symbol: &'a str,
        _token: &'a str,
    ) -> BoxFuture<'a, BrokerResult<Decimal>> {
        Box::pin(async move {
            self.ltp
                .lock()
                .get(symbol)
                .copied()
                .ok_or_else(|| BrokerError::NoQuote(format!("{exchange}:{symbol}")))
        })
    }

    fn positions(&self) -> BoxFuture<'_, BrokerResult<Option<Vec<BrokerPosition>>>> {
        Box::pin(async move {
            let delay = *self.positions_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.books_result(&self.positions)
        })
    }
}
