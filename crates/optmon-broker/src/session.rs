//! Broker session capability contract.
//!
//! Every broker client the monitor talks to implements [`BrokerSession`];
//! the monitor never inspects a client's concrete type.

use crate::error::BrokerResult;
use crate::types::{BrokerPosition, OrderParams, OrderRecord, TradeRecord};
use rust_decimal::Decimal;
use std::future::Future;
use std::pin::Pin;

/// Boxed future type for trait object compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Authenticated session for one broker account.
pub trait BrokerSession: Send + Sync {
    /// Place an order. Resolves to the venue's order id.
    fn place_order(&self, params: OrderParams) -> BoxFuture<'_, BrokerResult<String>>;

    fn cancel_order<'a>(
        &'a self,
        variety: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, BrokerResult<()>>;

    /// Today's orders.
    fn order_book(&self) -> BoxFuture<'_, BrokerResult<Vec<OrderRecord>>>;

    /// Today's fills.
    fn trade_book(&self) -> BoxFuture<'_, BrokerResult<Vec<TradeRecord>>>;

    /// Last traded price for one instrument.
    fn ltp_data<'a>(
        &'a self,
        exchange: &'a str,
        symbol: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, BrokerResult<Decimal>>;

    /// Open positions, or `None` if the session has no position endpoint.
    fn positions(&self) -> BoxFuture<'_, BrokerResult<Option<Vec<BrokerPosition>>>> {
        Box::pin(async { Ok(None) })
    }
}
