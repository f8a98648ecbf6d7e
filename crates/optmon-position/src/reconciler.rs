//! Reconciliation of tracked positions against the broker's open positions.
//!
//! The broker is authoritative: a tracked position whose symbol the broker
//! does not hold at (at least) the tracked quantity is treated as closed
//! outside this system and leaves the store as `EXTERNAL_EXIT`.

use chrono::Local;
use optmon_broker::{BrokerRegistry, BrokerSession};
use optmon_core::{CompletedTradeRecord, PositionStatus};
use optmon_telemetry::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PositionResult;
use crate::store::PositionStore;

/// Net quantity per trading symbol for one account.
pub type NetPositions = HashMap<String, i64>;

/// Broker positions per client id; `None` when the fetch failed.
pub type BrokerPositionMap = HashMap<String, Option<NetPositions>>;

/// Open positions of one account.
///
/// Uses the position endpoint when the session has one; otherwise derives
/// net quantities from filled orders, overridden per symbol by the trade
/// book. Zero-net symbols are dropped. `None` if nothing could be fetched.
pub async fn fetch_broker_positions(session: &dyn BrokerSession) -> Option<NetPositions> {
    match session.positions().await {
        Ok(Some(rows)) => {
            let mut net = NetPositions::new();
            for row in rows {
                *net.entry(row.trading_symbol).or_default() += row.net_quantity();
            }
            net.retain(|_, qty| *qty != 0);
            return Some(net);
        }
        Ok(None) => {}
        Err(e) => warn!(?e, "Position fetch failed, deriving from order and trade books"),
    }

    let orders = session.order_book().await;
    let trades = session.trade_book().await;
    if orders.is_err() && trades.is_err() {
        warn!("Order and trade book fetch both failed");
        return None;
    }

    let mut net = NetPositions::new();
    match orders {
        Ok(orders) => {
            for order in orders.iter().filter(|o| o.is_filled()) {
                let qty = order.signed_filled();
                if qty != 0 {
                    *net.entry(order.trading_symbol.clone()).or_default() += qty;
                }
            }
        }
        Err(e) => warn!(?e, "Order book fetch failed"),
    }

    match trades {
        Ok(trades) => {
            let mut from_trades = NetPositions::new();
            for trade in &trades {
                *from_trades.entry(trade.trading_symbol.clone()).or_default() +=
                    trade.signed_fill();
            }
            net.extend(from_trades);
        }
        Err(e) => warn!(?e, "Trade book fetch failed"),
    }

    net.retain(|_, qty| *qty != 0);
    Some(net)
}

/// Fetch positions for every registered account.
pub async fn fetch_all_broker_positions(registry: &BrokerRegistry) -> BrokerPositionMap {
    let mut all = BrokerPositionMap::new();
    for client_id in registry.client_ids() {
        let Some(session) = registry.get(&client_id) else {
            continue;
        };
        let positions = fetch_broker_positions(session.as_ref()).await;
        debug!(
            %client_id,
            symbols = ?positions.as_ref().map(HashMap::len),
            "Fetched broker positions"
        );
        all.insert(client_id, positions);
    }
    all
}

pub struct Reconciler {
    store: Arc<PositionStore>,
}

impl Reconciler {
    #[must_use]
    pub fn new(store: Arc<PositionStore>) -> Self {
        Self { store }
    }

    /// Remove tracked positions the broker no longer holds.
    ///
    /// Accounts without data (unregistered or failed fetch) are skipped for
    /// this cycle; an empty map means the account is flat. Positions with an
    /// exit in flight are left to the exit path. Returns the records written.
    pub fn reconcile(
        &self,
        broker_positions: &BrokerPositionMap,
    ) -> PositionResult<Vec<CompletedTradeRecord>> {
        let mut records = Vec::new();

        for (key, position) in self.store.all() {
            if position.status == PositionStatus::Exiting {
                continue;
            }
            // A flat account is an empty map; only a failed fetch skips.
            let Some(Some(net)) = broker_positions.get(&position.client_id) else {
                continue;
            };

            let tracked = i64::from(position.quantity);
            let held = net.get(&position.symbol).copied();
            match held {
                Some(qty) if qty >= tracked => continue,
                Some(qty) if qty > 0 => warn!(
                    %key,
                    broker_qty = qty,
                    tracked_qty = tracked,
                    "Broker holds less than tracked, treating as external exit"
                ),
                _ => info!(%key, broker_qty = ?held, "Position closed outside the monitor"),
            }

            // Another path may have removed or locked it since the snapshot above.
            match self.store.get(&key) {
                Some(current) if current.status != PositionStatus::Exiting => {}
                _ => continue,
            }
            let record = CompletedTradeRecord::external_exit(&position, Local::now().naive_local());
            self.store.record_completed(&record)?;
            self.store.remove(&key);
            Metrics::reconcile_removed();
            records.push(record);
        }

        if !records.is_empty() {
            self.store.save()?;
            info!(removed = records.len(), "Reconciliation removed positions");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{sample_position, temp_store};
    use optmon_broker::{BrokerPosition, MockBrokerSession, OrderRecord, TradeRecord};
    use optmon_core::{ExitReason, OptionType};
    use optmon_persistence::CompletedTradeLog;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn broker_map(client: &str, rows: &[(&str, i64)]) -> BrokerPositionMap {
        let net = rows.iter().map(|(s, q)| (s.to_string(), *q)).collect();
        let mut map = BrokerPositionMap::new();
        map.insert(client.to_string(), Some(net));
        map
    }

    fn log_len(dir: &TempDir) -> usize {
        CompletedTradeLog::new(dir.path().join("completed_option_trades.jsonl"))
            .read_all()
            .unwrap()
            .len()
    }

    #[test]
    fn test_zero_net_is_external_exit() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        let a = sample_position("C1", "A", OptionType::Call);
        let b = sample_position("C1", "B", OptionType::Put);
        store.upsert(a.key(), a);
        store.upsert(b.key(), b);

        let reconciler = Reconciler::new(store.clone());
        let removed = reconciler
            .reconcile(&broker_map("C1", &[("A", 0), ("B", 50)]))
            .unwrap();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].symbol, "A");
        assert_eq!(removed[0].exit_reason, ExitReason::ExternalExit);
        assert_eq!(removed[0].pnl, Decimal::ZERO);
        assert!(store.get("C1_A").is_none());
        assert!(store.get("C1_B").is_some());
        assert_eq!(log_len(&dir), 1);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        let a = sample_position("C1", "A", OptionType::Call);
        let b = sample_position("C1", "B", OptionType::Call);
        store.upsert(a.key(), a);
        store.upsert(b.key(), b);
        let reconciler = Reconciler::new(store.clone());
        let broker = broker_map("C1", &[("B", 50)]);

        assert_eq!(reconciler.reconcile(&broker).unwrap().len(), 1);
        let after_first = store.all();
        assert!(reconciler.reconcile(&broker).unwrap().is_empty());
        assert_eq!(store.all(), after_first);
        assert_eq!(log_len(&dir), 1);
    }

    #[test]
    fn test_missing_and_partial_quantities() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        for symbol in ["MISSING", "PARTIAL", "SHORT", "FULL", "MORE"] {
            let p = sample_position("C1", symbol, OptionType::Call);
            store.upsert(p.key(), p);
        }

        let removed = Reconciler::new(store.clone())
            .reconcile(&broker_map(
                "C1",
                &[("PARTIAL", 25), ("SHORT", -50), ("FULL", 50), ("MORE", 75), ("OTHER", 10)],
            ))
            .unwrap();

        let mut symbols: Vec<_> = removed.iter().map(|r| r.symbol.clone()).collect();
        symbols.sort();
        assert_eq!(symbols, vec!["MISSING", "PARTIAL", "SHORT"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_unknown_or_failed_account_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        for client in ["C1", "C2"] {
            let p = sample_position(client, "A", OptionType::Call);
            store.upsert(p.key(), p);
        }

        let mut broker = BrokerPositionMap::new();
        broker.insert("C1".to_string(), None);

        assert!(Reconciler::new(store.clone())
            .reconcile(&broker)
            .unwrap()
            .is_empty());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_flat_account_position_is_purged() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        let p = sample_position("C1", "A", OptionType::Call);
        store.upsert(p.key(), p);

        let registry = BrokerRegistry::new();
        let broker = Arc::new(MockBrokerSession::new());
        broker.set_positions(Some(vec![BrokerPosition {
            trading_symbol: "A".to_string(),
            exchange: "NFO".to_string(),
            net_qty: dec!(0),
        }]));
        registry.insert("C1", broker);

        let all = fetch_all_broker_positions(&registry).await;
        assert_eq!(all["C1"].as_ref().map(HashMap::len), Some(0));

        let removed = Reconciler::new(store.clone()).reconcile(&all).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].exit_reason, ExitReason::ExternalExit);
        assert!(store.is_empty());
        assert_eq!(log_len(&dir), 1);
    }

    #[test]
    fn test_empty_book_purges_account() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        for symbol in ["A", "B"] {
            let p = sample_position("C1", symbol, OptionType::Call);
            store.upsert(p.key(), p);
        }
        let other = sample_position("C2", "A", OptionType::Call);
        store.upsert(other.key(), other);

        let mut broker = BrokerPositionMap::new();
        broker.insert("C1".to_string(), Some(NetPositions::new()));

        let removed = Reconciler::new(store.clone()).reconcile(&broker).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.get("C2_A").is_some());
    }

    #[test]
    fn test_exiting_position_left_alone() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        let p = sample_position("C1", "A", OptionType::Call);
        store.upsert(p.key(), p);
        let _ = store.try_mark_exiting("C1_A");

        let removed = Reconciler::new(store.clone())
            .reconcile(&broker_map("C1", &[("OTHER", 1)]))
            .unwrap();
        assert!(removed.is_empty());
        assert!(store.get("C1_A").is_some());
    }

    #[tokio::test]
    async fn test_fetch_prefers_position_endpoint() {
        let broker = MockBrokerSession::new();
        broker.set_positions(Some(vec![
            BrokerPosition {
                trading_symbol: "A".to_string(),
                exchange: "NFO".to_string(),
                net_qty: dec!(50),
            },
            BrokerPosition {
                trading_symbol: "B".to_string(),
                exchange: "NFO".to_string(),
                net_qty: dec!(0),
            },
        ]));

        let net = fetch_broker_positions(&broker).await.unwrap();
        assert_eq!(net.get("A"), Some(&50));
        assert!(!net.contains_key("B"));
    }

    #[tokio::test]
    async fn test_fetch_derives_from_books() {
        let broker = MockBrokerSession::new();
        let order = |symbol: &str, side: &str, status: &str, qty| OrderRecord {
            order_id: format!("{symbol}-{side}"),
            trading_symbol: symbol.to_string(),
            transaction_type: side.to_string(),
            status: status.to_string(),
            filled_shares: qty,
            ..OrderRecord::default()
        };
        broker.push_order(order("A", "BUY", "complete", dec!(50)));
        broker.push_order(order("B", "BUY", "complete", dec!(50)));
        broker.push_order(order("B", "SELL", "complete", dec!(50)));
        broker.push_order(order("C", "BUY", "rejected", dec!(0)));
        broker.push_order(order("D", "BUY", "complete", dec!(50)));
        // The trade book overrides the order book for D.
        broker.push_trade(TradeRecord {
            trading_symbol: "D".to_string(),
            exchange: "NFO".to_string(),
            transaction_type: "BUY".to_string(),
            fill_size: dec!(25),
        });

        let net = fetch_broker_positions(&broker).await.unwrap();
        assert_eq!(net.get("A"), Some(&50));
        assert!(!net.contains_key("B"));
        assert!(!net.contains_key("C"));
        assert_eq!(net.get("D"), Some(&25));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_none() {
        let broker = MockBrokerSession::new();
        broker.set_books_failure(true);
        assert!(fetch_broker_positions(&broker).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_all_by_client() {
        let registry = BrokerRegistry::new();
        let ok = Arc::new(MockBrokerSession::new());
        ok.set_positions(Some(vec![BrokerPosition {
            trading_symbol: "A".to_string(),
            exchange: "NFO".to_string(),
            net_qty: dec!(50),
        }]));
        let down = Arc::new(MockBrokerSession::new());
        down.set_books_failure(true);
        registry.insert("C1", ok);
        registry.insert("C2", down);

        let all = fetch_all_broker_positions(&registry).await;
        assert_eq!(all["C1"].as_ref().unwrap().get("A"), Some(&50));
        assert!(all["C2"].is_none());
    }
}
