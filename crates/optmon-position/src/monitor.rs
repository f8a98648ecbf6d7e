//! Threshold evaluation and exit execution for tracked positions.
//!
//! # Flow
//!
//! ```text
//! underlying price ──► check_position()
//!                         │
//!                         ├─ evaluate() == Hold ──► update_status()  (reporting only)
//!                         │
//!                         └─ evaluate() == Exit ──► apply_exit()
//!                                                    │ try_mark_exiting + save
//!                                                    │ place SELL
//!                                                    │ verify_order_execution()
//!                                                    ├─ filled  ──► completed record, remove, save
//!                                                    ├─ still working ──► cancel, re-check once
//!                                                    │     └─ cancel failed ──► stays EXITING,
//!                                                    │        resolve_pending_exits() next cycle
//!                                                    └─ otherwise ──► back to ACTIVE, save
//! ```

use chrono::{Local, NaiveDateTime};
use optmon_broker::{BrokerRegistry, BrokerSession, OrderParams, TRANSACTION_SELL};
use optmon_core::{
    is_expiry_closing_at, CompletedTradeRecord, Exchange, ExitReason, OptionType, Position,
    PositionStatus, Price, DEFAULT_EXPIRY_EXIT_HOUR,
};
use optmon_telemetry::Metrics;
use optmon_ws::{OrderStatusCode, OrderUpdate};
use rust_decimal::Decimal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::PositionResult;
use crate::price_cache::{price_key, PriceCache};
use crate::store::PositionStore;

/// Minimum option price increment.
pub const OPTION_TICK_SIZE: Decimal = Decimal::from_parts(5, 0, 0, false, 2);

const EXIT_VARIETY: &str = "NORMAL";
const EXIT_DURATION: &str = "DAY";
const LIMIT_FALLBACK_PRICE: &str = "0.1";
const SL_FALLBACK_TRIGGER: &str = "1000.0";

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Order-book polls before an exit is declared unverified.
    pub verify_max_retries: u32,
    /// Delay between order-book polls.
    pub verify_delay: Duration,
    /// Local hour from which positions expiring today are closed.
    pub expiry_exit_hour: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            verify_max_retries: 3,
            verify_delay: Duration::from_secs(5),
            expiry_exit_hour: DEFAULT_EXPIRY_EXIT_HOUR,
        }
    }
}

// ============================================================================
// Decision
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Exit(ExitReason),
}

/// Evaluate `position` against the underlying `price` at local time `now`.
///
/// Calls exit when the underlying reaches the target, puts when it falls to
/// it; stop-loss mirrors that. A non-positive price never trips a threshold.
#[must_use]
pub fn evaluate_at(
    position: &Position,
    price: Price,
    now: NaiveDateTime,
    expiry_exit_hour: u32,
) -> Decision {
    if !position.status.is_evaluable() {
        return Decision::Hold;
    }

    if price.is_positive() {
        let target = position.underlying_target;
        let stop = position.underlying_stop_loss;
        let (target_hit, stop_hit) = match position.option_type {
            OptionType::Call => (price >= target, price <= stop),
            OptionType::Put => (price <= target, price >= stop),
        };
        if target_hit {
            return Decision::Exit(ExitReason::TargetHit);
        }
        if stop_hit {
            return Decision::Exit(ExitReason::StopLossHit);
        }
    }

    if is_expiry_closing_at(&position.expiry, now, expiry_exit_hour) {
        return Decision::Exit(ExitReason::ExpiryClosing);
    }

    Decision::Hold
}

// ============================================================================
// Exit order
// ============================================================================

/// Build the SELL order closing `position`.
///
/// LIMIT prices 1% under the option LTP; SL triggers 1% above it. Both are
/// rounded to the option tick and fall back to fixed prices without an LTP.
#[must_use]
pub fn build_exit_order(position: &Position, option_ltp: Option<Price>) -> OrderParams {
    let ltp = option_ltp.filter(Price::is_positive);
    let order_type = position.exit_order_type.trim().to_ascii_uppercase();

    let (price, trigger_price) = match order_type.as_str() {
        "LIMIT" => {
            let price = ltp
                .map(|p| (p * Decimal::new(99, 2)).round_to_nearest(OPTION_TICK_SIZE).to_string())
                .unwrap_or_else(|| LIMIT_FALLBACK_PRICE.to_string());
            (price, None)
        }
        "SL" => match ltp {
            Some(p) => (
                p.round_to_nearest(OPTION_TICK_SIZE).to_string(),
                Some(
                    (p * Decimal::new(101, 2))
                        .round_to_nearest(OPTION_TICK_SIZE)
                        .to_string(),
                ),
            ),
            None => (
                LIMIT_FALLBACK_PRICE.to_string(),
                Some(SL_FALLBACK_TRIGGER.to_string()),
            ),
        },
        _ => ("0".to_string(), None),
    };

    let product_type = if position.product_type.is_empty() {
        "INTRADAY".to_string()
    } else {
        position.product_type.clone()
    };

    OrderParams {
        variety: EXIT_VARIETY.to_string(),
        trading_symbol: position.symbol.clone(),
        symbol_token: position.token.clone(),
        transaction_type: TRANSACTION_SELL.to_string(),
        exchange: Exchange::Nfo.to_string(),
        order_type,
        product_type,
        duration: EXIT_DURATION.to_string(),
        price,
        trigger_price,
        quantity: position.quantity.to_string(),
    }
}

// ============================================================================
// Verification
// ============================================================================

/// Outcome of polling the order book for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderVerification {
    /// True once the order reached a terminal status.
    pub verified: bool,
    /// Lower-cased venue status, `"unknown"` when unverified.
    pub status: String,
    pub average_price: Price,
    pub filled_quantity: Decimal,
}

impl OrderVerification {
    fn unknown() -> Self {
        Self {
            verified: false,
            status: "unknown".to_string(),
            average_price: Price::ZERO,
            filled_quantity: Decimal::ZERO,
        }
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.verified && matches!(self.status.as_str(), "complete" | "filled")
    }
}

/// Result of an exit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Exited {
        order_id: String,
        exit_price: Price,
        pnl: Decimal,
    },
    /// Order failed or was not confirmed; the position is ACTIVE again.
    Failed(String),
    /// Missing, or not in an exitable status (an exit already in flight).
    NotEligible,
    /// The owning account has no broker session.
    ClientMissing,
    /// The order could not be confirmed or cancelled; the position stays
    /// EXITING until [`PositionMonitor::resolve_pending_exits`] settles it.
    Pending { order_id: String },
}

/// Exit order whose fate is not known yet.
#[derive(Debug, Clone)]
struct PendingExit {
    order_id: String,
    reason: ExitReason,
    option_ltp: Option<Price>,
}

// ============================================================================
// PositionMonitor
// ============================================================================

pub struct PositionMonitor {
    store: Arc<PositionStore>,
    brokers: Arc<BrokerRegistry>,
    prices: Arc<PriceCache>,
    config: MonitorConfig,
    pending_exits: Mutex<HashMap<String, PendingExit>>,
}

impl PositionMonitor {
    #[must_use]
    pub fn new(
        store: Arc<PositionStore>,
        brokers: Arc<BrokerRegistry>,
        prices: Arc<PriceCache>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            brokers,
            prices,
            config,
            pending_exits: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn prices(&self) -> &Arc<PriceCache> {
        &self.prices
    }

    /// Evaluate at the current local time.
    #[must_use]
    pub fn evaluate(&self, position: &Position, price: Price) -> Decision {
        evaluate_at(
            position,
            price,
            Local::now().naive_local(),
            self.config.expiry_exit_hour,
        )
    }

    /// Option LTP through the cache.
    pub async fn option_price(
        &self,
        broker: &dyn BrokerSession,
        position: &Position,
    ) -> Option<Price> {
        let key = price_key(Exchange::Nfo, &position.symbol);
        self.prices
            .get_or_fetch(broker, Exchange::Nfo, &position.symbol, &position.token, &key)
            .await
    }

    /// Evaluate one position and act on the decision.
    ///
    /// Returns the exit outcome if an exit was attempted.
    pub async fn check_position(
        &self,
        key: &str,
        underlying_price: Price,
    ) -> PositionResult<Option<ExitOutcome>> {
        let Some(position) = self.store.get(key) else {
            return Ok(None);
        };
        if !position.status.is_evaluable() {
            return Ok(None);
        }

        let Some(broker) = self.brokers.get(&position.client_id) else {
            self.mark_client_missing(key)?;
            return Ok(None);
        };

        if position.status == PositionStatus::ClientMissing
            && self.store.set_status(key, PositionStatus::Active, None)
        {
            info!(%key, client_id = %position.client_id, "Broker session available again");
            self.store.save()?;
        }

        match self.evaluate(&position, underlying_price) {
            Decision::Hold => {
                let option = self.option_price(broker.as_ref(), &position).await;
                self.update_status(key, underlying_price, option);
                Ok(None)
            }
            Decision::Exit(reason) => {
                info!(
                    %key,
                    %reason,
                    underlying = %underlying_price,
                    target = %position.underlying_target,
                    stop_loss = %position.underlying_stop_loss,
                    "Exit condition met"
                );
                self.apply_exit(key, reason).await.map(Some)
            }
        }
    }

    /// Refresh reporting prices and pnl. Not persisted.
    pub fn update_status(
        &self,
        key: &str,
        underlying_price: Price,
        option_price: Option<Price>,
    ) -> Option<Position> {
        self.store
            .touch_prices(key, underlying_price, option_price, Local::now().naive_local())
    }

    /// Close the position under `key` with a SELL order.
    pub async fn apply_exit(&self, key: &str, reason: ExitReason) -> PositionResult<ExitOutcome> {
        let Some(position) = self.store.get(key) else {
            return Ok(ExitOutcome::NotEligible);
        };
        let Some(broker) = self.brokers.get(&position.client_id) else {
            self.mark_client_missing(key)?;
            return Ok(ExitOutcome::ClientMissing);
        };

        let Some(position) = self.store.try_mark_exiting(key) else {
            debug!(%key, "Exit already in flight or position not open");
            return Ok(ExitOutcome::NotEligible);
        };
        if let Err(e) = self.store.save() {
            self.store.set_status(key, position.status, None);
            return Err(e);
        }

        let option_ltp = self.option_price(broker.as_ref(), &position).await;
        let params = build_exit_order(&position, option_ltp);
        info!(
            %key,
            %reason,
            order_type = %params.order_type,
            price = %params.price,
            quantity = %params.quantity,
            "Placing exit order"
        );

        let order_id = match broker.place_order(params).await {
            Ok(order_id) => order_id,
            Err(e) => {
                error!(%key, ?e, "Exit order placement failed");
                return Ok(self.revert_exit(key, format!("order placement failed: {e}")));
            }
        };

        let verification = self.verify_order_execution(broker.as_ref(), &order_id).await;
        let verification = if verification.verified {
            verification
        } else {
            match self.cancel_unconfirmed(broker.as_ref(), key, &order_id).await {
                Some(settled) => settled,
                None => {
                    self.pending_exits.lock().insert(
                        key.to_string(),
                        PendingExit {
                            order_id: order_id.clone(),
                            reason,
                            option_ltp,
                        },
                    );
                    return Ok(ExitOutcome::Pending { order_id });
                }
            }
        };
        self.settle_exit(key, &position, reason, order_id, verification, option_ltp)
    }

    /// Complete or roll back an exit whose order reached a known state.
    fn settle_exit(
        &self,
        key: &str,
        position: &Position,
        reason: ExitReason,
        order_id: String,
        verification: OrderVerification,
        option_ltp: Option<Price>,
    ) -> PositionResult<ExitOutcome> {
        if !verification.is_filled() {
            warn!(%key, %order_id, status = %verification.status, "Exit order not filled");
            return Ok(self.revert_exit(
                key,
                format!("exit order {order_id} {}", verification.status),
            ));
        }

        let exit_price = if verification.average_price.is_positive() {
            verification.average_price
        } else {
            option_ltp.unwrap_or(Price::ZERO)
        };
        let (pnl, pnl_percent) = position.pnl_at(exit_price);
        let record = CompletedTradeRecord::from_position(
            position,
            exit_price,
            pnl,
            pnl_percent,
            reason,
            order_id.clone(),
            Local::now().naive_local(),
        );
        self.store.complete(key, &record)?;
        Metrics::exit_completed(&reason.to_string());

        info!(%key, %order_id, %exit_price, %pnl, %reason, "Position exited");
        Ok(ExitOutcome::Exited {
            order_id,
            exit_price,
            pnl,
        })
    }

    /// Cancel an order that never reached a terminal status, then look at it
    /// once more. `None` if the cancel was refused, so the order may still fill.
    async fn cancel_unconfirmed(
        &self,
        broker: &dyn BrokerSession,
        key: &str,
        order_id: &str,
    ) -> Option<OrderVerification> {
        if let Err(e) = broker.cancel_order(EXIT_VARIETY, order_id).await {
            error!(%key, %order_id, ?e, "Cancel of unconfirmed exit order failed");
            return None;
        }
        let settled = self.lookup_order(broker, order_id).await;
        if settled.verified {
            return Some(settled);
        }
        info!(%key, %order_id, "Unconfirmed exit order cancelled");
        Some(OrderVerification {
            verified: true,
            status: "cancelled".to_string(),
            ..settled
        })
    }

    /// Exits left EXITING by a refused cancel.
    pub fn pending_exit_keys(&self) -> Vec<String> {
        self.pending_exits.lock().keys().cloned().collect()
    }

    /// Settle exits whose order could not be confirmed or cancelled earlier.
    ///
    /// Each order is looked up once; a fill completes the position, a dead
    /// order returns it to ACTIVE, and a still-working order is cancelled
    /// again. Returns the number settled.
    pub async fn resolve_pending_exits(&self) -> usize {
        let keys = self.pending_exit_keys();
        let mut settled = 0;
        for key in keys {
            let Some(exit) = self.pending_exits.lock().remove(&key) else {
                continue;
            };
            let Some(position) = self
                .store
                .get(&key)
                .filter(|p| p.status == PositionStatus::Exiting)
            else {
                debug!(%key, order_id = %exit.order_id, "Pending exit no longer tracked");
                continue;
            };
            let Some(broker) = self.brokers.get(&position.client_id) else {
                self.pending_exits.lock().insert(key, exit);
                continue;
            };

            let lookup = self.lookup_order(broker.as_ref(), &exit.order_id).await;
            let verification = if lookup.verified {
                lookup
            } else {
                match self.cancel_unconfirmed(broker.as_ref(), &key, &exit.order_id).await {
                    Some(v) => v,
                    None => {
                        self.pending_exits.lock().insert(key, exit);
                        continue;
                    }
                }
            };
            match self.settle_exit(
                &key,
                &position,
                exit.reason,
                exit.order_id,
                verification,
                exit.option_ltp,
            ) {
                Ok(_) => settled += 1,
                Err(e) => error!(%key, ?e, "Failed to settle pending exit"),
            }
        }
        settled
    }

    fn revert_exit(&self, key: &str, message: String) -> ExitOutcome {
        self.store.set_status(key, PositionStatus::Active, None);
        if let Err(e) = self.store.save() {
            error!(%key, ?e, "Failed to persist exit rollback");
        }
        Metrics::exit_failed();
        ExitOutcome::Failed(message)
    }

    fn mark_client_missing(&self, key: &str) -> PositionResult<()> {
        if self
            .store
            .set_status(key, PositionStatus::ClientMissing, None)
        {
            warn!(%key, "No broker session for position's account");
            self.store.save()?;
        }
        Ok(())
    }

    /// Poll the order book until `order_id` reaches a terminal status.
    pub async fn verify_order_execution(
        &self,
        broker: &dyn BrokerSession,
        order_id: &str,
    ) -> OrderVerification {
        let retries = self.config.verify_max_retries.max(1);
        for attempt in 1..=retries {
            let verification = self.lookup_order(broker, order_id).await;
            if verification.verified {
                debug!(%order_id, status = %verification.status, attempt, "Order verified");
                return verification;
            }
            if attempt < retries {
                tokio::time::sleep(self.config.verify_delay).await;
            }
        }
        OrderVerification::unknown()
    }

    /// One order-book lookup. Unverified unless the order is terminal.
    async fn lookup_order(&self, broker: &dyn BrokerSession, order_id: &str) -> OrderVerification {
        match broker.order_book().await {
            Ok(book) => book
                .iter()
                .find(|o| o.order_id == order_id && o.is_terminal())
                .map_or_else(OrderVerification::unknown, |order| OrderVerification {
                    verified: true,
                    status: order.status.to_ascii_lowercase(),
                    average_price: Price::new(order.average_price),
                    filled_quantity: order.filled_shares,
                }),
            Err(e) => {
                warn!(%order_id, ?e, "Order book fetch failed");
                OrderVerification::unknown()
            }
        }
    }

    /// Apply an order-status event to the position whose entry order it is.
    ///
    /// Returns true if a position was updated.
    pub fn handle_order_update(&self, update: &OrderUpdate) -> PositionResult<bool> {
        if update.is_connect_ack() {
            return Ok(false);
        }
        let order_id = &update.order.order_id;
        let Some((key, _)) = self.store.find_by_order_id(order_id) else {
            debug!(%order_id, code = update.code.as_str(), "Order update for untracked order");
            return Ok(false);
        };

        let updated = self.store.update(&key, |p| {
            p.order_status = Some(update.code.as_str().to_string());
            if p.status == PositionStatus::Exiting {
                return;
            }
            match update.code {
                OrderStatusCode::Complete => {
                    p.status = PositionStatus::Active;
                    if update.order.average_price > Decimal::ZERO {
                        p.entry_price = Price::new(update.order.average_price);
                    }
                }
                OrderStatusCode::Open => p.status = PositionStatus::Active,
                OrderStatusCode::Cancelled => {
                    p.status = PositionStatus::Cancelled;
                    p.status_reason = Some(update.order.text.clone());
                }
                OrderStatusCode::Rejected => {
                    p.status = PositionStatus::Rejected;
                    p.status_reason = Some(update.order.text.clone());
                }
                OrderStatusCode::Connected | OrderStatusCode::Other(_) => {}
            }
        });

        match updated {
            Some(position) => {
                info!(
                    %key,
                    code = update.code.as_str(),
                    status = %position.status,
                    "Entry order update applied"
                );
                self.store.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{sample_position, temp_store};
    use chrono::NaiveDate;
    use optmon_broker::MockBrokerSession;
    use optmon_persistence::CompletedTradeLog;
    use optmon_ws::parse_order_update;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn px(v: Decimal) -> Price {
        Price::new(v)
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<PositionStore>,
        broker: Arc<MockBrokerSession>,
        monitor: Arc<PositionMonitor>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(temp_store(&dir));
        let broker = Arc::new(MockBrokerSession::new());
        let registry = Arc::new(BrokerRegistry::new());
        registry.insert("C1", broker.clone());
        let monitor = Arc::new(PositionMonitor::new(
            store.clone(),
            registry,
            Arc::new(PriceCache::default()),
            MonitorConfig {
                verify_max_retries: 2,
                verify_delay: Duration::from_millis(10),
                expiry_exit_hour: 15,
            },
        ));
        Fixture {
            dir,
            store,
            broker,
            monitor,
        }
    }

    fn completed(fx: &Fixture) -> Vec<CompletedTradeRecord> {
        CompletedTradeLog::new(fx.dir.path().join("completed_option_trades.jsonl"))
            .read_all()
            .unwrap()
    }

    // ------------------------------------------------------------------------
    // evaluate
    // ------------------------------------------------------------------------

    #[test]
    fn test_call_price_sequence() {
        let pos = sample_position("C1", "CE1", OptionType::Call);
        let now = at(20, 10, 0);
        let decisions: Vec<_> = [dec!(100), dec!(108), dec!(111)]
            .into_iter()
            .map(|p| evaluate_at(&pos, px(p), now, 15))
            .collect();
        assert_eq!(
            decisions,
            vec![
                Decision::Hold,
                Decision::Hold,
                Decision::Exit(ExitReason::TargetHit)
            ]
        );
        assert_eq!(
            evaluate_at(&pos, px(dec!(95)), now, 15),
            Decision::Exit(ExitReason::StopLossHit)
        );
    }

    #[test]
    fn test_put_price_sequence() {
        let mut pos = sample_position("C1", "PE1", OptionType::Put);
        pos.underlying_stop_loss = px(dec!(110));
        pos.underlying_target = px(dec!(90));
        let now = at(20, 10, 0);

        assert_eq!(evaluate_at(&pos, px(dec!(100)), now, 15), Decision::Hold);
        assert_eq!(
            evaluate_at(&pos, px(dec!(111)), now, 15),
            Decision::Exit(ExitReason::StopLossHit)
        );
        assert_eq!(
            evaluate_at(&pos, px(dec!(90)), now, 15),
            Decision::Exit(ExitReason::TargetHit)
        );
    }

    #[test]
    fn test_expiry_closing() {
        let mut pos = sample_position("C1", "CE1", OptionType::Call);
        pos.expiry = "27MAR2025".to_string();

        assert_eq!(evaluate_at(&pos, px(dec!(100)), at(27, 14, 59), 15), Decision::Hold);
        assert_eq!(
            evaluate_at(&pos, px(dec!(100)), at(27, 15, 0), 15),
            Decision::Exit(ExitReason::ExpiryClosing)
        );
        assert_eq!(evaluate_at(&pos, px(dec!(100)), at(26, 15, 10), 15), Decision::Hold);
    }

    #[test]
    fn test_exiting_and_terminal_statuses_hold() {
        let mut pos = sample_position("C1", "CE1", OptionType::Call);
        for status in [
            PositionStatus::Exiting,
            PositionStatus::Rejected,
            PositionStatus::Cancelled,
            PositionStatus::Exited,
        ] {
            pos.status = status;
            assert_eq!(evaluate_at(&pos, px(dec!(200)), at(20, 10, 0), 15), Decision::Hold);
        }
    }

    #[test]
    fn test_zero_price_never_trips() {
        let pos = sample_position("C1", "CE1", OptionType::Call);
        assert_eq!(evaluate_at(&pos, Price::ZERO, at(20, 10, 0), 15), Decision::Hold);
    }

    // ------------------------------------------------------------------------
    // build_exit_order
    // ------------------------------------------------------------------------

    #[test]
    fn test_exit_order_market() {
        let pos = sample_position("C1", "CE1", OptionType::Call);
        let order = build_exit_order(&pos, Some(px(dec!(10))));
        assert_eq!(order.transaction_type, "SELL");
        assert_eq!(order.exchange, "NFO");
        assert_eq!(order.variety, "NORMAL");
        assert_eq!(order.order_type, "MARKET");
        assert_eq!(order.price, "0");
        assert_eq!(order.quantity, "50");
        assert_eq!(order.trigger_price, None);
    }

    #[test]
    fn test_exit_order_limit_and_sl() {
        let mut pos = sample_position("C1", "CE1", OptionType::Call);
        pos.exit_order_type = "LIMIT".to_string();
        assert_eq!(build_exit_order(&pos, Some(px(dec!(124.77)))).price, "123.5");
        assert_eq!(build_exit_order(&pos, None).price, "0.1");

        pos.exit_order_type = "SL".to_string();
        let sl = build_exit_order(&pos, Some(px(dec!(100))));
        assert_eq!(sl.price, "100");
        assert_eq!(sl.trigger_price.as_deref(), Some("101"));
        let fallback = build_exit_order(&pos, None);
        assert_eq!(fallback.price, "0.1");
        assert_eq!(fallback.trigger_price.as_deref(), Some("1000.0"));
    }

    // ------------------------------------------------------------------------
    // apply_exit
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_apply_exit_success() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos.clone());
        fx.broker.set_ltp("CE1", dec!(12));
        fx.broker.set_fill("complete", dec!(12.5));

        let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit).await.unwrap();
        match outcome {
            ExitOutcome::Exited {
                exit_price, pnl, ..
            } => {
                assert_eq!(exit_price, px(dec!(12.5)));
                assert_eq!(pnl, dec!(125));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(fx.store.get("C1_CE1").is_none());
        let records = completed(&fx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].exit_reason, ExitReason::TargetHit);
        assert_eq!(fx.broker.placed_orders()[0].trading_symbol, "CE1");
    }

    #[tokio::test]
    async fn test_apply_exit_uses_ltp_when_average_is_zero() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_ltp("CE1", dec!(8));

        let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::StopLossHit).await.unwrap();
        assert!(matches!(
            outcome,
            ExitOutcome::Exited { exit_price, .. } if exit_price == px(dec!(8))
        ));
    }

    #[tokio::test]
    async fn test_apply_exit_rejected_reverts_to_active() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_fill("rejected", Decimal::ZERO);

        let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Failed(_)));
        assert_eq!(fx.store.get("C1_CE1").unwrap().status, PositionStatus::Active);
        assert!(completed(&fx).is_empty());
    }

    #[tokio::test]
    async fn test_apply_exit_placement_failure_reverts() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_place_failure(Some("margin shortfall"));

        let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Failed(msg) if msg.contains("margin shortfall")));
        assert_eq!(fx.store.get("C1_CE1").unwrap().status, PositionStatus::Active);
    }

    #[tokio::test]
    async fn test_apply_exit_unverified_order_is_cancelled() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_fill("open", Decimal::ZERO);

        let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Failed(msg) if msg.ends_with("cancelled")));
        assert_eq!(fx.broker.cancelled_orders(), vec!["MOCK-1".to_string()]);
        assert_eq!(fx.store.get("C1_CE1").unwrap().status, PositionStatus::Active);
        assert!(fx.monitor.pending_exit_keys().is_empty());
    }

    #[tokio::test]
    async fn test_retried_exit_never_leaves_two_working_orders() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_fill("open", Decimal::ZERO);

        for _ in 0..2 {
            let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit).await.unwrap();
            assert!(matches!(outcome, ExitOutcome::Failed(_)));
        }
        assert_eq!(fx.broker.place_count(), 2);
        assert_eq!(
            fx.broker.cancelled_orders(),
            vec!["MOCK-1".to_string(), "MOCK-2".to_string()]
        );
        let working = fx
            .broker
            .order_book()
            .await
            .unwrap()
            .into_iter()
            .filter(|o| !o.is_terminal())
            .count();
        assert_eq!(working, 0);
    }

    #[tokio::test]
    async fn test_refused_cancel_keeps_position_exiting() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_fill("open", Decimal::ZERO);
        fx.broker.set_cancel_failure(true);

        let outcome = fx.monitor.apply_exit("C1_CE1", ExitReason::StopLossHit).await.unwrap();
        assert_eq!(
            outcome,
            ExitOutcome::Pending {
                order_id: "MOCK-1".to_string()
            }
        );
        assert_eq!(fx.store.get("C1_CE1").unwrap().status, PositionStatus::Exiting);
        assert_eq!(fx.monitor.pending_exit_keys(), vec!["C1_CE1".to_string()]);

        let again = fx.monitor.apply_exit("C1_CE1", ExitReason::StopLossHit).await.unwrap();
        assert_eq!(again, ExitOutcome::NotEligible);
        assert_eq!(fx.broker.place_count(), 1);

        // Still working and still refusing cancels: nothing settles.
        assert_eq!(fx.monitor.resolve_pending_exits().await, 0);
        assert_eq!(fx.monitor.pending_exit_keys().len(), 1);

        fx.broker.set_order_status("MOCK-1", "complete", dec!(9.5));
        assert_eq!(fx.monitor.resolve_pending_exits().await, 1);
        assert!(fx.store.get("C1_CE1").is_none());
        assert!(fx.monitor.pending_exit_keys().is_empty());
        let records = completed(&fx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].exit_reason, ExitReason::StopLossHit);
        assert_eq!(records[0].exit_price, px(dec!(9.5)));
    }

    #[tokio::test]
    async fn test_pending_exit_reverts_once_cancel_goes_through() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_fill("open", Decimal::ZERO);
        fx.broker.set_cancel_failure(true);
        fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit).await.unwrap();

        fx.broker.set_cancel_failure(false);
        assert_eq!(fx.monitor.resolve_pending_exits().await, 1);
        assert_eq!(fx.broker.cancelled_orders(), vec!["MOCK-1".to_string()]);
        assert_eq!(fx.store.get("C1_CE1").unwrap().status, PositionStatus::Active);
        assert!(completed(&fx).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_exits_place_one_order() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_place_delay(Duration::from_millis(50));
        fx.broker.set_fill("complete", dec!(11));

        let (a, b) = tokio::join!(
            fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit),
            fx.monitor.apply_exit("C1_CE1", ExitReason::TargetHit),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, ExitOutcome::Exited { .. }))
                .count(),
            1
        );
        assert!(outcomes.contains(&ExitOutcome::NotEligible));
        assert_eq!(fx.broker.place_count(), 1);
        assert_eq!(completed(&fx).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_exits_across_tasks() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_place_delay(Duration::from_millis(50));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let monitor = fx.monitor.clone();
                tokio::spawn(async move {
                    monitor.apply_exit("C1_CE1", ExitReason::StopLossHit).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fx.broker.place_count(), 1);
    }

    // ------------------------------------------------------------------------
    // check_position
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_check_position_hold_updates_status() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_ltp("CE1", dec!(11));

        let outcome = fx.monitor.check_position("C1_CE1", px(dec!(104))).await.unwrap();
        assert!(outcome.is_none());
        let updated = fx.store.get("C1_CE1").unwrap();
        assert_eq!(updated.current_underlying_price, Some(px(dec!(104))));
        assert_eq!(updated.current_option_price, Some(px(dec!(11))));
        assert_eq!(updated.pnl, Some(dec!(50)));
        assert!(updated.last_updated.is_some());
        assert_eq!(fx.broker.place_count(), 0);
    }

    #[tokio::test]
    async fn test_check_position_exits_on_target() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        fx.broker.set_fill("complete", dec!(15));

        let outcome = fx.monitor.check_position("C1_CE1", px(dec!(111))).await.unwrap();
        assert!(matches!(outcome, Some(ExitOutcome::Exited { .. })));
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_client_missing_kept_and_resumed() {
        let fx = fixture();
        let pos = sample_position("C9", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);

        let outcome = fx.monitor.check_position("C9_CE1", px(dec!(111))).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(
            fx.store.get("C9_CE1").unwrap().status,
            PositionStatus::ClientMissing
        );

        fx.monitor.brokers.insert("C9", fx.broker.clone());
        fx.broker.set_fill("complete", dec!(15));
        let outcome = fx.monitor.check_position("C9_CE1", px(dec!(111))).await.unwrap();
        assert!(matches!(outcome, Some(ExitOutcome::Exited { .. })));
    }

    // ------------------------------------------------------------------------
    // handle_order_update
    // ------------------------------------------------------------------------

    #[test]
    fn test_order_update_complete_sets_entry_price() {
        let fx = fixture();
        let mut pos = sample_position("C1", "CE1", OptionType::Call);
        pos.status = PositionStatus::Pending;
        fx.store.upsert(pos.key(), pos);

        let update = parse_order_update(
            r#"{"order-status":"AB05","orderData":{"orderid":"entry-CE1","averageprice":"10.45"}}"#,
        )
        .unwrap();
        assert!(fx.monitor.handle_order_update(&update).unwrap());

        let updated = fx.store.get("C1_CE1").unwrap();
        assert_eq!(updated.status, PositionStatus::Active);
        assert_eq!(updated.entry_price, px(dec!(10.45)));
        assert_eq!(updated.order_status.as_deref(), Some("AB05"));
    }

    #[test]
    fn test_order_update_rejected_records_reason() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);

        let update = parse_order_update(
            r#"{"order-status":"AB03","orderData":{"orderid":"entry-CE1","text":"RMS: margin"}}"#,
        )
        .unwrap();
        assert!(fx.monitor.handle_order_update(&update).unwrap());

        let updated = fx.store.get("C1_CE1").unwrap();
        assert_eq!(updated.status, PositionStatus::Rejected);
        assert_eq!(updated.status_reason.as_deref(), Some("RMS: margin"));
    }

    #[test]
    fn test_order_update_ignores_unknown_and_ack() {
        let fx = fixture();
        let ack = parse_order_update(r#"{"order-status":"AB00"}"#).unwrap();
        assert!(!fx.monitor.handle_order_update(&ack).unwrap());

        let other = parse_order_update(
            r#"{"order-status":"AB05","orderData":{"orderid":"nobody"}}"#,
        )
        .unwrap();
        assert!(!fx.monitor.handle_order_update(&other).unwrap());
    }

    #[test]
    fn test_order_update_does_not_release_exit_lock() {
        let fx = fixture();
        let pos = sample_position("C1", "CE1", OptionType::Call);
        fx.store.upsert(pos.key(), pos);
        let _ = fx.store.try_mark_exiting("C1_CE1");

        let update = parse_order_update(
            r#"{"order-status":"AB05","orderData":{"orderid":"entry-CE1","averageprice":11}}"#,
        )
        .unwrap();
        fx.monitor.handle_order_update(&update).unwrap();
        assert_eq!(fx.store.get("C1_CE1").unwrap().status, PositionStatus::Exiting);
    }
}
