//! Main application orchestration.
//!
//! One control loop with two producers feeding the same evaluation entry
//! point:
//! - streaming ticks, dispatched only to positions on the ticking underlying
//! - a fallback timer that reconciles and, when not push-driven, polls one
//!   price per underlying
//!
//! Exit attempts run on spawned tasks so a slow order verification never
//! stalls tick dispatch. The timer cycle is polled alongside the event
//! branches, so slow broker queries do not hold back ticks either; a tick
//! that fires while the previous cycle is still running is skipped. The
//! `EXITING` status in the store serializes exits of the same position.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use chrono::{Local, NaiveDateTime};
use optmon_broker::{BrokerRegistry, TokenResolver};
use optmon_core::{
    Exchange, ExitReason, MarketHours, MarketStatus, Position, PositionStatus, Price, Tick,
    TIMESTAMP_FORMAT,
};
use optmon_persistence::{CompletedTradeLog, SnapshotFile};
use optmon_position::{
    fetch_all_broker_positions, price_key, ExitOutcome, PositionMonitor, PositionStore,
    PriceCache, Reconciler,
};
use optmon_telemetry::Metrics;
use optmon_ws::{ChannelKind, Credentials, SessionEvent, StreamingSession, Subscription, WsError};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1000;
const CHECK_CHANNEL_CAPACITY: usize = 256;

/// Underlying identified by exchange and instrument token.
type UnderlyingKey = (Exchange, String);

// ============================================================================
// Snapshot
// ============================================================================

/// Operational view of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// Newest entry first.
    pub active_trades: Vec<Position>,
    pub total_pnl: Decimal,
    pub trade_count: usize,
    pub last_update: Option<String>,
    pub market_status: MarketStatus,
    /// `CONNECTED` or `DISCONNECTED`.
    pub websocket_status: String,
}

/// Result of one spawned position check.
#[derive(Debug)]
struct CheckDone {
    key: String,
    outcome: Option<ExitOutcome>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    config: AppConfig,
    store: Arc<PositionStore>,
    brokers: Arc<BrokerRegistry>,
    resolver: Arc<dyn TokenResolver>,
    monitor: Arc<PositionMonitor>,
    reconciler: Reconciler,
    market_hours: MarketHours,
    /// `None` when streaming credentials are incomplete.
    session: Option<StreamingSession>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    check_tx: mpsc::Sender<CheckDone>,
    check_rx: Mutex<Option<mpsc::Receiver<CheckDone>>>,
    /// Open position keys per underlying, rebuilt on every store mutation.
    by_underlying: RwLock<HashMap<UnderlyingKey, Vec<String>>>,
    /// Keys with a check task running.
    in_flight: Arc<Mutex<HashSet<String>>>,
    push_driven: AtomicBool,
    last_update: RwLock<Option<NaiveDateTime>>,
    /// Time source for timer cycles.
    clock: fn() -> NaiveDateTime,
    shutdown_token: CancellationToken,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl Orchestrator {
    /// Build the orchestrator and load persisted positions.
    ///
    /// Nothing connects until [`Orchestrator::run`].
    pub fn new(
        config: AppConfig,
        brokers: Arc<BrokerRegistry>,
        resolver: Arc<dyn TokenResolver>,
    ) -> AppResult<Self> {
        let market_hours = config.monitor.market_hours()?;

        let store = Arc::new(PositionStore::new(
            SnapshotFile::new(&config.persistence.trades_file),
            CompletedTradeLog::new(&config.persistence.completed_trades_file),
        ));
        let loaded = store.load();
        info!(
            loaded,
            trades_file = %config.persistence.trades_file,
            "Position store loaded"
        );

        let prices = Arc::new(PriceCache::new(config.monitor.price_cache_ttl()));
        let monitor = Arc::new(PositionMonitor::new(
            store.clone(),
            brokers.clone(),
            prices,
            config.monitor.monitor_config(),
        ));
        let reconciler = Reconciler::new(store.clone());

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = if config.credentials.is_complete() {
            Some(StreamingSession::new((&config.streaming).into(), event_tx))
        } else {
            warn!("Streaming credentials incomplete, running poll-only");
            None
        };
        let (check_tx, check_rx) = mpsc::channel(CHECK_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            store,
            brokers,
            resolver,
            monitor,
            reconciler,
            market_hours,
            session,
            event_rx: Mutex::new(Some(event_rx)),
            check_tx,
            check_rx: Mutex::new(Some(check_rx)),
            by_underlying: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            push_driven: AtomicBool::new(false),
            last_update: RwLock::new(None),
            clock: local_now,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Replace the time source used by the run loop's timer cycles.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    pub fn session(&self) -> Option<&StreamingSession> {
        self.session.as_ref()
    }

    /// Whether ticks currently drive evaluation.
    pub fn is_push_driven(&self) -> bool {
        self.push_driven.load(Ordering::SeqCst)
    }

    /// Run until Ctrl-C or [`Orchestrator::shutdown`].
    ///
    /// # Errors
    ///
    /// `AppError::AlreadyRunning` if called twice.
    pub async fn run(&self) -> AppResult<()> {
        let mut event_rx = self.event_rx.lock().take().ok_or(AppError::AlreadyRunning)?;
        let mut check_rx = self.check_rx.lock().take().ok_or(AppError::AlreadyRunning)?;

        info!(
            positions = self.store.len(),
            streaming = self.session.is_some(),
            interval_secs = self.config.monitor.interval_secs,
            "Starting orchestrator"
        );

        self.start_streaming();
        self.recompute_subscriptions().await;

        let mut timer = tokio::time::interval(self.config.monitor.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        let cycle = self.run_cycle_at((self.clock)());
        tokio::pin!(cycle);
        let mut cycle_running = true;

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                Some(event) = event_rx.recv() => {
                    self.handle_event(event).await;
                }

                Some(done) = check_rx.recv() => {
                    self.handle_check_done(done).await;
                }

                _ = &mut cycle, if cycle_running => {
                    cycle_running = false;
                }

                _ = timer.tick() => {
                    if cycle_running {
                        warn!("Previous cycle still running, skipping tick");
                    } else {
                        cycle.set(self.run_cycle_at((self.clock)()));
                        cycle_running = true;
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stop streaming, persist the store and end the run loop.
    ///
    /// Safe to call more than once and from outside the loop.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        if let Some(session) = &self.session {
            session.stop();
        }
        if let Err(e) = self.store.save() {
            error!(?e, "Failed to persist positions on shutdown");
        }
        info!(positions = self.store.len(), "Orchestrator stopped");
    }

    fn start_streaming(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let credentials: Credentials = (&self.config.credentials).into();
        if session.start(&credentials) {
            info!("Streaming session started");
        } else {
            warn!("Streaming session did not start, polling only");
        }
    }

    // ------------------------------------------------------------------------
    // Streaming events
    // ------------------------------------------------------------------------

    pub async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Tick(tick) => {
                self.handle_tick(&tick);
            }
            SessionEvent::OrderUpdate(update) => {
                if let Err(e) = self.monitor.handle_order_update(&update) {
                    warn!(?e, order_id = %update.order.order_id, "Failed to apply order update");
                }
            }
            SessionEvent::ChannelConnected(kind) => {
                info!(channel = kind.as_str(), "Channel connected");
                if kind == ChannelKind::MarketData {
                    self.push_driven.store(true, Ordering::SeqCst);
                    self.recompute_subscriptions().await;
                }
            }
            SessionEvent::ChannelDisconnected(kind) => {
                warn!(channel = kind.as_str(), "Channel disconnected");
                if kind == ChannelKind::MarketData {
                    self.fall_back_to_polling();
                }
            }
            SessionEvent::PermanentFailure(kind) => {
                error!(
                    channel = kind.as_str(),
                    "Channel permanently down until the session is restarted"
                );
                if kind == ChannelKind::MarketData {
                    self.fall_back_to_polling();
                }
            }
        }
    }

    fn fall_back_to_polling(&self) {
        if self.push_driven.swap(false, Ordering::SeqCst) {
            warn!("Market data lost, falling back to polling");
        }
    }

    /// Refresh the cached underlying price and check the positions on it.
    ///
    /// Returns the number of checks dispatched.
    pub fn handle_tick(&self, tick: &Tick) -> usize {
        let Some(exchange) = tick.exchange() else {
            debug!(exchange_type = tick.exchange_type, token = %tick.token, "Tick for unknown exchange");
            return 0;
        };
        let price = tick.last_traded_price;
        self.monitor
            .prices()
            .insert(price_key(exchange, &tick.token), price);
        *self.last_update.write() = Some(local_now());

        let keys = self
            .by_underlying
            .read()
            .get(&(exchange, tick.token.clone()))
            .cloned()
            .unwrap_or_default();

        let mut dispatched = 0;
        for key in keys {
            if self.spawn_check(key, price) {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Check one position on its own task. At most one check per key runs
    /// at a time.
    fn spawn_check(&self, key: String, underlying_price: Price) -> bool {
        if !self.in_flight.lock().insert(key.clone()) {
            debug!(%key, "Check already in flight");
            return false;
        }

        let monitor = self.monitor.clone();
        let in_flight = self.in_flight.clone();
        let check_tx = self.check_tx.clone();
        tokio::spawn(async move {
            let outcome = match monitor.check_position(&key, underlying_price).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(%key, ?e, "Position check failed");
                    None
                }
            };
            in_flight.lock().remove(&key);
            if check_tx.try_send(CheckDone { key, outcome }).is_err() {
                debug!("Check result dropped, loop not draining");
            }
        });
        true
    }

    async fn handle_check_done(&self, done: CheckDone) {
        match done.outcome {
            Some(ExitOutcome::Exited { order_id, pnl, .. }) => {
                info!(key = %done.key, %order_id, %pnl, "Position exited");
                self.recompute_subscriptions().await;
            }
            Some(ExitOutcome::Failed(reason)) => {
                warn!(key = %done.key, %reason, "Exit failed, retrying next cycle");
            }
            Some(ExitOutcome::Pending { order_id }) => {
                warn!(key = %done.key, %order_id, "Exit order unresolved, held as EXITING");
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Fallback timer
    // ------------------------------------------------------------------------

    /// One timer cycle at `now`. Returns false outside market hours.
    pub async fn run_cycle_at(&self, now: NaiveDateTime) -> bool {
        if !self.market_hours.is_open_at(now) {
            debug!(%now, "Market closed, skipping cycle");
            return false;
        }
        let started = Instant::now();

        if self.store.reload_if_modified() {
            info!(positions = self.store.len(), "Reloaded positions from disk");
        }

        let settled = self.monitor.resolve_pending_exits().await;
        if settled > 0 {
            info!(settled, "Settled pending exits");
        }

        let broker_positions = fetch_all_broker_positions(&self.brokers).await;
        match self.reconciler.reconcile(&broker_positions) {
            Ok(removed) if !removed.is_empty() => {
                info!(removed = removed.len(), "Removed externally closed positions");
            }
            Ok(_) => {}
            Err(e) => error!(?e, "Reconciliation failed"),
        }
        self.recompute_subscriptions().await;

        if !self.is_push_driven() || self.config.monitor.fallback_polling {
            let dispatched = self.poll_positions().await;
            debug!(dispatched, push_driven = self.is_push_driven(), "Polled positions");
        }

        self.monitor.prices().purge_expired();
        *self.last_update.write() = Some(now);
        Metrics::monitor_cycle(started.elapsed().as_secs_f64() * 1000.0);
        true
    }

    /// Fetch one price per underlying and check every position on it.
    ///
    /// Without a price the checks still run so expiry exits and
    /// missing-account marking happen. Returns the number dispatched.
    pub async fn poll_positions(&self) -> usize {
        let mut groups: BTreeMap<(Exchange, String), Vec<Position>> = BTreeMap::new();
        for (_, position) in self.store.all() {
            if !position.status.is_evaluable() {
                continue;
            }
            groups
                .entry((
                    position.underlying_exchange,
                    position.underlying_symbol.clone(),
                ))
                .or_default()
                .push(position);
        }

        let mut dispatched = 0;
        for ((exchange, symbol), members) in groups {
            let price = match self.underlying_price(exchange, &symbol, &members).await {
                Some(price) => price,
                None => {
                    warn!(%exchange, %symbol, "No price for underlying");
                    Price::new(Decimal::ZERO)
                }
            };
            for position in members {
                if self.spawn_check(position.key(), price) {
                    dispatched += 1;
                }
            }
        }
        dispatched
    }

    async fn underlying_price(
        &self,
        exchange: Exchange,
        symbol: &str,
        members: &[Position],
    ) -> Option<Price> {
        let token = self
            .resolver
            .resolve_token(symbol, exchange)
            .unwrap_or_default();
        let key = if token.is_empty() {
            price_key(exchange, symbol)
        } else {
            price_key(exchange, &token)
        };
        let prices = self.monitor.prices();
        if let Some(price) = prices.get(&key) {
            return Some(price);
        }

        let broker = members
            .iter()
            .find_map(|position| self.brokers.get(&position.client_id))?;
        prices
            .get_or_fetch(broker.as_ref(), exchange, symbol, &token, &key)
            .await
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Rebuild the underlying index and bring the session's subscription set
    /// in line with the open positions.
    pub async fn recompute_subscriptions(&self) {
        let mut index: HashMap<UnderlyingKey, Vec<String>> = HashMap::new();
        for (key, position) in self.store.all() {
            if !is_open(position.status) {
                continue;
            }
            let exchange = position.underlying_exchange;
            match self
                .resolver
                .resolve_token(&position.underlying_symbol, exchange)
            {
                Some(token) => index.entry((exchange, token)).or_default().push(key),
                None => debug!(
                    %key,
                    underlying = %position.underlying_symbol,
                    "No token for underlying, polling only"
                ),
            }
        }
        let wanted: BTreeSet<UnderlyingKey> = index.keys().cloned().collect();
        *self.by_underlying.write() = index;

        let Some(session) = &self.session else {
            return;
        };
        if session.is_stopped() {
            return;
        }

        let mut to_add: BTreeMap<Exchange, Vec<String>> = BTreeMap::new();
        for (exchange, token) in &wanted {
            if !session.is_subscribed(exchange.type_id(), token) {
                to_add.entry(*exchange).or_default().push(token.clone());
            }
        }

        let mut to_remove: BTreeMap<Exchange, Vec<String>> = BTreeMap::new();
        for key in session.subscriptions() {
            let Some(exchange) = Exchange::from_type_id(key.exchange_type) else {
                continue;
            };
            if !wanted.contains(&(exchange, key.token.clone())) {
                to_remove.entry(exchange).or_default().push(key.token);
            }
        }

        for (exchange, tokens) in to_add {
            info!(%exchange, ?tokens, "Subscribing underlyings");
            let result = session
                .subscribe(&Subscription::ltp(exchange, tokens))
                .await;
            log_subscription_result(result);
        }
        for (exchange, tokens) in to_remove {
            info!(%exchange, ?tokens, "Unsubscribing underlyings");
            let result = session
                .unsubscribe(&Subscription::ltp(exchange, tokens))
                .await;
            log_subscription_result(result);
        }
    }

    // ------------------------------------------------------------------------
    // Caller-facing operations
    // ------------------------------------------------------------------------

    /// Start monitoring `position`. Returns its store key.
    pub async fn track_position(&self, mut position: Position) -> AppResult<String> {
        if position.trade_id.is_empty() {
            position.trade_id = Position::new_trade_id();
        }
        let key = position.key();
        info!(
            %key,
            trade_id = %position.trade_id,
            underlying = %position.underlying_symbol,
            stop_loss = %position.underlying_stop_loss,
            target = %position.underlying_target,
            "Tracking position"
        );

        self.store.upsert(key.clone(), position);
        self.store.save()?;
        self.recompute_subscriptions().await;
        Ok(key)
    }

    /// Exit a position on operator request.
    pub async fn manually_exit(&self, trade_id: &str) -> (bool, String) {
        let Some((key, position)) = self.store.find_by_trade_id(trade_id) else {
            return (false, "Trade not found".to_string());
        };
        if !self.brokers.contains(&position.client_id) {
            return (false, "Client not found".to_string());
        }

        match self.monitor.apply_exit(&key, ExitReason::ManualExit).await {
            Ok(ExitOutcome::Exited { order_id, .. }) => {
                info!(%key, %trade_id, %order_id, "Manual exit completed");
                self.recompute_subscriptions().await;
                (true, "Trade successfully exited".to_string())
            }
            Ok(outcome) => {
                warn!(%key, %trade_id, ?outcome, "Manual exit not completed");
                (false, "Failed to exit trade".to_string())
            }
            Err(e) => {
                error!(%key, %trade_id, ?e, "Manual exit failed");
                (false, "Failed to exit trade".to_string())
            }
        }
    }

    pub fn get_snapshot(&self) -> MonitorSnapshot {
        self.snapshot_at(local_now())
    }

    pub fn snapshot_at(&self, now: NaiveDateTime) -> MonitorSnapshot {
        let mut active_trades: Vec<Position> = self
            .store
            .all()
            .into_iter()
            .map(|(_, position)| position)
            .collect();
        active_trades.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));

        let total_pnl = active_trades.iter().filter_map(|p| p.pnl).sum();
        let connected = self
            .session
            .as_ref()
            .is_some_and(StreamingSession::is_connected);

        MonitorSnapshot {
            trade_count: active_trades.len(),
            active_trades,
            total_pnl,
            last_update: self
                .last_update
                .read()
                .map(|t| t.format(TIMESTAMP_FORMAT).to_string()),
            market_status: self.market_hours.status_at(now),
            websocket_status: if connected {
                "CONNECTED"
            } else {
                "DISCONNECTED"
            }
            .to_string(),
        }
    }
}

/// Statuses that still hold exposure at the broker.
fn is_open(status: PositionStatus) -> bool {
    status.is_evaluable() || status == PositionStatus::Exiting
}

fn log_subscription_result(result: Result<(), WsError>) {
    match result {
        Ok(()) => {}
        Err(WsError::NotConnected) => {
            debug!("Market data channel down, subscription replays on connect");
        }
        Err(e) => warn!(?e, "Subscription update failed"),
    }
}
