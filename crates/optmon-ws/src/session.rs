//! Dual-channel streaming session.
//!
//! Owns the market-data and order-status channels, the tracked subscription
//! set, and the event queue that carries ticks, order updates and channel
//! state changes to the consumer.

use crate::connection::{ChannelConnection, ChannelKind, ChannelStatus, ConnectionConfig};
use crate::error::{WsError, WsResult};
use crate::order_update::OrderUpdate;
use crate::subscription::{
    control_frame, Subscription, SubscriptionAction, SubscriptionKey, SubscriptionManager,
};
use crate::ws_write_handle::{SendError, WsWriteHandle};
use optmon_core::Tick;
use optmon_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_MARKET_DATA_URL: &str = "wss://smartapisocket.angelone.in/smart-stream";
pub const DEFAULT_ORDER_STATUS_URL: &str = "wss://tns.angelone.in/smart-order-update";

/// Credentials for both channels. Every field is required.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub auth_token: String,
    pub api_key: String,
    pub client_code: String,
    pub feed_token: String,
}

impl Credentials {
    /// # Errors
    ///
    /// `WsError::IncompleteCredentials` naming the first empty field.
    pub fn validate(&self) -> WsResult<()> {
        let fields = [
            ("auth_token", &self.auth_token),
            ("api_key", &self.api_key),
            ("client_code", &self.client_code),
            ("feed_token", &self.feed_token),
        ];
        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(WsError::IncompleteCredentials(*name)),
            None => Ok(()),
        }
    }

    fn bearer(&self) -> String {
        let token = self.auth_token.trim();
        if token.starts_with("Bearer ") {
            token.to_string()
        } else {
            format!("Bearer {token}")
        }
    }
}

/// Session configuration shared by both channels.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub market_data_url: String,
    pub order_status_url: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub subscription_pacing_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            market_data_url: DEFAULT_MARKET_DATA_URL.to_string(),
            order_status_url: DEFAULT_ORDER_STATUS_URL.to_string(),
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 300_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            subscription_pacing_ms: 100,
        }
    }
}

impl SessionConfig {
    fn channel_config(&self, url: String, headers: Vec<(String, String)>) -> ConnectionConfig {
        ConnectionConfig {
            url,
            headers,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            reconnect_max_delay_ms: self.reconnect_max_delay_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            subscription_pacing_ms: self.subscription_pacing_ms,
        }
    }

    fn market_data_config(&self, credentials: &Credentials) -> ConnectionConfig {
        let separator = if self.market_data_url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}clientCode={}&feedToken={}&apiKey={}",
            self.market_data_url,
            separator,
            credentials.client_code,
            credentials.feed_token,
            credentials.api_key
        );
        let headers = vec![
            ("Authorization".to_string(), credentials.bearer()),
            ("x-api-key".to_string(), credentials.api_key.clone()),
            ("x-client-code".to_string(), credentials.client_code.clone()),
            ("x-feed-token".to_string(), credentials.feed_token.clone()),
        ];
        self.channel_config(url, headers)
    }

    fn order_status_config(&self, credentials: &Credentials) -> ConnectionConfig {
        let headers = vec![("Authorization".to_string(), credentials.bearer())];
        self.channel_config(self.order_status_url.clone(), headers)
    }
}

/// Events emitted by the session, in arrival order per channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Tick(Tick),
    OrderUpdate(OrderUpdate),
    ChannelConnected(ChannelKind),
    ChannelDisconnected(ChannelKind),
    /// Reconnect attempts exhausted; the channel stays down until restarted.
    PermanentFailure(ChannelKind),
}

/// Streaming session over the market-data and order-status channels.
///
/// Constructed explicitly and shared by reference; several independent
/// sessions may coexist.
pub struct StreamingSession {
    config: SessionConfig,
    event_tx: mpsc::Sender<SessionEvent>,
    subscriptions: Arc<SubscriptionManager>,
    market_status: Arc<RwLock<ChannelStatus>>,
    order_status: Arc<RwLock<ChannelStatus>>,
    channels: Mutex<Vec<Arc<ChannelConnection>>>,
    market_handle: RwLock<Option<WsWriteHandle>>,
    shutdown_token: CancellationToken,
    stopped: AtomicBool,
}

impl StreamingSession {
    pub fn new(config: SessionConfig, event_tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            config,
            event_tx,
            subscriptions: Arc::new(SubscriptionManager::new()),
            market_status: Arc::new(RwLock::new(ChannelStatus::Disconnected)),
            order_status: Arc::new(RwLock::new(ChannelStatus::Disconnected)),
            channels: Mutex::new(Vec::new()),
            market_handle: RwLock::new(None),
            shutdown_token: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Open both channels. Must be called inside a tokio runtime.
    ///
    /// Idempotent: a running session is left alone, except that channels
    /// that gave up after exhausting their reconnect attempts are restarted.
    /// Returns false if the credentials are incomplete or the session has
    /// been stopped.
    pub fn start(&self, credentials: &Credentials) -> bool {
        if self.is_stopped() {
            warn!("Streaming session already stopped, not starting");
            return false;
        }
        if let Err(e) = credentials.validate() {
            warn!(error = %e, "Not starting streaming session");
            return false;
        }

        let mut channels = self.channels.lock();
        if !channels.is_empty() {
            for channel in channels.iter() {
                if channel.status() == ChannelStatus::Failed {
                    info!(channel = %channel.kind(), "Restarting failed channel");
                    spawn_channel(channel.clone());
                }
            }
            return true;
        }

        info!("Starting streaming session");

        let market = Arc::new(ChannelConnection::new(
            ChannelKind::MarketData,
            self.config.market_data_config(credentials),
            self.market_status.clone(),
            self.subscriptions.clone(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));
        let order = Arc::new(ChannelConnection::new(
            ChannelKind::OrderStatus,
            self.config.order_status_config(credentials),
            self.order_status.clone(),
            self.subscriptions.clone(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));

        *self.market_handle.write() = Some(market.write_handle());

        for channel in [market, order] {
            spawn_channel(channel.clone());
            channels.push(channel);
        }
        true
    }

    /// Track `subscription` and, if the market-data channel is up, send it.
    ///
    /// # Errors
    ///
    /// `WsError::NotConnected` if the channel is down; the set is still
    /// updated and will be replayed on the next connect.
    pub async fn subscribe(&self, subscription: &Subscription) -> WsResult<()> {
        if self.is_stopped() {
            return Err(WsError::Stopped);
        }
        if subscription.is_empty() {
            return Ok(());
        }
        self.subscriptions.add(subscription);
        self.send_control(SubscriptionAction::Subscribe, subscription)
            .await
    }

    /// Stop tracking `subscription` and, if connected, send the unsubscribe.
    ///
    /// # Errors
    ///
    /// `WsError::NotConnected` if the channel is down; the set is still updated.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> WsResult<()> {
        if self.is_stopped() {
            return Err(WsError::Stopped);
        }
        if subscription.is_empty() {
            return Ok(());
        }
        self.subscriptions.remove(subscription);
        self.send_control(SubscriptionAction::Unsubscribe, subscription)
            .await
    }

    async fn send_control(
        &self,
        action: SubscriptionAction,
        subscription: &Subscription,
    ) -> WsResult<()> {
        let handle = self
            .market_handle
            .read()
            .clone()
            .ok_or(WsError::NotConnected)?;
        let frame = control_frame(action, subscription)?;
        handle.send_text(frame).await.map_err(|e| match e {
            SendError::NotConnected => WsError::NotConnected,
            SendError::ChannelClosed => WsError::SendFailed(e.to_string()),
        })
    }

    /// Terminal stop: close both channels, cancel every pending timer and
    /// clear the tracked set. Safe to call from any context.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping streaming session");
        self.shutdown_token.cancel();
        self.subscriptions.clear();
        *self.market_status.write() = ChannelStatus::Stopped;
        *self.order_status.write() = ChannelStatus::Stopped;
        Metrics::ws_disconnected(ChannelKind::MarketData.as_str());
        Metrics::ws_disconnected(ChannelKind::OrderStatus.as_str());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn channel_status(&self, kind: ChannelKind) -> ChannelStatus {
        match kind {
            ChannelKind::MarketData => *self.market_status.read(),
            ChannelKind::OrderStatus => *self.order_status.read(),
        }
    }

    /// True if either channel is connected.
    pub fn is_connected(&self) -> bool {
        self.channel_status(ChannelKind::MarketData) == ChannelStatus::Connected
            || self.channel_status(ChannelKind::OrderStatus) == ChannelStatus::Connected
    }

    pub fn is_subscribed(&self, exchange_type: u8, token: &str) -> bool {
        self.subscriptions.is_tracked(exchange_type, token)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.active_subscriptions()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn spawn_channel(channel: Arc<ChannelConnection>) {
    tokio::spawn(async move {
        if let Err(e) = channel.run().await {
            error!(channel = %channel.kind(), error = %e, "Channel loop ended");
        }
    });
}
