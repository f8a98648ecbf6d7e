//! Streaming channel connection.
//!
//! Each logical channel runs a single loop: connect, serve frames until the
//! socket drops, back off, retry. The loop is the only place a retry is
//! scheduled, so a channel never has more than one reconnect timer pending.

use crate::decoder::decode_tick;
use crate::error::{WsError, WsResult};
use crate::heartbeat::{is_pong, HeartbeatManager, PING_FRAME};
use crate::order_update::parse_order_update;
use crate::session::SessionEvent;
use crate::subscription::{control_frame, SubscriptionAction, SubscriptionManager};
use crate::ws_write_handle::WsWriteHandle;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use optmon_telemetry::Metrics;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Longest an I/O loop waits on a full event queue before dropping.
pub const EMIT_GRACE: Duration = Duration::from_millis(250);

fn event_label(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Tick(_) => "tick",
        SessionEvent::OrderUpdate(_) => "order_update",
        SessionEvent::ChannelConnected(_)
        | SessionEvent::ChannelDisconnected(_)
        | SessionEvent::PermanentFailure(_) => "channel_state",
    }
}

/// Logical streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    MarketData,
    OrderStatus,
}

impl ChannelKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::OrderStatus => "order_status",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel state.
///
/// `Stopped` is terminal. `Failed` means the reconnect attempts ran out; the
/// channel stays down until the session is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Stopped,
}

/// Exponential reconnect backoff without jitter.
///
/// `delay = min(base * 2^(attempt-1), max)`; `reset()` after a successful
/// connect puts the next delay back at `base`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    /// 0 = retry forever.
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_ms,
            max_ms,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts`
    /// consecutive retries have been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);

        let exponent = (self.attempt - 1).min(10);
        let delay = self.base_ms.saturating_mul(1u64 << exponent).min(self.max_ms);
        Some(Duration::from_millis(delay))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Connection configuration for one channel.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Full WebSocket URL, query included.
    pub url: String,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed attempts before the channel is declared failed (0 = infinite).
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// Pause between control frames during subscription replay.
    pub subscription_pacing_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 300_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            subscription_pacing_ms: 100,
        }
    }
}

/// One streaming channel and its reconnect loop.
pub struct ChannelConnection {
    kind: ChannelKind,
    config: ConnectionConfig,
    status: Arc<RwLock<ChannelStatus>>,
    subscriptions: Arc<SubscriptionManager>,
    heartbeat: HeartbeatManager,
    event_tx: mpsc::Sender<SessionEvent>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: TokioMutex<mpsc::Receiver<String>>,
    shutdown_token: CancellationToken,
    running: AtomicBool,
}

impl ChannelConnection {
    pub fn new(
        kind: ChannelKind,
        config: ConnectionConfig,
        status: Arc<RwLock<ChannelStatus>>,
        subscriptions: Arc<SubscriptionManager>,
        event_tx: mpsc::Sender<SessionEvent>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        Self {
            kind,
            heartbeat: HeartbeatManager::new(config.heartbeat_interval_ms),
            config,
            status,
            subscriptions,
            event_tx,
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            shutdown_token,
            running: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.read()
    }

    /// Handle for queueing text frames on this channel.
    pub fn write_handle(&self) -> WsWriteHandle {
        WsWriteHandle::new(self.outbound_tx.clone(), self.status.clone())
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    fn set_status(&self, status: ChannelStatus) {
        let mut current = self.status.write();
        if *current != ChannelStatus::Stopped {
            *current = status;
        }
    }

    /// Run the connect/serve/reconnect loop until shutdown or until the
    /// reconnect attempts are exhausted. A second concurrent call returns
    /// immediately.
    pub async fn run(&self) -> WsResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(channel = %self.kind, "Channel loop already running");
            return Ok(());
        }
        let result = self.connect_with_retry().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn connect_with_retry(&self) -> WsResult<()> {
        let mut backoff = ReconnectBackoff::new(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
            self.config.max_reconnect_attempts,
        );

        loop {
            if self.is_shutdown() {
                info!(channel = %self.kind, "Shutdown requested, exiting connect loop");
                self.set_status(ChannelStatus::Stopped);
                return Ok(());
            }

            self.set_status(ChannelStatus::Connecting);

            let mut connected = false;
            let result = self.try_connect(&mut backoff, &mut connected).await;

            if self.is_shutdown() {
                info!(channel = %self.kind, "Shutdown requested after disconnect, not reconnecting");
                self.set_status(ChannelStatus::Stopped);
                return Ok(());
            }

            match result {
                Ok(()) => info!(channel = %self.kind, "Connection closed"),
                Err(e) => warn!(channel = %self.kind, error = %e, "Connection error"),
            }

            self.set_status(ChannelStatus::Disconnected);
            if connected {
                Metrics::ws_disconnected(self.kind.as_str());
                self.emit(SessionEvent::ChannelDisconnected(self.kind)).await;
            }

            let Some(delay) = backoff.next_delay() else {
                error!(
                    channel = %self.kind,
                    attempts = backoff.attempt(),
                    "Max reconnection attempts reached, giving up"
                );
                self.set_status(ChannelStatus::Failed);
                Metrics::ws_permanent_failure(self.kind.as_str());
                if !connected {
                    self.emit(SessionEvent::ChannelDisconnected(self.kind)).await;
                }
                self.emit(SessionEvent::PermanentFailure(self.kind)).await;
                return Err(WsError::ConnectionFailed(format!(
                    "{}: max reconnection attempts reached",
                    self.kind
                )));
            };

            Metrics::ws_reconnect(self.kind.as_str());
            warn!(
                channel = %self.kind,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!(channel = %self.kind, "Shutdown requested during backoff, exiting");
                    self.set_status(ChannelStatus::Stopped);
                    return Ok(());
                }
            }
        }
    }

    fn build_request(&self) -> WsResult<Request> {
        let mut request = self.config.url.as_str().into_client_request()?;
        for (name, value) in &self.config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WsError::ConnectionFailed(format!("invalid header {name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| WsError::ConnectionFailed(format!("invalid value for {name}: {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }
        Ok(request)
    }

    async fn try_connect(
        &self,
        backoff: &mut ReconnectBackoff,
        connected: &mut bool,
    ) -> WsResult<()> {
        info!(channel = %self.kind, "Connecting");

        let request = self.build_request()?;
        let (ws_stream, _response) =
            connect_async_tls_with_config(request, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        *connected = true;
        backoff.reset();
        self.heartbeat.reset();

        // Held for the whole connection; only this loop drains the queue.
        let mut outbound_rx = self.outbound_rx.lock().await;

        self.set_status(ChannelStatus::Connected);
        Metrics::ws_connected(self.kind.as_str());
        info!(channel = %self.kind, "Connected");

        // Anything queued before this connection is covered by the replay.
        let mut stale = 0usize;
        while outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(channel = %self.kind, stale, "Discarded stale outbound frames");
        }

        if self.kind == ChannelKind::MarketData {
            self.restore_subscriptions(&mut write, &mut read).await?;
        }

        self.emit(SessionEvent::ChannelConnected(self.kind)).await;

        let mut ticker = self.heartbeat.ticker();

        loop {
            tokio::select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!(channel = %self.kind, "Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(channel = %self.kind, ?e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                msg = read.next() => {
                    self.handle_frame(msg, &mut write).await?;
                }

                Some(text) = outbound_rx.recv() => {
                    write.send(Message::Text(text)).await?;
                }

                _ = ticker.tick() => {
                    self.send_ping(&mut write).await;
                }
            }
        }
    }

    async fn send_ping(&self, write: &mut WsSink) {
        match write.send(Message::Text(PING_FRAME.to_string())).await {
            Ok(()) => {
                self.heartbeat.record_ping();
                debug!(channel = %self.kind, "Sent heartbeat ping");
            }
            Err(e) => {
                warn!(channel = %self.kind, ?e, "Heartbeat send failed");
            }
        }
    }

    async fn handle_frame(
        &self,
        msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        write: &mut WsSink,
    ) -> WsResult<()> {
        match msg {
            Some(Ok(Message::Binary(data))) => {
                self.handle_binary(&data);
            }
            Some(Ok(Message::Text(text))) => {
                self.handle_text(&text).await;
            }
            Some(Ok(Message::Ping(data))) => {
                write.send(Message::Pong(data)).await?;
            }
            Some(Ok(Message::Pong(_))) => {
                let _ = self.heartbeat.record_pong();
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (f.code.into(), f.reason.to_string()))
                    .unwrap_or((1000, "Normal close".to_string()));
                warn!(channel = %self.kind, code, %reason, "Closed by server");
                return Err(WsError::ConnectionClosed { code, reason });
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                error!(channel = %self.kind, ?e, "Read error");
                return Err(e.into());
            }
            None => {
                return Err(WsError::ConnectionClosed {
                    code: 1006,
                    reason: "Stream ended".to_string(),
                });
            }
        }
        Ok(())
    }

    fn handle_binary(&self, data: &[u8]) {
        if self.kind != ChannelKind::MarketData {
            debug!(channel = %self.kind, len = data.len(), "Ignoring binary frame");
            return;
        }

        match decode_tick(data) {
            Ok(tick) => {
                Metrics::tick_decoded(&tick.mode.to_string());
                match self.event_tx.try_send(SessionEvent::Tick(tick)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        Metrics::event_dropped("tick");
                        warn!("Event queue full, dropping tick");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Event receiver dropped");
                    }
                }
            }
            Err(e) => {
                Metrics::frame_malformed();
                warn!(error = %e, len = data.len(), "Dropping malformed market-data frame");
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        if is_pong(text) {
            let _ = self.heartbeat.record_pong();
            return;
        }

        match self.kind {
            ChannelKind::MarketData => {
                debug!(%text, "Text frame on market-data channel");
            }
            ChannelKind::OrderStatus => match parse_order_update(text) {
                Ok(update) if update.is_connect_ack() => {
                    debug!("Order-status channel acknowledged");
                }
                Ok(update) => {
                    Metrics::order_update(update.code.as_str());
                    self.emit(SessionEvent::OrderUpdate(update)).await;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping unparsable order update");
                }
            },
        }
    }

    /// Queue `event` for the consumer, waiting at most [`EMIT_GRACE`] on a
    /// full queue so socket reads and heartbeats keep flowing.
    async fn emit(&self, event: SessionEvent) {
        let label = event_label(&event);
        let event = match self.event_tx.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(channel = %self.kind, "Event receiver dropped");
                return;
            }
            Err(mpsc::error::TrySendError::Full(event)) => event,
        };
        match self.event_tx.send_timeout(event, EMIT_GRACE).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Metrics::event_dropped(label);
                warn!(channel = %self.kind, event = label, "Event queue full, dropping event");
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(channel = %self.kind, "Event receiver dropped");
            }
        }
    }

    /// Resend the full tracked set, one frame per mode listing every
    /// exchange type's tokens, each with a fresh correlation id.
    async fn restore_subscriptions(&self, write: &mut WsSink, read: &mut WsSource) -> WsResult<()> {
        let replay = self.subscriptions.replay_set();
        if replay.is_empty() {
            return Ok(());
        }

        info!(
            groups = replay.len(),
            instruments = self.subscriptions.len(),
            "Restoring subscriptions"
        );

        for subscription in &replay {
            let frame = control_frame(SubscriptionAction::Subscribe, subscription)?;
            write.send(Message::Text(frame)).await?;
            self.drain_and_wait(write, read, self.config.subscription_pacing_ms)
                .await?;
        }

        info!(groups = replay.len(), "Subscriptions restored");
        Ok(())
    }

    /// Keep reading for `wait_ms` so frames arriving during replay are
    /// dispatched rather than left to pile up.
    async fn drain_and_wait(
        &self,
        write: &mut WsSink,
        read: &mut WsSource,
        wait_ms: u64,
    ) -> WsResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);

        loop {
            tokio::select! {
                msg = read.next() => {
                    self.handle_frame(msg, write).await?;
                }
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        Ok(())
    }
}
