//! Streaming client for the venue's market-data and order-status channels.
//!
//! Provides:
//! - Binary tick decoding (LTP / QUOTE / SNAPQUOTE)
//! - Automatic reconnection with exponential backoff, per channel
//! - Subscription tracking and replay after reconnect
//! - Text heartbeats on both channels
//! - Channel-based event delivery (ticks, order updates, channel state)

pub mod connection;
pub mod decoder;
pub mod error;
pub mod heartbeat;
pub mod order_update;
pub mod session;
pub mod subscription;
pub mod ws_write_handle;

pub use connection::{
    ChannelConnection, ChannelKind, ChannelStatus, ConnectionConfig, ReconnectBackoff,
};
pub use decoder::{decode_tick, LTP_FRAME_LEN, QUOTE_FRAME_LEN, SNAP_QUOTE_FRAME_LEN};
pub use error::{WsError, WsResult};
pub use order_update::{parse_order_update, OrderData, OrderStatusCode, OrderUpdate};
pub use session::{
    Credentials, SessionConfig, SessionEvent, StreamingSession, DEFAULT_MARKET_DATA_URL,
    DEFAULT_ORDER_STATUS_URL,
};
pub use subscription::{
    Subscription, SubscriptionAction, SubscriptionKey, SubscriptionManager, TokenGroup,
};
pub use ws_write_handle::{SendError, WsWriteHandle};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
