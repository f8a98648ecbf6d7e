//! Write handle for sending frames on a streaming channel.
//!
//! Frames go through an mpsc queue drained by the channel's message loop, so
//! the handle stays valid across reconnects.

use crate::connection::ChannelStatus;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Error type for send operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Channel is not in `Connected` state.
    NotConnected,
    /// Message loop is gone (session stopped).
    ChannelClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Cloneable handle for queueing text frames.
#[derive(Clone)]
pub struct WsWriteHandle {
    tx: mpsc::Sender<String>,
    status: Arc<RwLock<ChannelStatus>>,
}

impl WsWriteHandle {
    pub fn new(tx: mpsc::Sender<String>, status: Arc<RwLock<ChannelStatus>>) -> Self {
        Self { tx, status }
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// - `SendError::NotConnected`: channel is not connected
    /// - `SendError::ChannelClosed`: message loop has exited
    pub async fn send_text(&self, text: String) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        self.tx
            .send(text)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    pub fn is_connected(&self) -> bool {
        *self.status.read() == ChannelStatus::Connected && !self.tx.is_closed()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.read()
    }
}
