//! Mock WebSocket server for integration tests.
//!
//! Provides a simple WebSocket server that can:
//! - Accept connections
//! - Record received text frames
//! - Push binary ticks and text frames to every open connection
//! - Drop every open connection to force a reconnect

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum Push {
    Frame(Message),
    Drop,
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    push_tx: broadcast::Sender<Push>,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a new mock WebSocket server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (push_tx, _) = broadcast::channel::<Push>(64);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let push_clone = push_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        let messages = messages_clone.clone();
                        let connections = connections_clone.clone();
                        let push_rx = push_clone.subscribe();
                        tokio::spawn(handle_connection(stream, messages, connections, push_rx));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            push_tx,
            messages,
            connections,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Get the number of completed handshakes.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Get all received text frames.
    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.iter().cloned().collect()
    }

    /// Received control frames (those carrying a correlation id).
    pub async fn control_frames(&self) -> Vec<serde_json::Value> {
        self.received_messages()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str::<serde_json::Value>(m).ok())
            .filter(|v| v.get("correlationID").is_some())
            .collect()
    }

    pub fn push_binary(&self, data: Vec<u8>) {
        let _ = self.push_tx.send(Push::Frame(Message::Binary(data)));
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.push_tx.send(Push::Frame(Message::Text(text.to_string())));
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.push_tx.send(Push::Drop);
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        self.drop_connections();
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    mut push_rx: broadcast::Receiver<Push>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    {
        let mut count = connections.lock().await;
        *count += 1;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" {
                            let _ = write.send(Message::Text("pong".to_string())).await;
                        }
                        messages.lock().await.push_back(text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            push = push_rx.recv() => {
                match push {
                    Ok(Push::Frame(frame)) => {
                        if write.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Push::Drop) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}

/// Build an LTP frame for `token` on NSE with price × 100 = `raw_price`.
pub fn ltp_frame(token: &str, raw_price: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 51];
    buf[0] = 1;
    buf[1] = 1;
    buf[2..2 + token.len()].copy_from_slice(token.as_bytes());
    buf[27..35].copy_from_slice(&42u64.to_le_bytes());
    buf[35..43].copy_from_slice(&1_711_526_400_000u64.to_le_bytes());
    buf[43..51].copy_from_slice(&raw_price.to_le_bytes());
    buf
}
