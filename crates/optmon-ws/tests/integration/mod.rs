//! Integration tests for optmon-ws.
//!
//! These tests run the streaming session against a local mock server:
//! - Connection lifecycle and reconnect
//! - Subscription replay
//! - Tick and order-update delivery

pub mod common;
