//! Integration tests for optmon-bot.
//!
//! These tests drive the orchestrator end to end:
//! - Subscription upkeep against a mock streaming server
//! - Tick-driven and poll-driven exits through a mock broker
//! - Reconciliation and operator controls

pub mod common;
