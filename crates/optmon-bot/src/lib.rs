//! Option position monitor.
//!
//! Wires the streaming session, broker sessions and the position store into
//! one control loop:
//! - tick-driven evaluation of positions per underlying
//! - timer fallback with reconciliation and polling during market hours
//! - subscription upkeep as positions come and go
//! - operator controls (track, manual exit, snapshot)

pub mod app;
pub mod config;
pub mod error;

pub use app::{MonitorSnapshot, Orchestrator};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
