//! Prometheus metrics and structured logging for the option position monitor.
//!
//! - Prometheus collectors for stream health, tick decoding, exits and reconciliation
//! - Structured logging with tracing (JSON in production, pretty otherwise)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
