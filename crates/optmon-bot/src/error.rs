//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] optmon_ws::WsError),

    #[error("Broker error: {0}")]
    Broker(#[from] optmon_broker::BrokerError),

    #[error("Position error: {0}")]
    Position(#[from] optmon_position::PositionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] optmon_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] optmon_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Orchestrator is already running")]
    AlreadyRunning,
}

pub type AppResult<T> = Result<T, AppError>;
