//! Position error types.

use optmon_broker::BrokerError;
use optmon_persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position not found: {0}")]
    NotFound(String),

    #[error("Invalid position state: {0}")]
    InvalidState(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub type PositionResult<T> = Result<T, PositionError>;
