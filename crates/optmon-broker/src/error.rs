//! Broker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Broker rejected request: {message} (code {code})")]
    Api { code: String, message: String },

    #[error("Invalid broker response: {0}")]
    InvalidResponse(String),

    #[error("No quote for {0}")]
    NoQuote(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
