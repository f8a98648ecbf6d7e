//! Core domain types for the option position monitor.
//!
//! This crate provides fundamental types used throughout the system:
//! - `Price`: Precision-safe decimal price
//! - `Exchange`, `OptionType`, `PositionStatus`, `ExitReason`: venue enums
//! - `Tick`: decoded market-data update
//! - `Position`, `CompletedTradeRecord`: tracked positions and their exit records
//! - `MarketHours`: session window and expiry helpers

pub mod decimal;
pub mod error;
pub mod position;
pub mod serde_util;
pub mod tick;
pub mod trading_session;
pub mod types;

pub use decimal::Price;
pub use error::{CoreError, Result};
pub use position::{position_key, CompletedTradeRecord, Position, TIMESTAMP_FORMAT};
pub use tick::{DepthLevel, QuoteData, SnapQuoteData, Tick, TickMode};
pub use trading_session::{
    is_expiry_closing_at, parse_expiry, MarketHours, MarketStatus, DEFAULT_EXPIRY_EXIT_HOUR,
};
pub use types::{Exchange, ExitReason, OptionType, PositionStatus};
