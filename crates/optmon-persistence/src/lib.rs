//! Durable state for the position monitor.
//!
//! - `SnapshotFile`: full-rewrite JSON snapshot of open positions
//! - `CompletedTradeLog`: append-only JSON Lines log of terminated trades

pub mod error;
pub mod snapshot;
pub mod writer;

pub use error::{PersistenceError, PersistenceResult};
pub use snapshot::SnapshotFile;
pub use writer::CompletedTradeLog;
