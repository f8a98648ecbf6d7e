//! Position lifecycle for the option monitor.
//!
//! Tracks open option positions against underlying thresholds, closes them
//! through the broker, and reconciles the tracked set with what the broker
//! actually holds.
//!
//! # Key Components
//!
//! - [`PositionStore`]: durable keyed store with the `EXITING` exit lock
//! - [`PositionMonitor`]: evaluate / apply_exit / verify / order-update handling
//! - [`Reconciler`]: removes positions the broker no longer holds
//! - [`PriceCache`]: TTL cache shared by ticks and polling

pub mod error;
pub mod monitor;
pub mod price_cache;
pub mod reconciler;
pub mod store;

pub use error::{PositionError, PositionResult};
pub use monitor::{
    build_exit_order, evaluate_at, Decision, ExitOutcome, MonitorConfig, OrderVerification,
    PositionMonitor, OPTION_TICK_SIZE,
};
pub use price_cache::{price_key, PriceCache, DEFAULT_PRICE_TTL};
pub use reconciler::{
    fetch_all_broker_positions, fetch_broker_positions, BrokerPositionMap, NetPositions,
    Reconciler,
};
pub use store::PositionStore;
