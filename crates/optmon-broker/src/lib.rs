//! Broker session contract and adapters.
//!
//! - `BrokerSession`: the capability contract every broker client implements
//! - `SmartApiSession`: REST adapter for the SmartAPI venue
//! - `MockBrokerSession`: in-memory session for tests
//! - `BrokerRegistry`: live sessions keyed by account
//! - `TokenResolver`: symbol to instrument-token lookup

pub mod error;
pub mod mock;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod smart_api;
pub mod types;

pub use error::{BrokerError, BrokerResult};
pub use mock::MockBrokerSession;
pub use registry::BrokerRegistry;
pub use resolver::{StaticTokenResolver, TokenResolver};
pub use session::{BoxFuture, BrokerSession};
pub use smart_api::{SmartApiConfig, SmartApiSession, DEFAULT_BASE_URL};
pub use types::{
    BrokerPosition, OrderParams, OrderRecord, TradeRecord, TRANSACTION_BUY, TRANSACTION_SELL,
};
