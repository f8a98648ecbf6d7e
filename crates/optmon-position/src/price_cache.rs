//! Short-lived price cache.
//!
//! Keys are `"<EXCHANGE>:<symbol or token>"`. Underlyings are keyed by
//! instrument token so streaming ticks refresh them directly; options are
//! keyed by trading symbol.

use dashmap::DashMap;
use optmon_broker::BrokerSession;
use optmon_core::{Exchange, Price};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default entry lifetime.
pub const DEFAULT_PRICE_TTL: Duration = Duration::from_secs(5);

/// Cache key for an instrument.
#[must_use]
pub fn price_key(exchange: Exchange, id: &str) -> String {
    format!("{exchange}:{id}")
}

/// TTL price cache shared by the tick path and the polling path.
#[derive(Debug)]
pub struct PriceCache {
    entries: DashMap<String, (Price, Instant)>,
    ttl: Duration,
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new(DEFAULT_PRICE_TTL)
    }
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, key: impl Into<String>, price: Price) {
        self.entries.insert(key.into(), (price, Instant::now()));
    }

    /// Fresh price for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Price> {
        let entry = self.entries.get(key)?;
        let (price, at) = *entry.value();
        if at.elapsed() <= self.ttl {
            Some(price)
        } else {
            None
        }
    }

    /// Cached price, or fetch it from the broker and cache it.
    ///
    /// Broker failures are logged and yield `None`.
    pub async fn get_or_fetch(
        &self,
        broker: &dyn BrokerSession,
        exchange: Exchange,
        symbol: &str,
        token: &str,
        key: &str,
    ) -> Option<Price> {
        if let Some(price) = self.get(key) {
            return Some(price);
        }
        match broker.ltp_data(exchange.as_str(), symbol, token).await {
            Ok(ltp) => {
                let price = Price::new(ltp);
                debug!(%key, %price, "Fetched price");
                self.insert(key, price);
                Some(price)
            }
            Err(e) => {
                warn!(%key, %symbol, ?e, "Failed to fetch price");
                None
            }
        }
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, at)| at.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
