//! Subscription management for the market-data channel.
//!
//! Tracks which (mode, exchange type, token) triples the channel is asked to
//! stream so the full set can be replayed after a reconnect, and builds the
//! JSON control frames the venue expects.

use chrono::Utc;
use optmon_core::{Exchange, TickMode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Control frame action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SubscriptionAction {
    Unsubscribe = 0,
    Subscribe = 1,
}

impl From<SubscriptionAction> for u8 {
    fn from(action: SubscriptionAction) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for SubscriptionAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unsubscribe),
            1 => Ok(Self::Subscribe),
            other => Err(format!("unknown action {other}")),
        }
    }
}

/// Tokens on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGroup {
    #[serde(rename = "exchangeType")]
    pub exchange_type: u8,
    pub tokens: Vec<String>,
}

/// A set of instruments requested in one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub mode: TickMode,
    pub token_list: Vec<TokenGroup>,
}

impl Subscription {
    /// LTP subscription for tokens on one exchange.
    #[must_use]
    pub fn ltp(exchange: Exchange, tokens: Vec<String>) -> Self {
        Self {
            mode: TickMode::Ltp,
            token_list: vec![TokenGroup {
                exchange_type: exchange.type_id(),
                tokens,
            }],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token_list.iter().all(|g| g.tokens.is_empty())
    }

    fn keys(&self) -> impl Iterator<Item = SubscriptionKey> + '_ {
        self.token_list.iter().flat_map(move |group| {
            group.tokens.iter().map(move |token| SubscriptionKey {
                mode: self.mode,
                exchange_type: group.exchange_type,
                token: token.clone(),
            })
        })
    }
}

/// One tracked instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub mode: TickMode,
    pub exchange_type: u8,
    pub token: String,
}

#[derive(Debug, Serialize)]
struct ControlParams<'a> {
    mode: TickMode,
    #[serde(rename = "tokenList")]
    token_list: &'a [TokenGroup],
}

#[derive(Debug, Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "correlationID")]
    correlation_id: String,
    action: SubscriptionAction,
    params: ControlParams<'a>,
}

static CORRELATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh correlation id for a control frame.
#[must_use]
pub fn next_correlation_id() -> String {
    let seq = CORRELATION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req_{}_{}", Utc::now().timestamp_millis(), seq)
}

/// Serialize a control frame with a newly generated correlation id.
pub fn control_frame(
    action: SubscriptionAction,
    subscription: &Subscription,
) -> serde_json::Result<String> {
    serde_json::to_string(&ControlFrame {
        correlation_id: next_correlation_id(),
        action,
        params: ControlParams {
            mode: subscription.mode,
            token_list: &subscription.token_list,
        },
    })
}

/// Subscription manager.
///
/// Thread-safe; all mutation goes through `add`/`remove`/`clear`.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscriptions: Arc<RwLock<BTreeSet<SubscriptionKey>>>,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track every instrument in `subscription`.
    pub fn add(&self, subscription: &Subscription) {
        let mut subs = self.subscriptions.write();
        for key in subscription.keys() {
            debug!(token = %key.token, exchange_type = key.exchange_type, "Tracking subscription");
            subs.insert(key);
        }
    }

    /// Stop tracking every instrument in `subscription`.
    pub fn remove(&self, subscription: &Subscription) {
        let mut subs = self.subscriptions.write();
        for key in subscription.keys() {
            subs.remove(&key);
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.subscriptions.write().clear();
    }

    /// Whether a token is tracked in any mode.
    pub fn is_tracked(&self, exchange_type: u8, token: &str) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|k| k.exchange_type == exchange_type && k.token == token)
    }

    /// Get all tracked instruments.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// The tracked set regrouped into one subscription per mode,
    /// each listing its tokens per exchange type.
    pub fn replay_set(&self) -> Vec<Subscription> {
        let subs = self.subscriptions.read();
        let mut by_mode: BTreeMap<TickMode, BTreeMap<u8, Vec<String>>> = BTreeMap::new();
        for key in subs.iter() {
            by_mode
                .entry(key.mode)
                .or_default()
                .entry(key.exchange_type)
                .or_default()
                .push(key.token.clone());
        }
        by_mode
            .into_iter()
            .map(|(mode, groups)| Subscription {
                mode,
                token_list: groups
                    .into_iter()
                    .map(|(exchange_type, tokens)| TokenGroup {
                        exchange_type,
                        tokens,
                    })
                    .collect(),
            })
            .collect()
    }
}
