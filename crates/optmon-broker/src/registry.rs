//! Broker sessions by account.

use crate::session::BrokerSession;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Live broker sessions keyed by client id.
///
/// Sessions may be added or dropped at runtime; callers take an `Arc` and
/// never hold the lock across an await.
#[derive(Default)]
pub struct BrokerRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn BrokerSession>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client_id: impl Into<String>, session: Arc<dyn BrokerSession>) {
        let client_id = client_id.into();
        info!(%client_id, "Broker session registered");
        self.sessions.write().insert(client_id, session);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<dyn BrokerSession>> {
        let removed = self.sessions.write().remove(client_id);
        if removed.is_some() {
            info!(%client_id, "Broker session removed");
        }
        removed
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<dyn BrokerSession>> {
        self.sessions.read().get(client_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.read().contains_key(client_id)
    }

    /// Registered client ids, sorted.
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
