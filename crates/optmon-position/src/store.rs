//! Durable store of open positions.
//!
//! All mutation goes through the store's methods, each taking the write
//! lock once. Callers that need a change to survive a crash call `save()`
//! afterwards; the helpers that combine a mutation with its save say so.
//!
//! # Exit lock
//!
//! `try_mark_exiting` is the single gate for issuing an exit order: it
//! checks and flips the status to `EXITING` under one write lock, so of two
//! concurrent callers exactly one wins.

use chrono::NaiveDateTime;
use optmon_core::{CompletedTradeRecord, Position, PositionStatus, Price};
use optmon_persistence::{CompletedTradeLog, SnapshotFile};
use optmon_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::error::PositionResult;

/// Position store backed by a snapshot file and a completed-trade log.
pub struct PositionStore {
    positions: RwLock<BTreeMap<String, Position>>,
    snapshot: SnapshotFile,
    completed: Mutex<CompletedTradeLog>,
    /// Serializes snapshot writes; they share one temp file.
    save_lock: Mutex<()>,
    /// Snapshot mtime after our last load or save.
    last_seen_mtime: Mutex<Option<SystemTime>>,
}

impl PositionStore {
    /// Create an empty store. Call `load()` to read the snapshot.
    pub fn new(snapshot: SnapshotFile, completed: CompletedTradeLog) -> Self {
        Self {
            positions: RwLock::new(BTreeMap::new()),
            snapshot,
            completed: Mutex::new(completed),
            save_lock: Mutex::new(()),
            last_seen_mtime: Mutex::new(None),
        }
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Replace in-memory state with the snapshot on disk.
    ///
    /// Missing or corrupt files load as empty. Returns the number of positions.
    pub fn load(&self) -> usize {
        let loaded: BTreeMap<String, Position> = self.snapshot.load();
        let count = loaded.len();
        *self.positions.write() = loaded;
        *self.last_seen_mtime.lock() = self.snapshot.modified();
        Metrics::active_positions(count);
        count
    }

    /// Atomically rewrite the snapshot with the current state.
    pub fn save(&self) -> PositionResult<()> {
        let _guard = self.save_lock.lock();
        let positions = self.positions.read().clone();
        self.snapshot.save(&positions)?;
        *self.last_seen_mtime.lock() = self.snapshot.modified();
        Metrics::active_positions(positions.len());
        Ok(())
    }

    /// Reload if the snapshot changed on disk since our last load or save.
    ///
    /// Positions with an exit in flight keep their in-memory record.
    /// Returns true if a reload happened.
    pub fn reload_if_modified(&self) -> bool {
        let on_disk = self.snapshot.modified();
        if on_disk.is_none() || on_disk == *self.last_seen_mtime.lock() {
            return false;
        }

        let mut loaded: BTreeMap<String, Position> = self.snapshot.load();
        {
            let mut positions = self.positions.write();
            for (key, position) in positions.iter() {
                if position.status == PositionStatus::Exiting {
                    loaded.insert(key.clone(), position.clone());
                }
            }
            info!(
                before = positions.len(),
                after = loaded.len(),
                "Snapshot modified externally, reloaded"
            );
            *positions = loaded;
            Metrics::active_positions(positions.len());
        }
        *self.last_seen_mtime.lock() = on_disk;
        true
    }

    /// Append a completed-trade record to the log.
    pub fn record_completed(&self, record: &CompletedTradeRecord) -> PositionResult<()> {
        self.completed.lock().append(record)?;
        Ok(())
    }

    /// Append `record`, remove `key` and save.
    pub fn complete(&self, key: &str, record: &CompletedTradeRecord) -> PositionResult<()> {
        self.record_completed(record)?;
        self.remove(key);
        self.save()
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// Insert or replace the position under `key`.
    pub fn upsert(&self, key: impl Into<String>, position: Position) {
        let key = key.into();
        debug!(%key, status = %position.status, "Upsert position");
        self.positions.write().insert(key, position);
    }

    pub fn remove(&self, key: &str) -> Option<Position> {
        let removed = self.positions.write().remove(key);
        if removed.is_some() {
            debug!(%key, "Removed position");
        }
        removed
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Position> {
        self.positions.read().get(key).cloned()
    }

    /// Snapshot of every `(key, position)`.
    #[must_use]
    pub fn all(&self) -> Vec<(String, Position)> {
        self.positions
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    #[must_use]
    pub fn find_by_trade_id(&self, trade_id: &str) -> Option<(String, Position)> {
        self.positions
            .read()
            .iter()
            .find(|(_, p)| p.trade_id == trade_id)
            .map(|(k, p)| (k.clone(), p.clone()))
    }

    #[must_use]
    pub fn find_by_order_id(&self, order_id: &str) -> Option<(String, Position)> {
        self.positions
            .read()
            .iter()
            .find(|(_, p)| p.order_id == order_id)
            .map(|(k, p)| (k.clone(), p.clone()))
    }

    // ========================================================================
    // Atomic transitions
    // ========================================================================

    /// Apply `f` to the position under `key`. Returns the updated record.
    pub fn update<F>(&self, key: &str, f: F) -> Option<Position>
    where
        F: FnOnce(&mut Position),
    {
        let mut positions = self.positions.write();
        let position = positions.get_mut(key)?;
        f(position);
        Some(position.clone())
    }

    /// Flip an evaluable position to `EXITING`.
    ///
    /// Returns the position as it was before the flip, or `None` if it is
    /// missing or not in an evaluable status (already exiting included).
    #[must_use]
    pub fn try_mark_exiting(&self, key: &str) -> Option<Position> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(key)?;
        if !position.status.is_evaluable() {
            debug!(%key, status = %position.status, "Exit lock not acquired");
            return None;
        }
        let before = position.clone();
        position.status = PositionStatus::Exiting;
        Some(before)
    }

    /// Set `status` unless the position is missing. Returns true if changed.
    pub fn set_status(&self, key: &str, status: PositionStatus, reason: Option<String>) -> bool {
        let mut positions = self.positions.write();
        match positions.get_mut(key) {
            Some(position) if position.status != status || reason.is_some() => {
                position.status = status;
                if reason.is_some() {
                    position.status_reason = reason;
                }
                true
            }
            Some(_) => false,
            None => {
                warn!(%key, %status, "Status change for unknown position");
                false
            }
        }
    }

    /// Stamp reporting prices on a position without persisting.
    ///
    /// A non-positive underlying price leaves the previous one in place.
    pub fn touch_prices(
        &self,
        key: &str,
        underlying: Price,
        option: Option<Price>,
        now: NaiveDateTime,
    ) -> Option<Position> {
        self.update(key, |p| {
            if underlying.is_positive() {
                p.current_underlying_price = Some(underlying);
            }
            if let Some(option) = option {
                p.current_option_price = Some(option);
                let (pnl, pct) = p.pnl_at(option);
                p.pnl = Some(pnl);
                p.pnl_percent = Some(pct);
            }
            p.last_updated = Some(now);
        })
    }
}
