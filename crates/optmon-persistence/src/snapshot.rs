//! Full-rewrite JSON snapshot of open positions.
//!
//! The file holds one JSON object mapping position key to record. Writes go
//! to `<file>.tmp` first and are renamed over the target, so a crash
//! mid-write leaves the previous snapshot intact.

use crate::error::PersistenceResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Snapshot file handle.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load every record.
    ///
    /// A missing file is an empty snapshot. An unreadable or corrupt file is
    /// logged and also treated as empty.
    pub fn load<T: DeserializeOwned>(&self) -> BTreeMap<String, T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot file, starting empty");
                return BTreeMap::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), ?e, "Failed to read snapshot, starting empty");
                return BTreeMap::new();
            }
        };

        if raw.trim().is_empty() {
            return BTreeMap::new();
        }

        match serde_json::from_str::<BTreeMap<String, T>>(&raw) {
            Ok(records) => {
                info!(path = %self.path.display(), count = records.len(), "Loaded snapshot");
                records
            }
            Err(e) => {
                warn!(path = %self.path.display(), ?e, "Corrupt snapshot, starting empty");
                BTreeMap::new()
            }
        }
    }

    /// Atomically replace the snapshot with `records`.
    pub fn save<T: Serialize>(&self, records: &BTreeMap<String, T>) -> PersistenceResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), count = records.len(), "Saved snapshot");
        Ok(())
    }

    /// Last modification time, or `None` if the file does not exist.
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        symbol: String,
        quantity: u32,
    }

    fn row(symbol: &str, quantity: u32) -> Row {
        Row {
            symbol: symbol.to_string(),
            quantity,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("trades.json"));

        let rows: BTreeMap<String, Row> = snapshot.load();
        assert!(rows.is_empty());
        assert!(snapshot.modified().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("trades.json"));

        let mut rows = BTreeMap::new();
        rows.insert("C1_A".to_string(), row("A", 50));
        rows.insert("C1_B".to_string(), row("B", 25));
        snapshot.save(&rows).unwrap();

        let loaded: BTreeMap<String, Row> = snapshot.load();
        assert_eq!(loaded, rows);
        assert!(snapshot.modified().is_some());
        assert!(!snapshot.tmp_path().exists());
    }

    #[test]
    fn test_save_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("trades.json"));

        let mut rows = BTreeMap::new();
        rows.insert("C1_A".to_string(), row("A", 50));
        snapshot.save(&rows).unwrap();
        rows.clear();
        snapshot.save(&rows).unwrap();

        let loaded: BTreeMap<String, Row> = snapshot.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trades.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded: BTreeMap<String, Row> = SnapshotFile::new(&path).load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("state").join("trades.json"));

        snapshot.save(&BTreeMap::<String, Row>::new()).unwrap();
        assert!(snapshot.path().exists());
    }
}
