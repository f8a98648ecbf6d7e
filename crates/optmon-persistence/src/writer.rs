//! JSON Lines log of completed trades.
//!
//! One `CompletedTradeRecord` per line, appended and flushed per record:
//! - Existing content is never truncated or rewritten
//! - An interrupted write only affects the last line
//! - Readers skip lines they cannot parse

use crate::error::PersistenceResult;
use optmon_core::CompletedTradeRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Append-only completed-trade log.
pub struct CompletedTradeLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records_written: usize,
}

impl CompletedTradeLog {
    /// Create a log writing to `path`. The file is opened on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            records_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this handle.
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    fn open(&mut self) -> PersistenceResult<&mut BufWriter<File>> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                info!(path = %self.path.display(), "Opening completed-trade log (append mode)");
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                BufWriter::new(file)
            }
        };
        Ok(self.writer.insert(writer))
    }

    /// Append one record and flush it to disk.
    pub fn append(&mut self, record: &CompletedTradeRecord) -> PersistenceResult<()> {
        let json = serde_json::to_string(record)?;
        let writer = self.open()?;
        writeln!(writer, "{json}")?;
        writer.flush()?;
        self.records_written += 1;

        debug!(
            trade_id = %record.trade_id,
            reason = %record.exit_reason,
            "Appended completed trade"
        );
        Ok(())
    }

    /// Read every parsable record in the log.
    pub fn read_all(&self) -> PersistenceResult<Vec<CompletedTradeRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = idx + 1, ?e, "Skipping unparsable completed-trade line"),
            }
        }
        Ok(records)
    }
}

impl Drop for CompletedTradeLog {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!(?e, "Failed to flush completed-trade log on drop");
            }
        }
    }
}
