//! Run log persistence.
//!
//! Finalized runs are handed to a [`RunStore`]. The JSON store writes one file
//! per run under a per-day directory:
//!
//! ```text
//! <output_dir>/2026-10-18/run_142501_B2406.json
//! ```

use crate::production::record::RunRecord;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// A record accepted by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRun {
    /// Store-assigned id
    pub id: Uuid,
    /// Location of the stored record, when file-backed
    pub path: Option<PathBuf>,
    /// The record itself
    pub record: RunRecord,
}

/// Make `name` safe as a single path component.
///
/// Anything other than ASCII alphanumerics and `-` becomes `_`, so separators
/// and `..` cannot leave the target directory.
pub(crate) fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Persistence collaborator for finalized runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist `record`. Failures are surfaced to the operator, never retried here.
    async fn save(&self, record: RunRecord) -> Result<StoredRun>;
}

/// Stores each run as a pretty-printed JSON file.
pub struct JsonRunStore {
    output_dir: PathBuf,
}

impl JsonRunStore {
    /// Create a store rooted at `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Path a record is written to.
    pub fn path_for(&self, record: &RunRecord) -> PathBuf {
        let batch = file_stem(&record.batch);
        self.output_dir
            .join(record.date.format("%Y-%m-%d").to_string())
            .join(format!(
                "run_{}_{}.json",
                record.start_time.format("%H%M%S"),
                batch
            ))
    }

    /// Load a previously stored record.
    pub fn load(path: impl AsRef<Path>) -> Result<StoredRun> {
        let json = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read run record from {:?}", path.as_ref()))?;
        serde_json::from_str(&json).context("Failed to deserialize run record")
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn save(&self, record: RunRecord) -> Result<StoredRun> {
        let path = self.path_for(&record);
        let stored = StoredRun {
            id: Uuid::new_v4(),
            path: Some(path.clone()),
            record,
        };

        let json = serde_json::to_string_pretty(&stored).context("Failed to serialize run record")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create run log directory")?;
        }
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write run record to {:?}", path))?;

        info!(id = %stored.id, path = ?path, "Run record saved");
        Ok(stored)
    }
}

/// In-memory store for tests and simulation.
#[derive(Default)]
pub struct MemoryRunStore {
    saved: Mutex<Vec<StoredRun>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryRunStore {
    /// Store that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects the first `n` saves.
    pub fn failing(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Records accepted so far.
    pub fn saved(&self) -> Vec<StoredRun> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of save calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, record: RunRecord) -> Result<StoredRun> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("run store unavailable"));
        }

        let stored = StoredRun {
            id: Uuid::new_v4(),
            path: None,
            record,
        };
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::order::{Operator, ProductionOrder};
    use crate::production::state::{ProductionRun, StopReason};
    use chrono::Local;

    fn record() -> RunRecord {
        let order = ProductionOrder {
            material: "MAT-7".into(),
            batch: "B/24".into(),
            description: "Gauze".into(),
            ..Default::default()
        };
        let mut run = ProductionRun::new(2, "B/24", Local::now());
        run.record_print("B/24-1".into());
        run.record_print("B/24-2".into());
        RunRecord::from_run(
            &run,
            &order,
            &Operator::new("1", "op"),
            StopReason::Completed,
            Local::now(),
        )
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::new(dir.path());

        let stored = store.save(record()).await.unwrap();
        let path = stored.path.clone().unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_B_24.json"));

        let loaded = JsonRunStore::load(&path).unwrap();
        assert_eq!(loaded, stored);
    }

    #[tokio::test]
    async fn test_memory_store_failures() {
        let store = MemoryRunStore::failing(1);
        assert!(store.save(record()).await.is_err());
        assert!(store.save(record()).await.is_ok());
        assert_eq!(store.attempts(), 2);
        assert_eq!(store.saved().len(), 1);
    }
}
