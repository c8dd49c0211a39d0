//! Durable record of terminal task states.
//!
//! A checkpoint is keyed by task id, or by a sub-key such as
//! `<task_id>/<case_id>/r<round>/<agent_id>` for debate calls. Rewriting the
//! same terminal state is a no-op, and a completed key is never overwritten.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointStatus::Completed => write!(f, "completed"),
            CheckpointStatus::Failed => write!(f, "failed"),
            CheckpointStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub key: String,
    pub status: CheckpointStatus,
    pub artifact_hash: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// Failure message or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckpointRecord {
    pub fn completed(key: impl Into<String>, artifact_hash: Option<String>) -> Self {
        Self::new(key, CheckpointStatus::Completed, artifact_hash, None)
    }

    pub fn failed(key: impl Into<String>, error: &str) -> Self {
        Self::new(key, CheckpointStatus::Failed, None, Some(error.to_string()))
    }

    pub fn cancelled(key: impl Into<String>, artifact_hash: Option<String>, reason: &str) -> Self {
        Self::new(
            key,
            CheckpointStatus::Cancelled,
            artifact_hash,
            Some(reason.to_string()),
        )
    }

    fn new(
        key: impl Into<String>,
        status: CheckpointStatus,
        artifact_hash: Option<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            status,
            artifact_hash,
            completed_at: Utc::now(),
            detail,
        }
    }
}

/// Decide whether `incoming` may be written over `existing`.
///
/// Returns `Ok(false)` for a repeat of the same terminal state.
fn admit(existing: Option<&CheckpointRecord>, incoming: &CheckpointRecord) -> Result<bool> {
    let Some(existing) = existing else {
        return Ok(true);
    };
    if existing.status == incoming.status && existing.artifact_hash == incoming.artifact_hash {
        return Ok(false);
    }
    if existing.status == CheckpointStatus::Completed {
        return Err(Error::CheckpointConflict {
            key: incoming.key.clone(),
            existing: existing.status.to_string(),
            attempted: incoming.status.to_string(),
        });
    }
    Ok(true)
}

pub trait CheckpointStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CheckpointRecord>>;

    /// Persist a record. Returns `false` when it was already recorded.
    fn put(&self, record: CheckpointRecord) -> Result<bool>;

    /// All records, ordered by key.
    fn all(&self) -> Result<Vec<CheckpointRecord>>;
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("checkpoint store lock poisoned".into())
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<String, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.records.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn put(&self, record: CheckpointRecord) -> Result<bool> {
        let mut records = self.records.lock().map_err(poisoned)?;
        if !admit(records.get(&record.key), &record)? {
            return Ok(false);
        }
        records.insert(record.key.clone(), record);
        Ok(true)
    }

    fn all(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self.records.lock().map_err(poisoned)?.values().cloned().collect())
    }
}

struct FileState {
    file: File,
    records: BTreeMap<String, CheckpointRecord>,
}

/// Checkpoints appended to an NDJSON file; the last record per key wins.
pub struct FileCheckpointStore {
    state: Mutex<FileState>,
}

impl FileCheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut records = BTreeMap::new();
        let mut valid_len = 0u64;
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            for raw in text.split_inclusive('\n') {
                if !raw.ends_with('\n') {
                    warn!(path = %path.display(), "ignoring torn checkpoint tail");
                    break;
                }
                if !raw.trim().is_empty() {
                    let record: CheckpointRecord = serde_json::from_str(raw.trim_end()).map_err(|e| {
                        Error::Storage(format!("corrupt checkpoint file {}: {}", path.display(), e))
                    })?;
                    records.insert(record.key.clone(), record);
                }
                valid_len += raw.len() as u64;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
        }
        debug!(path = %path.display(), records = records.len(), "checkpoint store opened");
        Ok(Self {
            state: Mutex::new(FileState { file, records }),
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.state.lock().map_err(poisoned)?.records.get(key).cloned())
    }

    fn put(&self, record: CheckpointRecord) -> Result<bool> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if !admit(state.records.get(&record.key), &record)? {
            debug!(key = record.key.as_str(), "checkpoint already recorded");
            return Ok(false);
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        state.file.write_all(line.as_bytes())?;
        state.file.sync_data()?;
        debug!(key = record.key.as_str(), status = %record.status, "checkpoint written");
        state.records.insert(record.key.clone(), record);
        Ok(true)
    }

    fn all(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self.state.lock().map_err(poisoned)?.records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ========== Admission Rules ==========

    #[test]
    fn test_repeat_terminal_state_is_noop() {
        let store = MemoryCheckpointStore::new();
        assert!(store.put(CheckpointRecord::completed("a", Some("h".into()))).unwrap());
        assert!(!store.put(CheckpointRecord::completed("a", Some("h".into()))).unwrap());
    }

    #[test]
    fn test_completed_is_final() {
        let store = MemoryCheckpointStore::new();
        store.put(CheckpointRecord::completed("a", Some("h".into()))).unwrap();

        let err = store.put(CheckpointRecord::failed("a", "late failure")).unwrap_err();
        assert!(matches!(err, Error::CheckpointConflict { .. }));
        let err = store
            .put(CheckpointRecord::completed("a", Some("other".into())))
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointConflict { .. }));
    }

    #[test]
    fn test_failed_and_cancelled_can_be_superseded() {
        let store = MemoryCheckpointStore::new();
        store.put(CheckpointRecord::failed("a", "timeout")).unwrap();
        assert!(store.put(CheckpointRecord::completed("a", Some("h".into()))).unwrap());

        store
            .put(CheckpointRecord::cancelled("b", Some("h2".into()), "terminated"))
            .unwrap();
        assert!(store.put(CheckpointRecord::completed("b", Some("h2".into()))).unwrap());
        assert_eq!(store.get("b").unwrap().unwrap().status, CheckpointStatus::Completed);
    }

    // ========== File Backend ==========

    #[test]
    fn test_file_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoints.ndjson");
        {
            let store = FileCheckpointStore::open(&path).unwrap();
            store.put(CheckpointRecord::failed("a", "timeout")).unwrap();
            store.put(CheckpointRecord::completed("a", Some("h".into()))).unwrap();
            store.put(CheckpointRecord::cancelled("b", None, "upstream failure")).unwrap();
        }

        let store = FileCheckpointStore::open(&path).unwrap();
        let a = store.get("a").unwrap().unwrap();
        assert_eq!(a.status, CheckpointStatus::Completed);
        assert_eq!(a.artifact_hash.as_deref(), Some("h"));
        assert_eq!(store.all().unwrap().len(), 2);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_file_store_noop_does_not_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoints.ndjson");
        let store = FileCheckpointStore::open(&path).unwrap();
        store.put(CheckpointRecord::completed("a", None)).unwrap();
        store.put(CheckpointRecord::completed("a", None)).unwrap();

        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 1);
    }

    #[test]
    fn test_file_store_ignores_torn_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoints.ndjson");
        {
            let store = FileCheckpointStore::open(&path).unwrap();
            store.put(CheckpointRecord::completed("a", None)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"key":"b","sta"#).unwrap();
        drop(file);

        let store = FileCheckpointStore::open(&path).unwrap();
        assert!(store.get("b").unwrap().is_none());
        store.put(CheckpointRecord::completed("b", None)).unwrap();
        drop(store);

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert!(reopened.get("b").unwrap().is_some());
    }
}
