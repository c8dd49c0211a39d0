//! Append-only, hash-chained event log.
//!
//! Each line of the chronolog file is one JSON entry:
//! `{seq, timestamp, prev_hash, hash, event_type, payload}` with
//! `hash = sha256(prev_hash ‖ payload)`. The chain is verified every time the
//! file is opened; a mismatch is an integrity violation and the run refuses to
//! continue.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Everything the engine records about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChronologEvent {
    RunStarted {
        run_id: String,
        plan_hash: String,
    },
    RunResumed {
        run_id: String,
        completed: usize,
    },
    /// Written before an external call is issued.
    Intent {
        key: String,
        inputs_hash: String,
    },
    /// An intent from an earlier process had no recorded response.
    IntentReissued {
        key: String,
    },
    /// A response was persisted as an artifact.
    ResponseReceived {
        key: String,
        artifact_hash: String,
    },
    CallFailed {
        key: String,
        attempt: u32,
        error: String,
        transient: bool,
    },
    TaskDispatched {
        task_id: String,
    },
    TaskCompleted {
        task_id: String,
        artifact_hash: Option<String>,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskCancelled {
        task_id: String,
        reason: String,
    },
    ItemExtracted {
        task_id: String,
        input_id: String,
        agent_id: String,
        repair_attempts: u32,
    },
    ItemFailed {
        task_id: String,
        input_id: String,
        agent_id: String,
        error: String,
        repair_attempts: u32,
    },
    QualityVerdict {
        task_id: String,
        batch_id: String,
        decision: String,
        reason: String,
    },
    DivergenceDetected {
        task_id: String,
        case_id: String,
        dimension: String,
        spread: f64,
        records: usize,
    },
    DebateRoundCompleted {
        task_id: String,
        case_id: String,
        round: u32,
        defenses: usize,
    },
    ArbitrationDecided {
        task_id: String,
        case_id: String,
        winning_value: f64,
        confidence: String,
    },
    /// No defense dominated; the value is a deterministic aggregate.
    ArbitrationFallback {
        task_id: String,
        case_id: String,
        value: f64,
        rounds: u32,
    },
    RunTerminated {
        reason: String,
    },
    RunFinished {
        outcome: String,
    },
}

impl ChronologEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ChronologEvent::RunStarted { .. } => "run_started",
            ChronologEvent::RunResumed { .. } => "run_resumed",
            ChronologEvent::Intent { .. } => "intent",
            ChronologEvent::IntentReissued { .. } => "intent_reissued",
            ChronologEvent::ResponseReceived { .. } => "response_received",
            ChronologEvent::CallFailed { .. } => "call_failed",
            ChronologEvent::TaskDispatched { .. } => "task_dispatched",
            ChronologEvent::TaskCompleted { .. } => "task_completed",
            ChronologEvent::TaskFailed { .. } => "task_failed",
            ChronologEvent::TaskCancelled { .. } => "task_cancelled",
            ChronologEvent::ItemExtracted { .. } => "item_extracted",
            ChronologEvent::ItemFailed { .. } => "item_failed",
            ChronologEvent::QualityVerdict { .. } => "quality_verdict",
            ChronologEvent::DivergenceDetected { .. } => "divergence_detected",
            ChronologEvent::DebateRoundCompleted { .. } => "debate_round_completed",
            ChronologEvent::ArbitrationDecided { .. } => "arbitration_decided",
            ChronologEvent::ArbitrationFallback { .. } => "arbitration_fallback",
            ChronologEvent::RunTerminated { .. } => "run_terminated",
            ChronologEvent::RunFinished { .. } => "run_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChronologEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
    pub event_type: String,
    pub payload: Value,
}

impl ChronologEntry {
    pub fn event(&self) -> Result<ChronologEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// `sha256(prev_hash ‖ canonical payload bytes)`, hex encoded.
pub fn chain_hash(prev_hash: &str, payload: &Value) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(serde_json::to_vec(payload)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check that `entries` form an unbroken chain starting at the genesis hash.
pub fn verify_chain(entries: &[ChronologEntry]) -> Result<()> {
    let mut prev = GENESIS_HASH.to_string();
    for (expected_seq, entry) in entries.iter().enumerate() {
        let expected_seq = expected_seq as u64;
        let violation = |detail: String| Error::IntegrityViolation {
            seq: entry.seq,
            detail,
        };
        if entry.seq != expected_seq {
            return Err(violation(format!("expected seq {}, found {}", expected_seq, entry.seq)));
        }
        if entry.prev_hash != prev {
            return Err(violation("prev_hash does not match preceding entry".into()));
        }
        if chain_hash(&entry.prev_hash, &entry.payload)? != entry.hash {
            return Err(violation("hash does not match payload".into()));
        }
        let tag = entry.payload.get("event").and_then(Value::as_str);
        if tag != Some(entry.event_type.as_str()) {
            return Err(violation(format!(
                "event_type '{}' does not match payload",
                entry.event_type
            )));
        }
        prev = entry.hash.clone();
    }
    Ok(())
}

/// Single-writer handle on a run's chronolog.
pub struct Chronolog {
    path: Option<PathBuf>,
    file: Option<File>,
    /// File length covered by `entries`.
    synced_len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    entries: Vec<ChronologEntry>,
}

impl Chronolog {
    /// A chronolog that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            synced_len: 0,
            poisoned: false,
            entries: Vec::new(),
        }
    }

    /// Open (or create) a chronolog file, verifying the existing chain.
    ///
    /// A final line without a trailing newline that does not parse is a torn
    /// write from a crash and is truncated away. Anything else that does not
    /// verify is an integrity violation.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (entries, valid_len) = if path.exists() {
            load_entries(&std::fs::read_to_string(path)?)?
        } else {
            (Vec::new(), 0)
        };
        verify_chain(&entries)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() != valid_len {
            warn!(path = %path.display(), "truncating torn chronolog tail");
            file.set_len(valid_len)?;
        }
        debug!(path = %path.display(), entries = entries.len(), "chronolog opened");

        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(file),
            synced_len: valid_len,
            poisoned: false,
            entries,
        })
    }

    /// Verify a chronolog file without opening it for writing.
    pub fn verify_file(path: &Path) -> Result<usize> {
        let (entries, _) = load_entries(&std::fs::read_to_string(path)?)?;
        verify_chain(&entries)?;
        Ok(entries.len())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &[ChronologEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_hash(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.hash.as_str())
            .unwrap_or(GENESIS_HASH)
    }

    /// Decoded events in order.
    pub fn events(&self) -> Result<Vec<ChronologEvent>> {
        self.entries.iter().map(ChronologEntry::event).collect()
    }

    /// Append one event and sync it to disk before returning.
    ///
    /// A failed write is truncated back to the last synced entry. If that
    /// also fails the writer refuses every later append, so the file never
    /// holds an entry the in-memory chain does not.
    pub fn append(&mut self, event: &ChronologEvent) -> Result<&ChronologEntry> {
        if self.poisoned {
            return Err(Error::Storage(
                "chronolog writer disabled after a failed append".into(),
            ));
        }
        let payload = serde_json::to_value(event)?;
        let prev_hash = self.last_hash().to_string();
        let entry = ChronologEntry {
            seq: self.entries.len() as u64,
            timestamp: Utc::now(),
            hash: chain_hash(&prev_hash, &payload)?,
            prev_hash,
            event_type: event.event_type().to_string(),
            payload,
        };

        if let Some(file) = self.file.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let written = file
                .write_all(line.as_bytes())
                .and_then(|_| file.sync_data());
            if let Err(e) = written {
                self.rollback();
                return Err(e.into());
            }
            self.synced_len += line.len() as u64;
        }
        debug!(seq = entry.seq, event = entry.event_type.as_str(), "chronolog append");

        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }
}

impl Chronolog {
    /// Drop any bytes past the last synced entry.
    fn rollback(&mut self) {
        let Some(file) = self.file.as_ref() else {
            return;
        };
        let restored = file
            .set_len(self.synced_len)
            .and_then(|_| file.sync_data());
        if let Err(e) = restored {
            error!(error = %e, len = self.synced_len, "chronolog rollback failed, disabling writer");
            self.poisoned = true;
        } else {
            warn!(len = self.synced_len, "rolled back failed chronolog append");
        }
    }
}

/// Parse NDJSON entries, returning them with the byte length of the valid prefix.
fn load_entries(text: &str) -> Result<(Vec<ChronologEntry>, u64)> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    for raw in text.split_inclusive('\n') {
        // Entries are written together with their newline.
        if !raw.ends_with('\n') {
            break;
        }
        let line = raw.trim_end();
        if !line.is_empty() {
            let entry = serde_json::from_str::<ChronologEntry>(line).map_err(|e| {
                Error::IntegrityViolation {
                    seq: entries.len() as u64,
                    detail: format!("unparseable entry: {}", e),
                }
            })?;
            entries.push(entry);
        }
        offset += raw.len();
    }
    Ok((entries, offset as u64))
}
