//! Startup reconciliation of the chronolog with the checkpoint store.
//!
//! A crash can land between any two durable writes of a call:
//!
//! | Last durable write  | On restart                                      |
//! |---------------------|-------------------------------------------------|
//! | INTENT              | intent reissued; the call runs again            |
//! | RESPONSE_RECEIVED   | checkpoint re-materialized; no call             |
//! | checkpoint          | nothing to do                                   |

use crate::error::Result;
use crate::journal::{CheckpointRecord, CheckpointStatus, ChronologEvent};
use crate::orchestration::context::RunContext;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Keys whose response was persisted but not checkpointed.
    pub materialized: Vec<String>,
    /// Keys whose call left no response and will be issued again.
    pub reissued: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.materialized.is_empty() && self.reissued.is_empty()
    }
}

#[derive(Default)]
struct CallState {
    intent: bool,
    response: Option<String>,
}

pub async fn reconcile(ctx: &RunContext) -> Result<RecoveryReport> {
    let mut calls: BTreeMap<String, CallState> = BTreeMap::new();
    for entry in ctx.chronolog_entries().await {
        match entry.event()? {
            ChronologEvent::Intent { key, .. } => {
                let state = calls.entry(key).or_default();
                state.intent = true;
            }
            ChronologEvent::ResponseReceived { key, artifact_hash } => {
                calls.entry(key).or_default().response = Some(artifact_hash);
            }
            ChronologEvent::IntentReissued { key } => {
                calls.entry(key).or_default().intent = false;
            }
            _ => {}
        }
    }

    let mut report = RecoveryReport::default();
    for (key, state) in calls {
        let existing = ctx.checkpoints.get(&key)?;
        let has_response = matches!(
            &existing,
            Some(r) if r.artifact_hash.is_some()
                && matches!(r.status, CheckpointStatus::Completed | CheckpointStatus::Cancelled)
        );
        if has_response {
            continue;
        }
        match state.response {
            Some(hash) if ctx.artifacts.contains(&hash)? => {
                warn!(key = key.as_str(), "response persisted without checkpoint, restoring");
                ctx.checkpoints
                    .put(CheckpointRecord::completed(key.as_str(), Some(hash)))?;
                report.materialized.push(key);
            }
            _ if state.intent => {
                info!(key = key.as_str(), "intent without response, call will be reissued");
                ctx.record(ChronologEvent::IntentReissued { key: key.clone() })
                    .await?;
                report.reissued.push(key);
            }
            _ => {}
        }
    }
    Ok(report)
}
