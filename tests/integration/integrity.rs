//! Chronolog tampering detection.

use std::sync::Arc;

use serde_json::Value;

use sift::journal::Chronolog;
use sift::orchestration::RunStores;
use sift::Error;

use crate::fixtures::{gated_plan, run, test_config, ScriptedService, StateDir};

async fn completed_run() -> StateDir {
    let state = StateDir::new();
    let service = Arc::new(
        ScriptedService::new()
            .scores("alpha", &[("rigor", 0.8)])
            .scores("beta", &[("rigor", 0.6)]),
    );
    run(&gated_plan(&["alpha", "beta"]), test_config(), state.open(), service)
        .await
        .unwrap();
    state
}

/// Rewrite the chronolog file through `edit`, one JSON value per line.
fn rewrite_chronolog(state: &StateDir, edit: impl FnOnce(&mut Vec<Value>)) {
    let path = state.paths().chronolog;
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    edit(&mut lines);
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    std::fs::write(&path, out).unwrap();
}

fn violation_seq(result: sift::Result<usize>) -> u64 {
    match result {
        Err(Error::IntegrityViolation { seq, .. }) => seq,
        other => panic!("Expected IntegrityViolation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_untouched_chronolog_verifies() {
    let state = completed_run().await;
    let count = Chronolog::verify_file(&state.paths().chronolog).unwrap();
    assert_eq!(count, state.chronolog().len());
    assert!(count > 0);
}

/// Test: Edited payload
/// Given a completed run
/// When one recorded event's payload is altered
/// Then verification fails at that entry and the run refuses to resume
#[tokio::test]
async fn test_edited_payload_is_detected() {
    let state = completed_run().await;
    rewrite_chronolog(&state, |lines| {
        lines[2]["payload"]["edited"] = Value::Bool(true);
    });

    assert_eq!(violation_seq(Chronolog::verify_file(&state.paths().chronolog)), 2);
    assert!(matches!(
        RunStores::open(state.path()),
        Err(Error::IntegrityViolation { seq: 2, .. })
    ));
}

#[tokio::test]
async fn test_deleted_entry_is_detected() {
    let state = completed_run().await;
    rewrite_chronolog(&state, |lines| {
        lines.remove(1);
    });

    assert_eq!(violation_seq(Chronolog::verify_file(&state.paths().chronolog)), 2);
}

#[tokio::test]
async fn test_forged_hash_is_detected() {
    let state = completed_run().await;
    rewrite_chronolog(&state, |lines| {
        lines[1]["hash"] = Value::String("0".repeat(64));
    });

    let seq = violation_seq(Chronolog::verify_file(&state.paths().chronolog));
    assert_eq!(seq, 1);
}

#[tokio::test]
async fn test_torn_tail_is_not_tampering() {
    let state = completed_run().await;
    let path = state.paths().chronolog;
    let before = state.chronolog().len();
    let mut text = std::fs::read_to_string(&path).unwrap();
    text.push_str(r#"{"seq": 999, "timest"#);
    std::fs::write(&path, text).unwrap();

    let stores = RunStores::open(state.path()).unwrap();
    assert_eq!(stores.chronolog.len(), before);
    assert_eq!(Chronolog::verify_file(&path).unwrap(), before);
}
