//! Crash recovery and idempotent re-run tests.
//!
//! A "process" is one `run` over stores opened from the state directory.
//! Crashes are simulated by a checkpoint store that starts failing after a
//! fixed number of writes.

use std::sync::Arc;

use sift::journal::{CheckpointStatus, ChronologEvent};
use sift::orchestration::{RunContext, RunOutcome};
use sift::Error;

use crate::fixtures::{
    crashing_stores, gated_plan, run, test_config, ScriptedService, StateDir,
};

fn two_agents() -> Arc<ScriptedService> {
    Arc::new(
        ScriptedService::new()
            .scores("alpha", &[("rigor", 0.8)])
            .scores("beta", &[("rigor", 0.7)]),
    )
}

/// Test: Crash between response persistence and checkpoint
/// Given a checkpoint store that dies on its second write
/// When the run is restarted on the same state directory
/// Then the persisted response is adopted and no call is repeated
#[tokio::test]
async fn test_crash_before_checkpoint_resumes_without_duplicate_calls() {
    let state = StateDir::new();
    let plan = gated_plan(&["alpha", "beta"]);
    let service = two_agents();

    let first = run(&plan, test_config(), crashing_stores(state.path(), 1), service.clone()).await;
    assert!(
        matches!(first, Err(Error::Storage(_))),
        "first process should die on the injected crash, got {:?}",
        first
    );
    assert_eq!(service.call_count(), 2);

    let report = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(service.call_count(), 2, "resume must not repeat a paid call");
    assert_eq!(service.duplicate_calls(), 0);
    assert!(state.event_types().contains(&"run_resumed".to_string()));
}

/// Test: Every crash point resumes to the same result
/// Given a crash after each possible number of checkpoint writes
/// When each run is resumed
/// Then every resumed run issues exactly one call per analysis and
///      produces the same final artifact as an uninterrupted run
#[tokio::test]
async fn test_every_crash_point_converges_to_same_artifact() {
    let plan = gated_plan(&["alpha", "beta"]);

    let clean_state = StateDir::new();
    let clean = run(&plan, test_config(), clean_state.open(), two_agents())
        .await
        .unwrap();
    let expected = clean.final_artifact.clone().unwrap();

    for budget in 0..6 {
        let state = StateDir::new();
        let service = two_agents();
        let _ = run(&plan, test_config(), crashing_stores(state.path(), budget), service.clone()).await;

        let report = run(&plan, test_config(), state.open(), service.clone())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed, "crash after {} writes", budget);
        assert_eq!(service.call_count(), 2, "crash after {} writes", budget);
        assert_eq!(service.duplicate_calls(), 0, "crash after {} writes", budget);
        assert_eq!(
            report.final_artifact.as_deref(),
            Some(expected.as_str()),
            "crash after {} writes",
            budget
        );
    }
}

/// Test: Intent without a response
/// Given a chronolog whose last call left only an intent
/// When the run starts
/// Then the intent is marked reissued and the call runs exactly once
#[tokio::test]
async fn test_orphan_intent_is_reissued() {
    let state = StateDir::new();
    let plan = gated_plan(&["alpha"]);
    {
        let ctx = RunContext::new("it-run", test_config(), state.open(), two_agents());
        ctx.record(ChronologEvent::Intent {
            key: "analyze-alpha".into(),
            inputs_hash: "deadbeef".into(),
        })
        .await
        .unwrap();
    }
    let service = two_agents();

    let report = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(service.call_count(), 1);
    let events = state.event_types();
    let reissued = events.iter().position(|e| e == "intent_reissued").unwrap();
    let resumed = events.iter().position(|e| e == "run_resumed").unwrap();
    assert!(reissued < resumed);
    assert_eq!(
        state.checkpoint("analyze-alpha").unwrap().status,
        CheckpointStatus::Completed
    );
}

/// Test: Re-running a finished plan
/// Given a run that completed
/// When the same plan is run again on the same state directory
/// Then no external call is made and the result is unchanged
#[tokio::test]
async fn test_rerun_of_completed_plan_is_free() {
    let state = StateDir::new();
    let plan = gated_plan(&["alpha", "beta"]);
    let service = two_agents();

    let first = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();
    let second = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(service.call_count(), 2);
    assert_eq!(second.external_calls, 0);
    assert_eq!(first.final_artifact, second.final_artifact);
    assert_eq!(first.statuses, second.statuses);
}

/// Test: Independent runs of the same plan are byte-identical
#[tokio::test]
async fn test_identical_inputs_produce_identical_synthesis() {
    let plan = gated_plan(&["alpha", "beta"]);
    let a = StateDir::new();
    let b = StateDir::new();

    let mut config = test_config();
    let first = run(&plan, config.clone(), a.open(), two_agents()).await.unwrap();
    config.pool.max_workers = 4;
    let second = run(&plan, config, b.open(), two_agents()).await.unwrap();

    let hash = first.final_artifact.unwrap();
    assert_eq!(Some(hash.clone()), second.final_artifact);
    let report = a.synthesis(&hash);
    assert_eq!(report.run_id, "it-run");
    assert_eq!(report.inputs["p1"].agents, vec!["alpha", "beta"]);
}
