//! Failure isolation, quality termination and budget tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use sift::core::task::{TaskId, TaskStatus, TaskType};
use sift::journal::CheckpointStatus;
use sift::orchestration::scheduler::UPSTREAM_FAILURE;
use sift::orchestration::RunOutcome;
use sift::Error;

use crate::fixtures::{
    analyze, gated_plan, plan, run, task, test_config, ScriptedService, StateDir,
};

const PROSE: &str = "This paper seems fine overall, I would rate it highly.";

// ========== Failure Isolation ==========

/// Test: Upstream failure
/// Given A depends on B and C, and B's agent rejects every request
/// When the plan runs
/// Then B fails, A and everything after it is cancelled, C completes
#[tokio::test]
async fn test_failure_cancels_dependents_and_spares_siblings() {
    let state = StateDir::new();
    let plan = plan(vec![
        analyze("b", "p1", "broken"),
        analyze("c", "p1", "gamma"),
        task("a", TaskType::Extract, &["b", "c"], Value::Null),
        task("s", TaskType::Synthesize, &["a"], Value::Null),
    ]);
    let service = Arc::new(
        ScriptedService::new()
            .reject("broken")
            .scores("gamma", &[("rigor", 0.6)]),
    );

    let report = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(matches!(report.statuses[&TaskId::new("b")], TaskStatus::Failed { .. }));
    assert_eq!(report.statuses[&TaskId::new("c")], TaskStatus::Completed);
    for id in ["a", "s"] {
        assert_eq!(
            report.statuses[&TaskId::new(id)],
            TaskStatus::Cancelled {
                reason: UPSTREAM_FAILURE.into()
            },
            "task {}",
            id
        );
        assert_eq!(state.checkpoint(id).unwrap().status, CheckpointStatus::Cancelled);
    }
    assert_eq!(state.checkpoint("b").unwrap().status, CheckpointStatus::Failed);
    assert_eq!(service.call_count(), 2, "permanent rejection is not retried");
    assert!(report.final_artifact.is_none());
}

#[tokio::test]
async fn test_transient_failures_are_retried_and_logged() {
    let state = StateDir::new();
    let plan = gated_plan(&["alpha"]);
    let service = Arc::new(
        ScriptedService::new()
            .scores("alpha", &[("rigor", 0.6)])
            .fail_transiently("alpha", 2),
    );

    let report = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(service.call_count(), 3);
    let failures = state
        .event_types()
        .into_iter()
        .filter(|e| e == "call_failed")
        .count();
    assert_eq!(failures, 2);
}

// ========== Quality Gate ==========

/// Test: Systematic quality failure
/// Given two of three agents answer in prose
/// When the quality gate evaluates the batch
/// Then the run terminates and synthesis is never dispatched
#[tokio::test]
async fn test_quality_gate_terminates_run() {
    let state = StateDir::new();
    let plan = gated_plan(&["alpha", "beta", "gamma"]);
    let service = Arc::new(
        ScriptedService::new()
            .scores("alpha", &[("rigor", 0.6)])
            .analysis("beta", PROSE)
            .analysis("gamma", PROSE),
    );

    let report = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();

    let RunOutcome::Terminated { reason } = &report.outcome else {
        panic!("Expected Terminated, got {:?}", report.outcome);
    };
    assert!(reason.contains("(2/3)"), "reason: {}", reason);
    assert_eq!(report.statuses[&TaskId::new("gate")], TaskStatus::Completed);
    let TaskStatus::Cancelled { reason } = &report.statuses[&TaskId::new("synthesize")] else {
        panic!("synthesize should be cancelled");
    };
    assert!(reason.starts_with("quality gate terminated run:"));

    let events = state.event_types();
    assert!(events.contains(&"quality_verdict".to_string()));
    assert!(events.contains(&"run_terminated".to_string()));
    assert!(!state
        .chronolog()
        .iter()
        .any(|e| e.event_type == "task_dispatched" && e.payload["task_id"] == "synthesize"));

    // A resumed run stops at the same gate without new calls.
    let resumed = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();
    assert!(matches!(resumed.outcome, RunOutcome::Terminated { .. }));
    assert_eq!(service.call_count(), 3);
}

/// Test: In-flight work during termination
/// Given a slow analysis still running when the gate terminates the run
/// When its response arrives
/// Then the response is persisted and checkpointed as cancelled, and a
///      resumed run does not pay for it again
#[tokio::test]
async fn test_response_arriving_after_termination_is_kept() {
    let state = StateDir::new();
    let plan = plan(vec![
        analyze("analyze-beta", "p1", "beta"),
        analyze("analyze-gamma", "p1", "gamma"),
        analyze("analyze-slow", "p2", "slow"),
        task(
            "extract",
            TaskType::Extract,
            &["analyze-beta", "analyze-gamma"],
            Value::Null,
        ),
        task("gate", TaskType::QualityGate, &["extract"], Value::Null),
        task(
            "synthesize",
            TaskType::Synthesize,
            &["gate", "analyze-slow"],
            Value::Null,
        ),
    ]);
    let service = Arc::new(
        ScriptedService::new()
            .analysis("beta", PROSE)
            .analysis("gamma", PROSE)
            .scores("slow", &[("rigor", 0.5)])
            .slow("slow", Duration::from_millis(300)),
    );
    let mut config = test_config();
    config.pool.max_workers = 4;

    let report = run(&plan, config.clone(), state.open(), service.clone())
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Terminated { .. }));
    assert!(matches!(
        report.statuses[&TaskId::new("analyze-slow")],
        TaskStatus::Cancelled { .. }
    ));
    let record = state.checkpoint("analyze-slow").unwrap();
    assert_eq!(record.status, CheckpointStatus::Cancelled);
    let paid = record.artifact_hash.expect("paid response must be kept");

    run(&plan, config, state.open(), service.clone()).await.unwrap();
    assert_eq!(service.call_count(), 3);
    assert_eq!(
        state.checkpoint("analyze-slow").unwrap().artifact_hash,
        Some(paid)
    );
}

// ========== Budget ==========

#[tokio::test]
async fn test_budget_exhaustion_aborts_with_checkpoints_intact() {
    let state = StateDir::new();
    let plan = gated_plan(&["alpha", "beta", "gamma"]);
    let service = Arc::new(
        ScriptedService::new()
            .scores("alpha", &[("rigor", 0.6)])
            .scores("beta", &[("rigor", 0.6)])
            .scores("gamma", &[("rigor", 0.6)]),
    );
    let mut config = test_config();
    config.budget.max_external_calls = Some(2);

    let result = run(&plan, config, state.open(), service.clone()).await;

    match result {
        Err(Error::ResourceExhaustion { limit, used }) => {
            assert_eq!(limit, 2);
            assert_eq!(used, 2);
        }
        other => panic!("Expected ResourceExhaustion, got {:?}", other.map(|r| r.outcome)),
    }
    let completed = ["analyze-alpha", "analyze-beta", "analyze-gamma"]
        .iter()
        .filter_map(|key| state.checkpoint(key))
        .filter(|r| r.status == CheckpointStatus::Completed)
        .count();
    assert_eq!(completed, 2);

    // Resume with a fresh budget pays only for the missing call.
    let report = run(&plan, test_config(), state.open(), service.clone())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.external_calls, 1);
    assert_eq!(service.call_count(), 3);
}
