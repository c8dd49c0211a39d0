//! Divergence, debate, arbitration and calculation end to end.

use std::sync::Arc;

use sift::core::task::{TaskId, TaskStatus};
use sift::orchestration::RunOutcome;
use sift::pipeline::{Confidence, Resolution};

use crate::fixtures::{
    crashing_stores, ensemble_plan, run, test_config, ScriptedService, StateDir, LONG_QUOTE,
};

const OVERALL: &str = "(rigor + novelty) / 2";

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}

/// Alpha and beta disagree on rigor and agree on novelty.
fn disagreeing_agents() -> ScriptedService {
    ScriptedService::new()
        .scores("alpha", &[("rigor", 0.9), ("novelty", 0.5)])
        .scores("beta", &[("rigor", 0.3), ("novelty", 0.6)])
}

/// Alpha defends with a verified quote, beta with an invented one.
fn decisive_debate() -> Arc<ScriptedService> {
    Arc::new(
        disagreeing_agents()
            .defense("alpha", 0.9, &[LONG_QUOTE])
            .defense("beta", 0.3, &["the sample was tiny and unblinded"]),
    )
}

/// Test: Decisive debate
/// Given two agents diverging on rigor beyond tolerance
/// When only one defense cites the input verbatim
/// Then its value wins in the first round and feeds the calculation
#[tokio::test]
async fn test_verified_defense_wins_and_drives_calculation() {
    let state = StateDir::new();
    let service = decisive_debate();

    let report = run(&ensemble_plan(OVERALL), test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(service.calls_in_mode("analysis"), 2);
    assert_eq!(service.calls_in_mode("defense"), 2, "one round, one defense per agent");

    let synthesis = state.synthesis(&report.final_artifact.unwrap());
    let p1 = &synthesis.inputs["p1"];
    let rigor = &p1.arbitrated["rigor"];
    assert_close(rigor.winning_value, 0.9);
    assert_eq!(rigor.confidence, Confidence::High);
    assert_eq!(rigor.resolution, Resolution::Winner);
    assert!(!p1.arbitrated.contains_key("novelty"));
    assert_close(p1.values["rigor"], 0.9);
    assert_close(p1.values["novelty"], 0.55);
    assert_close(p1.derived["overall"], 0.725);
    assert!(synthesis.low_confidence.is_empty());

    let events = state.event_types();
    for expected in [
        "divergence_detected",
        "debate_round_completed",
        "arbitration_decided",
    ] {
        assert!(events.contains(&expected.to_string()), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_defense_payload_hides_peer_identity() {
    let state = StateDir::new();
    let service = decisive_debate();

    run(&ensemble_plan(OVERALL), test_config(), state.open(), service.clone())
        .await
        .unwrap();

    for call in service.calls().iter().filter(|c| c.mode == "defense") {
        let peer = if call.agent_id == "alpha" { "beta" } else { "alpha" };
        assert!(
            !call.payload.contains(peer),
            "{}'s defense request names {}",
            call.agent_id,
            peer
        );
    }
}

/// Test: Deadlocked debate
/// Given defenses that cite nothing verifiable
/// When every round ends without a clear winner
/// Then the median of the final round is used with low confidence
#[tokio::test]
async fn test_deadlock_falls_back_to_median() {
    let state = StateDir::new();
    let service = Arc::new(
        disagreeing_agents()
            .defense("alpha", 0.9, &[])
            .defense("beta", 0.3, &[]),
    );

    let report = run(&ensemble_plan(OVERALL), test_config(), state.open(), service.clone())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(service.calls_in_mode("defense"), 4, "two rounds of two defenses");

    let synthesis = state.synthesis(&report.final_artifact.unwrap());
    let rigor = &synthesis.inputs["p1"].arbitrated["rigor"];
    assert_close(rigor.winning_value, 0.6);
    assert_eq!(rigor.confidence, Confidence::Low);
    assert_eq!(rigor.resolution, Resolution::MedianFallback);
    assert_eq!(synthesis.low_confidence, vec!["p1:rigor"]);
    assert_close(synthesis.inputs["p1"].derived["overall"], 0.575);
    assert!(state
        .event_types()
        .contains(&"arbitration_fallback".to_string()));
}

#[tokio::test]
async fn test_missing_formula_input_fails_calculation_only() {
    let state = StateDir::new();

    let report = run(
        &ensemble_plan("rigor + clarity"),
        test_config(),
        state.open(),
        decisive_debate(),
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    match &report.statuses[&TaskId::new("calculate")] {
        TaskStatus::Failed { error } => assert!(error.contains("clarity"), "error: {}", error),
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert_eq!(report.statuses[&TaskId::new("arbitrate")], TaskStatus::Completed);
    assert!(matches!(
        report.statuses[&TaskId::new("synthesize")],
        TaskStatus::Cancelled { .. }
    ));
}

/// Test: Crash during the debate
/// Given a crash at every checkpoint write of the ensemble run
/// When each run is resumed
/// Then no analysis or defense call is ever issued twice
#[tokio::test]
async fn test_debate_calls_survive_crashes_without_duplicates() {
    let plan = ensemble_plan(OVERALL);
    let clean_state = StateDir::new();
    let clean = run(&plan, test_config(), clean_state.open(), decisive_debate())
        .await
        .unwrap();

    for budget in 0..10 {
        let state = StateDir::new();
        let service = decisive_debate();
        let _ = run(&plan, test_config(), crashing_stores(state.path(), budget), service.clone()).await;

        let report = run(&plan, test_config(), state.open(), service.clone())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed, "crash after {} writes", budget);
        assert_eq!(service.call_count(), 4, "crash after {} writes", budget);
        assert_eq!(service.duplicate_calls(), 0, "crash after {} writes", budget);
        assert_eq!(report.final_artifact, clean.final_artifact, "crash after {} writes", budget);
    }
}
