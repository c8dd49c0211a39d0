//! Task handlers: one per [`TaskConfig`] variant, matched exhaustively.
//!
//! Every handler reads its inputs from dependency artifacts and writes one
//! artifact. External calls go through [`persisted_call`], which enforces
//! the write-ahead discipline: INTENT before the call, then artifact,
//! RESPONSE_RECEIVED and checkpoint before the response is used.

use crate::core::artifact::{get_json, put_json};
use crate::core::content_hash;
use crate::core::plan::{
    AnalyzeConfig, ArbitrateConfig, CalculateConfig, DivergenceTaskConfig, ExtractConfig,
    QualityGateConfig, TaskConfig,
};
use crate::core::task::{TaskId, TaskType};
use crate::error::{Error, Result};
use crate::journal::{CheckpointRecord, CheckpointStatus, ChronologEvent};
use crate::orchestration::context::RunContext;
use crate::orchestration::service::call_with_timeout;
use crate::pipeline::calculation::{calculate, resolve_values};
use crate::pipeline::debate::{resolve_case, ArbiterPolicy, DebateOutcome, DefenseSource};
use crate::pipeline::extraction::{extract_record, parse_with_repair};
use crate::pipeline::records::{
    AnalysisResponse, ArbitrationDecision, ArbitrationReport, CalculationReport, CaseMember,
    DebateRound, Defense, DivergenceCase, DivergenceReport, ExtractionBatch, ExtractionOutcome,
    GateDecision, QualityGateVerdict, Resolution,
};
use crate::pipeline::synthesis::{synthesize, Upstream};
use crate::pipeline::{divergence, quality};
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A completed dependency as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyArtifact {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub artifact_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        artifact_hash: Option<String>,
    },
    /// Stopped by run cancellation. Any paid-for output is kept.
    Cancelled {
        artifact_hash: Option<String>,
        reason: String,
    },
    /// A quality gate decided to stop the run.
    Terminate {
        artifact_hash: String,
        reason: String,
    },
}

/// Issue an external call at most once per `key` across restarts.
///
/// A checkpoint holding a response (completed, or cancelled with an
/// artifact) is reused without calling the service. Otherwise the call is
/// retried per the run's policy and its response persisted through
/// `envelope` before this returns.
pub async fn persisted_call<F>(
    ctx: &RunContext,
    key: &str,
    agent_id: &str,
    payload: &str,
    params: &Value,
    envelope: F,
) -> Result<String>
where
    F: FnOnce(String) -> Result<Vec<u8>>,
{
    if let Some(existing) = ctx.checkpoints.get(key)? {
        match (existing.status, existing.artifact_hash) {
            (CheckpointStatus::Completed, Some(hash)) => {
                debug!(key, "reusing checkpointed response");
                return Ok(hash);
            }
            (CheckpointStatus::Cancelled, Some(hash)) => {
                debug!(key, "reusing response checkpointed during cancellation");
                if !ctx.is_cancelled() {
                    ctx.checkpoints
                        .put(CheckpointRecord::completed(key, Some(hash.clone())))?;
                }
                return Ok(hash);
            }
            _ => {}
        }
    }

    let inputs_hash = content_hash(
        json!({ "agent_id": agent_id, "payload": payload, "params": params })
            .to_string()
            .as_bytes(),
    );
    ctx.record(ChronologEvent::Intent {
        key: key.to_string(),
        inputs_hash,
    })
    .await?;

    let timeout = ctx.config.service.timeout();
    let raw = ctx
        .retry
        .execute(|attempt| async move {
            ctx.charge_call()?;
            match call_with_timeout(ctx.service.as_ref(), timeout, agent_id, payload, params).await
            {
                Ok(raw) => Ok(raw),
                Err(e) => {
                    let err = Error::from(e);
                    warn!(key, attempt, error = %err, "external call failed");
                    ctx.record(ChronologEvent::CallFailed {
                        key: key.to_string(),
                        attempt,
                        error: err.to_string(),
                        transient: err.is_transient(),
                    })
                    .await?;
                    Err(err)
                }
            }
        })
        .await?;

    let hash = ctx.artifacts.put(&envelope(raw)?)?;
    ctx.record(ChronologEvent::ResponseReceived {
        key: key.to_string(),
        artifact_hash: hash.clone(),
    })
    .await?;
    let record = match ctx.cancel_reason() {
        Some(reason) if ctx.is_cancelled() => {
            CheckpointRecord::cancelled(key, Some(hash.clone()), reason)
        }
        _ => CheckpointRecord::completed(key, Some(hash.clone())),
    };
    ctx.checkpoints.put(record)?;
    Ok(hash)
}

/// Run one task to an outcome.
pub async fn run_task(
    ctx: Arc<RunContext>,
    task_id: TaskId,
    config: TaskConfig,
    deps: Vec<DependencyArtifact>,
) -> Result<TaskOutcome> {
    debug!(task_id = task_id.as_str(), "handler started");
    match config {
        TaskConfig::Analyze(cfg) => analyze(&ctx, &task_id, cfg).await,
        TaskConfig::Extract(cfg) => extract(&ctx, &task_id, cfg, &deps).await,
        TaskConfig::QualityGate(cfg) => quality_gate(&ctx, &task_id, cfg, &deps).await,
        TaskConfig::Divergence(cfg) => detect_divergence(&ctx, &task_id, cfg, &deps).await,
        TaskConfig::Arbitrate(cfg) => arbitrate(&ctx, &task_id, cfg, &deps).await,
        TaskConfig::Calculate(cfg) => calculation(&ctx, &cfg, &deps),
        TaskConfig::Synthesize => synthesis(&ctx, &deps),
    }
}

/// Decode every dependency artifact of type `task_type`, ordered by task id.
fn load_deps<T: DeserializeOwned>(
    ctx: &RunContext,
    deps: &[DependencyArtifact],
    task_type: TaskType,
) -> Result<Vec<T>> {
    let mut matching: Vec<&DependencyArtifact> = deps
        .iter()
        .filter(|d| d.task_type == task_type)
        .collect();
    matching.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    matching
        .into_iter()
        .filter_map(|d| d.artifact_hash.as_deref())
        .map(|hash| get_json(ctx.artifacts.as_ref(), hash))
        .collect()
}

fn completed(artifact_hash: String) -> Result<TaskOutcome> {
    Ok(TaskOutcome::Completed {
        artifact_hash: Some(artifact_hash),
    })
}

// ========== Analyze ==========

async fn analyze(ctx: &RunContext, task_id: &TaskId, cfg: AnalyzeConfig) -> Result<TaskOutcome> {
    let AnalyzeConfig {
        input_id,
        agent_id,
        input_text,
        params,
    } = cfg;
    let hash = persisted_call(
        ctx,
        task_id.as_str(),
        &agent_id,
        &input_text,
        &params,
        |raw_text| {
            Ok(serde_json::to_vec(&AnalysisResponse {
                input_id: input_id.clone(),
                agent_id: agent_id.clone(),
                input_text: input_text.clone(),
                raw_text,
            })?)
        },
    )
    .await?;
    completed(hash)
}

// ========== Extract ==========

async fn extract(
    ctx: &RunContext,
    task_id: &TaskId,
    cfg: ExtractConfig,
    deps: &[DependencyArtifact],
) -> Result<TaskOutcome> {
    let max_attempts = cfg
        .max_repair_attempts
        .unwrap_or(ctx.config.extraction.max_repair_attempts);
    let mut responses: Vec<AnalysisResponse> = load_deps(ctx, deps, TaskType::Analyze)?;
    responses.sort_by(|a, b| (&a.input_id, &a.agent_id).cmp(&(&b.input_id, &b.agent_id)));

    let mut outcomes = Vec::with_capacity(responses.len());
    let mut inputs = BTreeMap::new();
    for response in responses {
        let outcome = extract_record(
            &response.raw_text,
            &response.input_id,
            &response.agent_id,
            ctx.repair.as_ref(),
            max_attempts,
        );
        let event = match &outcome {
            ExtractionOutcome::Record {
                record,
                repair_attempts,
            } => ChronologEvent::ItemExtracted {
                task_id: task_id.to_string(),
                input_id: record.input_id.clone(),
                agent_id: record.agent_id.clone(),
                repair_attempts: *repair_attempts,
            },
            ExtractionOutcome::FailedItem {
                input_id,
                agent_id,
                error,
                repair_attempts,
            } => ChronologEvent::ItemFailed {
                task_id: task_id.to_string(),
                input_id: input_id.clone(),
                agent_id: agent_id.clone(),
                error: error.clone(),
                repair_attempts: *repair_attempts,
            },
        };
        ctx.record(event).await?;
        inputs.insert(response.input_id, response.input_text);
        outcomes.push(outcome);
    }

    let batch = ExtractionBatch {
        batch_id: task_id.to_string(),
        outcomes,
        inputs,
    };
    info!(
        task_id = task_id.as_str(),
        total = batch.outcomes.len(),
        failed = batch.failed_count(),
        "extraction finished"
    );
    completed(put_json(ctx.artifacts.as_ref(), &batch)?)
}

// ========== Quality Gate ==========

async fn quality_gate(
    ctx: &RunContext,
    task_id: &TaskId,
    cfg: QualityGateConfig,
    deps: &[DependencyArtifact],
) -> Result<TaskOutcome> {
    let threshold = cfg.threshold.unwrap_or(ctx.config.quality.threshold);
    let batches: Vec<ExtractionBatch> = load_deps(ctx, deps, TaskType::Extract)?;
    let total = batches.iter().map(|b| b.outcomes.len()).sum();
    let failed = batches.iter().map(|b| b.failed_count()).sum();
    let batch_id = batches
        .iter()
        .map(|b| b.batch_id.as_str())
        .collect::<Vec<_>>()
        .join("+");

    let verdict = quality::evaluate(&batch_id, total, failed, threshold);
    let hash = put_json(ctx.artifacts.as_ref(), &verdict)?;
    ctx.record(ChronologEvent::QualityVerdict {
        task_id: task_id.to_string(),
        batch_id: verdict.batch_id.clone(),
        decision: verdict.decision.to_string(),
        reason: verdict.reason.clone(),
    })
    .await?;
    info!(
        task_id = task_id.as_str(),
        decision = %verdict.decision,
        reason = verdict.reason.as_str(),
        "quality verdict"
    );

    match verdict.decision {
        GateDecision::Continue => completed(hash),
        GateDecision::Terminate => Ok(TaskOutcome::Terminate {
            artifact_hash: hash,
            reason: verdict.reason,
        }),
    }
}

// ========== Divergence ==========

async fn detect_divergence(
    ctx: &RunContext,
    task_id: &TaskId,
    cfg: DivergenceTaskConfig,
    deps: &[DependencyArtifact],
) -> Result<TaskOutcome> {
    let batches: Vec<ExtractionBatch> = load_deps(ctx, deps, TaskType::Extract)?;
    let defaults = &ctx.config.divergence;
    let fallback = cfg.default_tolerance.unwrap_or(defaults.default_tolerance);
    let tolerance_for = |dimension: &str| {
        cfg.tolerances
            .get(dimension)
            .or_else(|| defaults.tolerances.get(dimension))
            .copied()
            .unwrap_or(fallback)
    };

    let cases = divergence::detect(batches.iter().flat_map(|b| b.records()), tolerance_for);
    for case in &cases {
        ctx.record(ChronologEvent::DivergenceDetected {
            task_id: task_id.to_string(),
            case_id: case.case_id.clone(),
            dimension: case.dimension.clone(),
            spread: case.spread,
            records: case.members.len(),
        })
        .await?;
    }
    info!(task_id = task_id.as_str(), cases = cases.len(), "divergence detection finished");

    let inputs = batches
        .into_iter()
        .flat_map(|b| b.inputs.into_iter())
        .collect();
    completed(put_json(
        ctx.artifacts.as_ref(),
        &DivergenceReport { cases, inputs },
    )?)
}

// ========== Arbitrate ==========

#[derive(Deserialize)]
struct RawDefense {
    value: f64,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    rationale: String,
}

/// Obtains defenses from the analysis service under write-ahead keys.
struct ServiceDefenseSource<'a> {
    ctx: &'a RunContext,
    task_id: &'a TaskId,
    input_text: &'a str,
}

impl ServiceDefenseSource<'_> {
    fn key(&self, case: &DivergenceCase, round: u32, agent_id: &str) -> String {
        format!("{}/{}/r{}/{}", self.task_id, case.case_id, round, agent_id)
    }
}

#[async_trait]
impl<'a> DefenseSource for ServiceDefenseSource<'a> {
    fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    async fn defend(
        &self,
        case: &DivergenceCase,
        member: &CaseMember,
        round: u32,
        peer_values: &[f64],
    ) -> Result<Defense> {
        let payload = json!({
            "task": "defend",
            "case_id": case.case_id,
            "input_id": case.input_id,
            "dimension": case.dimension,
            "round": round,
            "own_value": member.score,
            "own_evidence": member.evidence,
            "peer_values": peer_values,
            "input_text": self.input_text,
        })
        .to_string();
        let key = self.key(case, round, &member.agent_id);
        let hash = persisted_call(
            self.ctx,
            &key,
            &member.agent_id,
            &payload,
            &json!({ "mode": "defense" }),
            |raw| Ok(raw.into_bytes()),
        )
        .await?;

        let bytes = self.ctx.artifacts.get(&hash)?;
        let raw = String::from_utf8_lossy(&bytes);
        let max_attempts = self.ctx.config.extraction.max_repair_attempts;
        match parse_with_repair::<RawDefense>(&raw, self.ctx.repair.as_ref(), max_attempts) {
            Ok((parsed, _)) => Ok(Defense {
                agent_id: member.agent_id.clone(),
                value: parsed.value,
                citations: parsed.citations,
                rationale: parsed.rationale,
            }),
            Err((e, attempts)) => {
                warn!(key = key.as_str(), attempts, error = %e, "unparseable defense");
                Ok(Defense {
                    agent_id: member.agent_id.clone(),
                    value: member.score,
                    citations: Vec::new(),
                    rationale: "unparseable defense; original score re-asserted".to_string(),
                })
            }
        }
    }

    async fn round_completed(&self, case: &DivergenceCase, round: &DebateRound) -> Result<()> {
        self.ctx
            .record(ChronologEvent::DebateRoundCompleted {
                task_id: self.task_id.to_string(),
                case_id: case.case_id.clone(),
                round: round.round,
                defenses: round.defenses.len(),
            })
            .await
    }
}

fn policy_for(ctx: &RunContext, cfg: &ArbitrateConfig, dimension: &str) -> ArbiterPolicy {
    let debate = &ctx.config.debate;
    ArbiterPolicy {
        max_rounds: cfg.max_rounds.unwrap_or(debate.max_rounds),
        margin: cfg.margin.unwrap_or(debate.margin),
        min_score: cfg.min_score.unwrap_or(debate.min_score),
        calibration: cfg.calibration.get(dimension).copied(),
        bounds: cfg.bounds.get(dimension).copied().unwrap_or([0.0, 1.0]),
    }
}

async fn arbitrate(
    ctx: &RunContext,
    task_id: &TaskId,
    cfg: ArbitrateConfig,
    deps: &[DependencyArtifact],
) -> Result<TaskOutcome> {
    let reports: Vec<DivergenceReport> = load_deps(ctx, deps, TaskType::Divergence)?;
    let mut cases: Vec<(&DivergenceCase, &str)> = Vec::new();
    for report in &reports {
        for case in &report.cases {
            let input_text = report
                .inputs
                .get(&case.input_id)
                .map(String::as_str)
                .unwrap_or("");
            cases.push((case, input_text));
        }
    }

    // Cases are independent; rounds within a case are sequential.
    let debates = cases.iter().map(|(case, input_text)| {
        let cfg = &cfg;
        async move {
            let policy = policy_for(ctx, cfg, &case.dimension);
            let source = ServiceDefenseSource {
                ctx,
                task_id,
                input_text,
            };
            resolve_case(case, &policy, input_text, &source).await
        }
    });
    let outcomes = join_all(debates)
        .await
        .into_iter()
        .collect::<Result<Vec<DebateOutcome>>>()?;

    let mut decisions: Vec<ArbitrationDecision> = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            DebateOutcome::Decided(decision) => decisions.push(decision),
            DebateOutcome::Cancelled => {
                return Ok(TaskOutcome::Cancelled {
                    artifact_hash: None,
                    reason: ctx.cancel_reason().unwrap_or("run cancelled").to_string(),
                });
            }
        }
    }

    for decision in &decisions {
        let event = match decision.resolution {
            Resolution::Winner => ChronologEvent::ArbitrationDecided {
                task_id: task_id.to_string(),
                case_id: decision.divergence_case_id.clone(),
                winning_value: decision.winning_value,
                confidence: decision.confidence.to_string(),
            },
            Resolution::MedianFallback => ChronologEvent::ArbitrationFallback {
                task_id: task_id.to_string(),
                case_id: decision.divergence_case_id.clone(),
                value: decision.winning_value,
                rounds: decision.rounds.len() as u32,
            },
        };
        ctx.record(event).await?;
    }
    completed(put_json(ctx.artifacts.as_ref(), &ArbitrationReport { decisions })?)
}

// ========== Calculate ==========

fn calculation(
    ctx: &RunContext,
    cfg: &CalculateConfig,
    deps: &[DependencyArtifact],
) -> Result<TaskOutcome> {
    let batches: Vec<ExtractionBatch> = load_deps(ctx, deps, TaskType::Extract)?;
    let arbitrations: Vec<ArbitrationReport> = load_deps(ctx, deps, TaskType::Arbitrate)?;
    let decisions: Vec<ArbitrationDecision> = arbitrations
        .into_iter()
        .flat_map(|r| r.decisions.into_iter())
        .collect();
    let resolved = resolve_values(batches.iter().flat_map(|b| b.records()), &decisions);
    let report: CalculationReport = calculate(&cfg.formulas, resolved)?;
    completed(put_json(ctx.artifacts.as_ref(), &report)?)
}

// ========== Synthesize ==========

fn synthesis(ctx: &RunContext, deps: &[DependencyArtifact]) -> Result<TaskOutcome> {
    let mut sorted: Vec<&DependencyArtifact> = deps.iter().collect();
    sorted.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    let mut upstream = Vec::with_capacity(sorted.len());
    for dep in sorted {
        let Some(hash) = dep.artifact_hash.as_deref() else {
            continue;
        };
        let store = ctx.artifacts.as_ref();
        let artifact = match dep.task_type {
            TaskType::Extract => Upstream::Extraction(get_json(store, hash)?),
            TaskType::QualityGate => {
                Upstream::Verdict(get_json::<QualityGateVerdict>(store, hash)?)
            }
            TaskType::Divergence => Upstream::Divergence(get_json(store, hash)?),
            TaskType::Arbitrate => Upstream::Arbitration(get_json(store, hash)?),
            TaskType::Calculate => Upstream::Calculation(get_json(store, hash)?),
            TaskType::Analyze | TaskType::Synthesize => Upstream::Opaque,
        };
        upstream.push((dep.task_id.to_string(), hash.to_string(), artifact));
    }

    let report = synthesize(&ctx.run_id, &upstream);
    completed(put_json(ctx.artifacts.as_ref(), &report)?)
}
