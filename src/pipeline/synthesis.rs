//! Final aggregation of a run's artifacts into one report.

use crate::pipeline::calculation::resolve_values;
use crate::pipeline::records::{
    ArbitrationDecision, ArbitrationReport, CalculationReport, Confidence, DivergenceReport,
    ExtractionBatch, ExtractionOutcome, QualityGateVerdict, Resolution,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A decoded artifact of a completed dependency.
#[derive(Debug, Clone)]
pub enum Upstream {
    Extraction(ExtractionBatch),
    Verdict(QualityGateVerdict),
    Divergence(DivergenceReport),
    Arbitration(ArbitrationReport),
    Calculation(CalculationReport),
    /// Referenced by hash only.
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitratedValue {
    pub winning_value: f64,
    pub confidence: Confidence,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputSummary {
    pub agents: Vec<String>,
    pub values: BTreeMap<String, f64>,
    pub derived: BTreeMap<String, f64>,
    pub arbitrated: BTreeMap<String, ArbitratedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItemSummary {
    pub input_id: String,
    pub agent_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisReport {
    pub run_id: String,
    /// Artifact hash of every dependency, by task id.
    pub sources: BTreeMap<String, String>,
    pub quality: Vec<QualityGateVerdict>,
    pub inputs: BTreeMap<String, InputSummary>,
    pub failed_items: Vec<FailedItemSummary>,
    /// Case ids resolved by fallback rather than by a winning defense.
    pub low_confidence: Vec<String>,
}

/// Build the final report. Output depends only on the arguments.
pub fn synthesize(run_id: &str, upstream: &[(String, String, Upstream)]) -> SynthesisReport {
    let mut sources = BTreeMap::new();
    let mut batches = Vec::new();
    let mut quality = Vec::new();
    let mut decisions: Vec<&ArbitrationDecision> = Vec::new();
    let mut divergent: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut calculations = Vec::new();

    for (task_id, hash, artifact) in upstream {
        sources.insert(task_id.clone(), hash.clone());
        match artifact {
            Upstream::Extraction(batch) => batches.push(batch),
            Upstream::Verdict(verdict) => quality.push(verdict.clone()),
            Upstream::Divergence(report) => {
                for case in &report.cases {
                    divergent.insert(
                        case.case_id.clone(),
                        (case.input_id.clone(), case.dimension.clone()),
                    );
                }
            }
            Upstream::Arbitration(report) => decisions.extend(report.decisions.iter()),
            Upstream::Calculation(report) => calculations.push(report),
            Upstream::Opaque => {}
        }
    }
    quality.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
    decisions.sort_by(|a, b| a.divergence_case_id.cmp(&b.divergence_case_id));

    let mut inputs: BTreeMap<String, InputSummary> = BTreeMap::new();
    let mut agents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut failed_items = Vec::new();
    for batch in &batches {
        for outcome in &batch.outcomes {
            match outcome {
                ExtractionOutcome::Record { record, .. } => {
                    agents
                        .entry(record.input_id.clone())
                        .or_default()
                        .insert(record.agent_id.clone());
                }
                ExtractionOutcome::FailedItem {
                    input_id,
                    agent_id,
                    error,
                    ..
                } => failed_items.push(FailedItemSummary {
                    input_id: input_id.clone(),
                    agent_id: agent_id.clone(),
                    error: error.clone(),
                }),
            }
        }
    }
    failed_items.sort_by(|a, b| (&a.input_id, &a.agent_id).cmp(&(&b.input_id, &b.agent_id)));

    let owned_decisions: Vec<ArbitrationDecision> = decisions.iter().map(|d| (*d).clone()).collect();
    let resolved = resolve_values(batches.iter().flat_map(|b| b.records()), &owned_decisions);
    for (input_id, values) in resolved {
        inputs.entry(input_id).or_default().values = values;
    }
    for report in &calculations {
        for (input_id, derived) in &report.derived {
            inputs
                .entry(input_id.clone())
                .or_default()
                .derived
                .extend(derived.iter().map(|(k, v)| (k.clone(), *v)));
        }
    }
    for (input_id, names) in agents {
        inputs.entry(input_id).or_default().agents = names.into_iter().collect();
    }

    let mut low_confidence = Vec::new();
    for decision in &decisions {
        if decision.confidence == Confidence::Low {
            low_confidence.push(decision.divergence_case_id.clone());
        }
        let Some((input_id, dimension)) = divergent.get(&decision.divergence_case_id) else {
            continue;
        };
        inputs.entry(input_id.clone()).or_default().arbitrated.insert(
            dimension.clone(),
            ArbitratedValue {
                winning_value: decision.winning_value,
                confidence: decision.confidence,
                resolution: decision.resolution,
            },
        );
    }

    SynthesisReport {
        run_id: run_id.to_string(),
        sources,
        quality,
        inputs,
        failed_items,
        low_confidence,
    }
}
