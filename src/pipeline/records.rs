//! Typed records that flow between pipeline stages.
//!
//! Every stage reads its inputs from artifacts and writes exactly one
//! artifact. The types here are those artifacts' JSON shapes. Maps are
//! `BTreeMap` so the serialized bytes, and therefore the content hashes, are
//! deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted response of one external analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub input_id: String,
    pub agent_id: String,
    pub input_text: String,
    /// Exactly what the service returned. No assumption of well-formedness.
    pub raw_text: String,
}

/// A span quoted from the analyzed input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Evidence {
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One agent's analysis of one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub input_id: String,
    pub agent_id: String,
    pub dimension_scores: BTreeMap<String, f64>,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Record {
        record: AnalysisRecord,
        repair_attempts: u32,
    },
    /// Could not be parsed even after repair; excluded from aggregates.
    FailedItem {
        input_id: String,
        agent_id: String,
        error: String,
        repair_attempts: u32,
    },
}

impl ExtractionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ExtractionOutcome::FailedItem { .. })
    }

    pub fn record(&self) -> Option<&AnalysisRecord> {
        match self {
            ExtractionOutcome::Record { record, .. } => Some(record),
            ExtractionOutcome::FailedItem { .. } => None,
        }
    }
}

/// Output of an extract task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionBatch {
    pub batch_id: String,
    pub outcomes: Vec<ExtractionOutcome>,
    /// Analyzed text per input, used to verify debate citations.
    pub inputs: BTreeMap<String, String>,
}

impl ExtractionBatch {
    pub fn records(&self) -> impl Iterator<Item = &AnalysisRecord> {
        self.outcomes.iter().filter_map(ExtractionOutcome::record)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    Continue,
    Terminate,
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateDecision::Continue => write!(f, "CONTINUE"),
            GateDecision::Terminate => write!(f, "TERMINATE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateVerdict {
    pub batch_id: String,
    pub decision: GateDecision,
    pub reason: String,
    pub total: usize,
    pub failed: usize,
}

/// One AnalysisRecord's position in a divergence case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMember {
    pub agent_id: String,
    pub score: f64,
    pub evidence: Vec<Evidence>,
}

/// Disagreement on one dimension of one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceCase {
    /// `<input_id>:<dimension>`
    pub case_id: String,
    pub input_id: String,
    pub dimension: String,
    pub spread: f64,
    pub tolerance: f64,
    /// Always at least two members, ordered by score.
    pub members: Vec<CaseMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub cases: Vec<DivergenceCase>,
    pub inputs: BTreeMap<String, String>,
}

/// A defense submitted by one agent in one debate round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defense {
    pub agent_id: String,
    pub value: f64,
    pub citations: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateRound {
    pub round: u32,
    pub defenses: Vec<Defense>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A defense dominated and its value was adopted.
    Winner,
    /// No defense dominated; the median of the final round was used.
    MedianFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationDecision {
    pub divergence_case_id: String,
    pub winning_value: f64,
    pub rationale: String,
    /// Citations of the winning defense. Empty for a synthesized value.
    pub cited_evidence: Vec<String>,
    pub confidence: Confidence,
    pub resolution: Resolution,
    /// True when the value was aggregated rather than taken from a defense.
    pub synthesized: bool,
    pub rounds: Vec<DebateRound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationReport {
    pub decisions: Vec<ArbitrationDecision>,
}

/// Resolved and derived values for every input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationReport {
    pub resolved: BTreeMap<String, BTreeMap<String, f64>>,
    pub derived: BTreeMap<String, BTreeMap<String, f64>>,
}
