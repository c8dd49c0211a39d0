//! Structured debate and neutral arbitration of divergence cases.
//!
//! Each round, every agent in a case submits a defense: a claimed value and
//! citations quoted from the analyzed input. The [`Arbiter`] only sees
//! [`AnonymousDefense`]s, so agent identity cannot influence the decision.
//! A defense wins when it scores at least `min_score` and leads the runner-up
//! by at least `margin`. If no round produces a winner, the median of the
//! final round's in-bounds values is adopted with low confidence.

use crate::error::Result;
use crate::pipeline::records::{
    ArbitrationDecision, CaseMember, Confidence, DebateRound, Defense, DivergenceCase, Resolution,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const EPSILON: f64 = 1e-9;

/// Quote length, in characters, at which a citation counts as fully specific.
const SPECIFIC_QUOTE_CHARS: f64 = 60.0;

/// Weight of citation specificity when a calibration reference exists.
const SPECIFICITY_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterPolicy {
    pub max_rounds: u32,
    pub margin: f64,
    pub min_score: f64,
    /// Reference value for this dimension, if calibration material exists.
    pub calibration: Option<f64>,
    /// Inclusive valid range for submitted values.
    pub bounds: [f64; 2],
}

impl Default for ArbiterPolicy {
    fn default() -> Self {
        Self {
            max_rounds: crate::config::DEFAULT_MAX_ROUNDS,
            margin: 0.15,
            min_score: 0.3,
            calibration: None,
            bounds: [0.0, 1.0],
        }
    }
}

/// A defense stripped of the submitting agent's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymousDefense {
    pub slot: usize,
    pub value: f64,
    pub citations: Vec<String>,
}

/// Order defenses by value, then citation text, and drop agent ids.
pub fn anonymize(defenses: &[Defense]) -> Vec<AnonymousDefense> {
    let mut sorted: Vec<&Defense> = defenses.iter().collect();
    sorted.sort_by(|a, b| {
        a.value
            .total_cmp(&b.value)
            .then_with(|| a.citations.cmp(&b.citations))
    });
    sorted
        .into_iter()
        .enumerate()
        .map(|(slot, d)| AnonymousDefense {
            slot,
            value: d.value,
            citations: d.citations.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseScore {
    pub slot: usize,
    pub specificity: f64,
    pub calibration: Option<f64>,
    pub in_bounds: bool,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Winner { slot: usize, score: f64, runner_up: f64 },
    NoClearWinner,
}

/// Scores defenses against the analyzed input. Holds no agent information.
pub struct Arbiter<'a> {
    policy: &'a ArbiterPolicy,
    input_text: &'a str,
}

impl<'a> Arbiter<'a> {
    pub fn new(policy: &'a ArbiterPolicy, input_text: &'a str) -> Self {
        Self { policy, input_text }
    }

    fn in_bounds(&self, value: f64) -> bool {
        let [lo, hi] = self.policy.bounds;
        value.is_finite() && value >= lo - EPSILON && value <= hi + EPSILON
    }

    fn is_verified(&self, citation: &str) -> bool {
        let citation = citation.trim();
        !citation.is_empty() && self.input_text.contains(citation)
    }

    /// Citations found verbatim in the input, trimmed, in submitted order.
    pub fn verified_citations(&self, citations: &[String]) -> Vec<String> {
        citations
            .iter()
            .filter(|c| self.is_verified(c))
            .map(|c| c.trim().to_string())
            .collect()
    }

    /// Verified exact spans, weighted by length; unverified citations dilute.
    fn specificity(&self, citations: &[String]) -> f64 {
        if citations.is_empty() {
            return 0.0;
        }
        let verified: f64 = self
            .verified_citations(citations)
            .iter()
            .map(|c| (c.chars().count() as f64 / SPECIFIC_QUOTE_CHARS).min(1.0))
            .sum();
        verified / citations.len() as f64
    }

    fn calibration(&self, value: f64) -> Option<f64> {
        let [lo, hi] = self.policy.bounds;
        let width = (hi - lo).max(EPSILON);
        self.policy
            .calibration
            .map(|reference| 1.0 - ((value - reference).abs() / width).min(1.0))
    }

    pub fn score(&self, defense: &AnonymousDefense) -> DefenseScore {
        let in_bounds = self.in_bounds(defense.value);
        let specificity = self.specificity(&defense.citations);
        let calibration = self.calibration(defense.value);
        let score = if !in_bounds {
            0.0
        } else {
            match calibration {
                Some(c) => SPECIFICITY_WEIGHT * specificity + (1.0 - SPECIFICITY_WEIGHT) * c,
                None => specificity,
            }
        };
        DefenseScore {
            slot: defense.slot,
            specificity,
            calibration,
            in_bounds,
            score,
        }
    }

    pub fn evaluate(&self, defenses: &[AnonymousDefense]) -> (Vec<DefenseScore>, Verdict) {
        let scores: Vec<DefenseScore> = defenses.iter().map(|d| self.score(d)).collect();
        let mut eligible: Vec<&DefenseScore> = scores.iter().filter(|s| s.in_bounds).collect();
        eligible.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.slot.cmp(&b.slot)));

        let verdict = match eligible.as_slice() {
            [] => Verdict::NoClearWinner,
            [best, rest @ ..] => {
                let runner_up = rest.first().map(|s| s.score).unwrap_or(0.0);
                // A winner must rest on at least one verified citation.
                if best.specificity > 0.0
                    && best.score + EPSILON >= self.policy.min_score
                    && best.score - runner_up + EPSILON >= self.policy.margin
                {
                    Verdict::Winner {
                        slot: best.slot,
                        score: best.score,
                        runner_up,
                    }
                } else {
                    Verdict::NoClearWinner
                }
            }
        };
        (scores, verdict)
    }
}

/// Median of `values`; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Supplies defenses for a debate. The production source calls the external
/// analysis service; tests script it.
#[async_trait]
pub trait DefenseSource: Send + Sync {
    /// New rounds are not started once this returns true.
    fn is_cancelled(&self) -> bool;

    /// Obtain `member`'s defense for `round`. `peer_values` are the other
    /// members' latest values, without identities.
    async fn defend(
        &self,
        case: &DivergenceCase,
        member: &CaseMember,
        round: u32,
        peer_values: &[f64],
    ) -> Result<Defense>;

    /// Called once every defense of a round is durable.
    async fn round_completed(&self, case: &DivergenceCase, round: &DebateRound) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebateOutcome {
    Decided(ArbitrationDecision),
    Cancelled,
}

/// Run bounded debate rounds for one case and arbitrate.
pub async fn resolve_case(
    case: &DivergenceCase,
    policy: &ArbiterPolicy,
    input_text: &str,
    source: &dyn DefenseSource,
) -> Result<DebateOutcome> {
    let arbiter = Arbiter::new(policy, input_text);
    let mut latest: Vec<f64> = case.members.iter().map(|m| m.score).collect();
    let mut rounds: Vec<DebateRound> = Vec::new();

    for round in 1..=policy.max_rounds.max(1) {
        if source.is_cancelled() {
            info!(case_id = case.case_id.as_str(), round, "debate stopped by cancellation");
            return Ok(DebateOutcome::Cancelled);
        }

        let requests = case.members.iter().enumerate().map(|(i, member)| {
            let mut peers: Vec<f64> = latest
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, v)| *v)
                .collect();
            peers.sort_by(f64::total_cmp);
            async move { source.defend(case, member, round, &peers).await }
        });
        let defenses = join_all(requests)
            .await
            .into_iter()
            .collect::<Result<Vec<Defense>>>()?;

        let debate_round = DebateRound { round, defenses };
        source.round_completed(case, &debate_round).await?;

        latest = debate_round.defenses.iter().map(|d| d.value).collect();
        let anonymous = anonymize(&debate_round.defenses);
        let (scores, verdict) = arbiter.evaluate(&anonymous);
        debug!(case_id = case.case_id.as_str(), round, ?scores, "round evaluated");
        rounds.push(debate_round);

        if let Verdict::Winner {
            slot,
            score,
            runner_up,
        } = verdict
        {
            let winner = &anonymous[slot];
            let confidence = if score - runner_up >= 2.0 * policy.margin {
                Confidence::High
            } else {
                Confidence::Medium
            };
            info!(
                case_id = case.case_id.as_str(),
                round,
                value = winner.value,
                %confidence,
                "arbitration decided"
            );
            return Ok(DebateOutcome::Decided(ArbitrationDecision {
                divergence_case_id: case.case_id.clone(),
                winning_value: winner.value,
                rationale: format!(
                    "round {}: defense scored {:.3} against runner-up {:.3} on verified citations{}",
                    round,
                    score,
                    runner_up,
                    if policy.calibration.is_some() {
                        " and calibration"
                    } else {
                        ""
                    }
                ),
                cited_evidence: arbiter.verified_citations(&winner.citations),
                confidence,
                resolution: Resolution::Winner,
                synthesized: false,
                rounds,
            }));
        }
    }

    Ok(DebateOutcome::Decided(fallback_decision(case, &arbiter, rounds)))
}

fn fallback_decision(
    case: &DivergenceCase,
    arbiter: &Arbiter<'_>,
    rounds: Vec<DebateRound>,
) -> ArbitrationDecision {
    let final_values: Vec<f64> = rounds
        .last()
        .map(|r| {
            r.defenses
                .iter()
                .map(|d| d.value)
                .filter(|v| arbiter.in_bounds(*v))
                .collect()
        })
        .unwrap_or_default();
    let (value, source) = match median(&final_values) {
        Some(v) => (v, "final-round values"),
        None => {
            let original: Vec<f64> = case.members.iter().map(|m| m.score).collect();
            (median(&original).unwrap_or(0.0), "original scores")
        }
    };
    warn!(
        case_id = case.case_id.as_str(),
        value,
        rounds = rounds.len(),
        "no clear winner, using median fallback"
    );
    ArbitrationDecision {
        divergence_case_id: case.case_id.clone(),
        winning_value: value,
        rationale: format!(
            "no defense dominated after {} round(s); median of {}",
            rounds.len(),
            source
        ),
        cited_evidence: Vec::new(),
        confidence: Confidence::Low,
        resolution: Resolution::MedianFallback,
        synthesized: true,
        rounds,
    }
}
