//! Divergence detection across an ensemble of analyses.
//!
//! For every input analyzed by at least two agents, and for every dimension
//! they scored, the spread `max - min` is compared with the dimension's
//! tolerance. A spread strictly greater than the tolerance opens a
//! [`DivergenceCase`] that includes every record within one tolerance of
//! either extreme, so a close contender is never dropped arbitrarily.

use crate::pipeline::records::{AnalysisRecord, CaseMember, DivergenceCase};
use std::collections::BTreeMap;

/// Absorbs float noise such as `0.5 - 0.2 = 0.30000000000000004`.
const EPSILON: f64 = 1e-9;

/// Unique because plan validation keeps `:` out of input ids.
pub fn case_id(input_id: &str, dimension: &str) -> String {
    format!("{}:{}", input_id, dimension)
}

/// Find every divergence among `records`.
///
/// `tolerance_for` maps a dimension name to its tolerance. Cases are ordered
/// by input id, then dimension.
pub fn detect<'a, I, F>(records: I, tolerance_for: F) -> Vec<DivergenceCase>
where
    I: IntoIterator<Item = &'a AnalysisRecord>,
    F: Fn(&str) -> f64,
{
    let mut by_input: BTreeMap<&str, Vec<&AnalysisRecord>> = BTreeMap::new();
    for record in records {
        by_input.entry(record.input_id.as_str()).or_default().push(record);
    }

    let mut cases = Vec::new();
    for (input_id, group) in by_input {
        let mut by_dimension: BTreeMap<&str, Vec<&AnalysisRecord>> = BTreeMap::new();
        for record in group {
            for dimension in record.dimension_scores.keys() {
                by_dimension.entry(dimension.as_str()).or_default().push(record);
            }
        }
        for (dimension, scored) in by_dimension {
            if let Some(case) = detect_dimension(input_id, dimension, &scored, tolerance_for(dimension)) {
                cases.push(case);
            }
        }
    }
    cases
}

fn detect_dimension(
    input_id: &str,
    dimension: &str,
    records: &[&AnalysisRecord],
    tolerance: f64,
) -> Option<DivergenceCase> {
    if records.len() < 2 {
        return None;
    }
    let scores: Vec<f64> = records
        .iter()
        .filter_map(|r| r.dimension_scores.get(dimension).copied())
        .collect();
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let spread = max - min;
    if spread <= tolerance + EPSILON {
        return None;
    }

    let mut members: Vec<CaseMember> = records
        .iter()
        .filter_map(|r| {
            let score = *r.dimension_scores.get(dimension)?;
            let near_low = score <= min + tolerance + EPSILON;
            let near_high = score >= max - tolerance - EPSILON;
            (near_low || near_high).then(|| CaseMember {
                agent_id: r.agent_id.clone(),
                score,
                evidence: r.evidence.clone(),
            })
        })
        .collect();
    members.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.agent_id.cmp(&b.agent_id)));

    Some(DivergenceCase {
        case_id: case_id(input_id, dimension),
        input_id: input_id.to_string(),
        dimension: dimension.to_string(),
        spread,
        tolerance,
        members,
    })
}
