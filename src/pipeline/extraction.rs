//! Parsing raw service output into typed records, with bounded repair.
//!
//! Each raw response is parsed on its own. When parsing fails the raw text
//! is passed through a [`Repair`] normalization step and parsed again, up to a
//! configured number of attempts. An item that still does not parse becomes a
//! FAILED_ITEM; the rest of the batch is unaffected.

use crate::error::{Error, Result};
use crate::pipeline::records::{AnalysisRecord, Evidence, ExtractionOutcome};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)```").expect("CODE_FENCE_RE regex should compile")
});

static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r",(\s*[}\]])").expect("TRAILING_COMMA_RE regex should compile")
});

static BARE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("BARE_KEY_RE regex should compile")
});

/// A normalization step applied to raw text between parse attempts.
pub trait Repair: Send + Sync {
    /// Produce a candidate for repair attempt `attempt` (1-based), or `None`
    /// if this repairer has nothing more to try.
    fn repair(&self, raw: &str, attempt: u32) -> Option<String>;
}

/// Text heuristics for the usual ways model output misses valid JSON.
///
/// Attempts are cumulative: attempt 1 strips code fences and isolates the
/// outermost object, attempt 2 also drops trailing commas and quotes bare
/// keys, attempt 3 also converts single quotes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicRepair;

impl HeuristicRepair {
    fn strip_fences(text: &str) -> String {
        match CODE_FENCE_RE.captures(text).and_then(|c| c.get(1)) {
            Some(inner) => inner.as_str().to_string(),
            None => text.to_string(),
        }
    }

    fn outer_object(text: &str) -> String {
        match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => text[start..=end].to_string(),
            _ => text.to_string(),
        }
    }

    fn strip_trailing_commas(text: &str) -> String {
        TRAILING_COMMA_RE.replace_all(text, "$1").into_owned()
    }

    fn quote_bare_keys(text: &str) -> String {
        BARE_KEY_RE.replace_all(text, r#"$1"$2":"#).into_owned()
    }

    fn single_to_double_quotes(text: &str) -> String {
        if text.contains('"') && !text.contains('\'') {
            return text.to_string();
        }
        text.replace('\'', "\"")
    }
}

impl Repair for HeuristicRepair {
    fn repair(&self, raw: &str, attempt: u32) -> Option<String> {
        if attempt == 0 || attempt > 3 {
            return None;
        }
        let mut text = Self::outer_object(&Self::strip_fences(raw.trim()));
        if attempt >= 2 {
            text = Self::quote_bare_keys(&Self::strip_trailing_commas(&text));
        }
        if attempt >= 3 {
            text = Self::single_to_double_quotes(&text);
        }
        Some(text)
    }
}

/// Parse `raw` as JSON `T`, repairing up to `max_attempts` times.
///
/// Returns the value and the number of repair attempts that were needed.
pub fn parse_with_repair<T: DeserializeOwned>(
    raw: &str,
    repair: &dyn Repair,
    max_attempts: u32,
) -> std::result::Result<(T, u32), (Error, u32)> {
    let mut last_error = match serde_json::from_str::<T>(raw) {
        Ok(value) => return Ok((value, 0)),
        Err(e) => e.to_string(),
    };
    for attempt in 1..=max_attempts {
        let Some(candidate) = repair.repair(raw, attempt) else {
            return Err((Error::MalformedOutput(last_error), attempt - 1));
        };
        match serde_json::from_str::<T>(&candidate) {
            Ok(value) => {
                debug!(attempt, "output repaired");
                return Ok((value, attempt));
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err((Error::MalformedOutput(last_error), max_attempts))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EvidenceInput {
    Quote(String),
    Span {
        quote: String,
        #[serde(default)]
        location: Option<String>,
    },
}

/// The JSON shape analysis agents are asked to return.
#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(alias = "scores")]
    dimension_scores: BTreeMap<String, f64>,
    #[serde(default)]
    evidence: Vec<EvidenceInput>,
}

fn validate(raw: RawAnalysis, input_id: &str, agent_id: &str) -> Result<AnalysisRecord> {
    if raw.dimension_scores.is_empty() {
        return Err(Error::MalformedOutput("no dimension scores".into()));
    }
    if let Some((dim, _)) = raw.dimension_scores.iter().find(|(_, v)| !v.is_finite()) {
        return Err(Error::MalformedOutput(format!("score for '{}' is not finite", dim)));
    }
    let evidence = raw
        .evidence
        .into_iter()
        .map(|e| match e {
            EvidenceInput::Quote(quote) => Evidence {
                quote,
                location: None,
            },
            EvidenceInput::Span { quote, location } => Evidence { quote, location },
        })
        .filter(|e| !e.quote.trim().is_empty())
        .collect();
    Ok(AnalysisRecord {
        input_id: input_id.to_string(),
        agent_id: agent_id.to_string(),
        dimension_scores: raw.dimension_scores,
        evidence,
    })
}

/// Normalize one raw analysis response.
pub fn extract_record(
    raw_text: &str,
    input_id: &str,
    agent_id: &str,
    repair: &dyn Repair,
    max_attempts: u32,
) -> ExtractionOutcome {
    let parsed = parse_with_repair::<RawAnalysis>(raw_text, repair, max_attempts)
        .and_then(|(raw, attempts)| {
            validate(raw, input_id, agent_id)
                .map(|record| (record, attempts))
                .map_err(|e| (e, attempts))
        });
    match parsed {
        Ok((record, repair_attempts)) => ExtractionOutcome::Record {
            record,
            repair_attempts,
        },
        Err((error, repair_attempts)) => ExtractionOutcome::FailedItem {
            input_id: input_id.to_string(),
            agent_id: agent_id.to_string(),
            error: error.to_string(),
            repair_attempts,
        },
    }
}
