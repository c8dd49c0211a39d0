//! Batch-level quality gate.

use crate::pipeline::records::{GateDecision, QualityGateVerdict};

/// Decide whether a batch is good enough to continue.
///
/// `total` counts every extraction outcome in the batch, `failed` the
/// FAILED_ITEMs among them. A ratio strictly above `threshold` terminates the
/// run, as does an empty batch.
pub fn evaluate(batch_id: &str, total: usize, failed: usize, threshold: f64) -> QualityGateVerdict {
    let (decision, reason) = if total == 0 {
        (GateDecision::Terminate, "no analysis results".to_string())
    } else {
        let ratio = failed as f64 / total as f64;
        if ratio > threshold {
            (
                GateDecision::Terminate,
                format!(
                    "failed item ratio {:.2} ({}/{}) exceeds threshold {:.2}",
                    ratio, failed, total, threshold
                ),
            )
        } else {
            (
                GateDecision::Continue,
                format!(
                    "failed item ratio {:.2} ({}/{}) within threshold {:.2}",
                    ratio, failed, total, threshold
                ),
            )
        }
    };
    QualityGateVerdict {
        batch_id: batch_id.to_string(),
        decision,
        reason,
        total,
        failed,
    }
}
