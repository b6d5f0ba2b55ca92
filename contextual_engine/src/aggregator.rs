//! Combines subsystem contributions into one response and confidence.
//!
//! Confidence is the weighted certainty of the completed contributions over
//! the weight of every eligible subsystem, discounted by the fraction of
//! eligible subsystems that did not complete. A highly ambiguous
//! interpretation discounts only the resolver's own certainty.

use crate::error::FailureClass;
use crate::settings::InterpretationConfig;
use crate::types::{SubsystemInvocation, SubsystemKind};

/// Maximum share of confidence lost when every eligible subsystem fails.
const FAILURE_PENALTY: f64 = 0.25;

pub fn weight(kind: SubsystemKind) -> f64 {
    match kind {
        SubsystemKind::ToolReasoning => 0.35,
        SubsystemKind::Symbolic => 0.2,
        SubsystemKind::Memory => 0.15,
        SubsystemKind::FieldResonance => 0.15,
        SubsystemKind::Interpretation => 0.15,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub success: bool,
    pub response: String,
    /// In `[0, 100]`.
    pub confidence: f64,
    pub components_used: usize,
    pub failure: Option<FailureClass>,
    pub failure_reason: Option<String>,
}

/// Merges `invocations` for the `eligible` subsystems of one cycle.
/// `interrupted` marks a cycle cut short by cancellation or its deadline.
pub fn aggregate(
    eligible: &[SubsystemKind],
    invocations: &[SubsystemInvocation],
    interrupted: bool,
    config: &InterpretationConfig,
) -> Aggregation {
    let mut completed: Vec<&SubsystemInvocation> = invocations
        .iter()
        .filter(|inv| eligible.contains(&inv.kind) && inv.outcome.is_completed())
        .collect();
    completed.sort_by_key(|inv| inv.kind);

    if completed.is_empty() {
        return diagnose(eligible, invocations, interrupted);
    }

    let eligible_weight: f64 = eligible.iter().map(|k| weight(*k)).sum();
    let weighted: f64 = completed
        .iter()
        .filter_map(|inv| inv.outcome.output().map(|out| (inv.kind, out)))
        .map(|(kind, output)| {
            let mut certainty = output.certainty;
            if let Some(ambiguity) = output.ambiguity {
                if ambiguity > config.high_entropy_threshold {
                    certainty *= 1.0 - config.ambiguity_weight * ambiguity.clamp(0.0, 1.0);
                }
            }
            weight(kind) * certainty
        })
        .sum();

    let base = if eligible_weight > 0.0 {
        weighted / eligible_weight
    } else {
        0.0
    };
    let failed_fraction = 1.0 - completed.len() as f64 / eligible.len().max(1) as f64;
    let confidence = (100.0 * base * (1.0 - FAILURE_PENALTY * failed_fraction)).clamp(0.0, 100.0);

    let response = completed
        .iter()
        .filter_map(|inv| {
            inv.outcome
                .output()
                .map(|out| format!("[{}] {}", inv.kind.label(), out.contribution))
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    Aggregation {
        success: true,
        response,
        confidence,
        components_used: completed.len(),
        failure: None,
        failure_reason: None,
    }
}

fn diagnose(
    eligible: &[SubsystemKind],
    invocations: &[SubsystemInvocation],
    interrupted: bool,
) -> Aggregation {
    let reasons = invocations
        .iter()
        .filter_map(|inv| {
            inv.outcome
                .failure()
                .map(|f| format!("{}: {}", inv.kind, f.reason_code()))
        })
        .collect::<Vec<_>>()
        .join(", ");

    let (class, reason) = if interrupted {
        (
            FailureClass::Cancelled,
            "cycle was cancelled before any subsystem completed".to_string(),
        )
    } else if eligible.is_empty() {
        (
            FailureClass::TotalFailure,
            "no subsystem is eligible and enabled for this level".to_string(),
        )
    } else {
        (
            FailureClass::TotalFailure,
            "every eligible subsystem failed".to_string(),
        )
    };

    let response = if reasons.is_empty() {
        format!("No answer produced: {reason}.")
    } else {
        format!("No answer produced: {reason} ({reasons}).")
    };

    Aggregation {
        success: false,
        response,
        confidence: 0.0,
        components_used: 0,
        failure: Some(class),
        failure_reason: Some(reason),
    }
}
