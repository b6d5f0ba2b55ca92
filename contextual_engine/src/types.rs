//! Core data model shared by the orchestrator, the assessor and the subsystems.

use crate::capability::CapabilityOutput;
use crate::error::{FailureClass, SubsystemFailure};
use crate::interpretation::InterpretationSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Free-form context attached to a query (domain, constraints, prior turns).
pub type Context = serde_json::Map<String, serde_json::Value>;

/// A query accepted for one reasoning cycle. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default)]
    pub context: Context,
}

impl Query {
    pub fn new(text: impl Into<String>, context: Context) -> Self {
        Self {
            text: text.into(),
            context,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// The `domain` context key, lowercased.
    pub fn domain(&self) -> Option<String> {
        self.context
            .get("domain")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_lowercase())
    }
}

/// Processing depth, ordered from shallowest to deepest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Atom,
    Molecule,
    Cell,
    Organ,
    NeuralSystem,
    NeuralField,
}

impl ComplexityLevel {
    pub const ALL: [ComplexityLevel; 6] = [
        Self::Atom,
        Self::Molecule,
        Self::Cell,
        Self::Organ,
        Self::NeuralSystem,
        Self::NeuralField,
    ];

    /// Zero-based depth.
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Maps an assessment score onto a level using fixed thresholds.
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            Self::Atom
        } else if score < 0.35 {
            Self::Molecule
        } else if score < 0.5 {
            Self::Cell
        } else if score < 0.65 {
            Self::Organ
        } else if score < 0.8 {
            Self::NeuralSystem
        } else {
            Self::NeuralField
        }
    }

    /// Next deeper level, saturating at `NeuralField`.
    pub fn escalate(self) -> Self {
        Self::ALL[(self.rank() + 1).min(Self::ALL.len() - 1)]
    }

    /// Subsystems this level makes eligible, in canonical order.
    pub fn eligible(self) -> &'static [SubsystemKind] {
        use SubsystemKind::*;
        match self {
            Self::Atom => &[ToolReasoning],
            Self::Molecule => &[ToolReasoning, Memory],
            Self::Cell => &[ToolReasoning, Memory, Symbolic],
            Self::Organ => &[ToolReasoning, Memory, Symbolic, Interpretation],
            Self::NeuralSystem | Self::NeuralField => {
                &[ToolReasoning, Memory, FieldResonance, Symbolic, Interpretation]
            }
        }
    }

    pub fn is_eligible(self, kind: SubsystemKind) -> bool {
        self.eligible().contains(&kind)
    }

    /// Per-subsystem iteration/depth cap.
    pub fn iteration_cap(self) -> usize {
        self.rank() + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Atom => "atom",
            Self::Molecule => "molecule",
            Self::Cell => "cell",
            Self::Organ => "organ",
            Self::NeuralSystem => "neural_system",
            Self::NeuralField => "neural_field",
        }
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplexityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == wanted)
            .ok_or_else(|| format!("unknown complexity level '{s}'"))
    }
}

/// The cooperating reasoning subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    ToolReasoning,
    Memory,
    FieldResonance,
    Symbolic,
    Interpretation,
}

impl SubsystemKind {
    pub const ALL: [SubsystemKind; 5] = [
        Self::ToolReasoning,
        Self::Memory,
        Self::FieldResonance,
        Self::Symbolic,
        Self::Interpretation,
    ];

    /// Whether this subsystem consumes the tool reasoner's representation.
    pub fn depends_on_tools(self) -> bool {
        matches!(self, Self::Symbolic | Self::Interpretation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolReasoning => "tool_reasoning",
            Self::Memory => "memory",
            Self::FieldResonance => "field_resonance",
            Self::Symbolic => "symbolic",
            Self::Interpretation => "interpretation",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ToolReasoning => "Structured reasoning",
            Self::Memory => "Memory recall",
            Self::FieldResonance => "Field resonance",
            Self::Symbolic => "Symbolic abstraction",
            Self::Interpretation => "Interpretation",
        }
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubsystemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown subsystem '{s}'"))
    }
}

/// Caller options for a single cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningOptions {
    #[serde(default)]
    pub task_type: Option<String>,
    /// Forces the level instead of asking the assessor.
    #[serde(default)]
    pub complexity_preference: Option<ComplexityLevel>,
}

/// Result or failure of one subsystem call.
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    Completed(CapabilityOutput),
    Failed(SubsystemFailure),
}

impl InvocationOutcome {
    pub fn output(&self) -> Option<&CapabilityOutput> {
        match self {
            Self::Completed(output) => Some(output),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SubsystemFailure> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Record of one subsystem call, owned by its cycle.
#[derive(Debug, Clone)]
pub struct SubsystemInvocation {
    pub kind: SubsystemKind,
    pub name: String,
    pub input: serde_json::Value,
    pub outcome: InvocationOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl SubsystemInvocation {
    /// Human-readable trace line for this invocation.
    pub fn describe(&self) -> String {
        match &self.outcome {
            InvocationOutcome::Completed(output) => format!(
                "{} ({}) completed with certainty {:.2}: {}",
                self.kind.label(),
                self.name,
                output.certainty,
                output.summary
            ),
            InvocationOutcome::Failed(failure) => format!(
                "{} ({}) failed [{}]: {}",
                self.kind.label(),
                self.name,
                failure.reason_code(),
                failure
            ),
        }
    }
}

/// One step of the reasoning trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTraceEntry {
    pub step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<SubsystemKind>,
    pub status: StepStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

impl ReasoningTraceEntry {
    pub fn from_invocation(step: usize, invocation: &SubsystemInvocation) -> Self {
        Self {
            step,
            component: Some(invocation.kind),
            status: if invocation.outcome.is_completed() {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            message: invocation.describe(),
        }
    }

    pub fn note(step: usize, message: impl Into<String>) -> Self {
        Self {
            step,
            component: None,
            status: StepStatus::Skipped,
            message: message.into(),
        }
    }
}

/// Cycle details kept alongside a response but not part of its wire shape.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub cycle_id: Uuid,
    pub level: Option<ComplexityLevel>,
    pub rationale: String,
    pub degraded: bool,
    pub failure: Option<FailureClass>,
    pub failure_reason: Option<String>,
    pub invocations: Arc<[SubsystemInvocation]>,
    pub interpretations: Option<InterpretationSet>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            cycle_id: Uuid::nil(),
            level: None,
            rationale: String::new(),
            degraded: false,
            failure: None,
            failure_reason: None,
            invocations: Arc::from(Vec::new()),
            interpretations: None,
        }
    }
}

/// Final output of a reasoning cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextualResponse {
    pub success: bool,
    pub query: String,
    pub response: String,
    /// Aggregate confidence in `[0, 100]`.
    pub confidence: f64,
    /// Wall-clock seconds.
    pub processing_time: f64,
    pub components_used: usize,
    pub reasoning_trace: Vec<ReasoningTraceEntry>,
    #[serde(skip)]
    pub diagnostics: Diagnostics,
}

impl ContextualResponse {
    pub fn invocations(&self) -> &[SubsystemInvocation] {
        &self.diagnostics.invocations
    }

    pub fn level(&self) -> Option<ComplexityLevel> {
        self.diagnostics.level
    }

    pub fn failure(&self) -> Option<FailureClass> {
        self.diagnostics.failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_and_cumulative() {
        for pair in ComplexityLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            for kind in pair[0].eligible() {
                assert!(pair[1].is_eligible(*kind), "{kind} dropped at {}", pair[1]);
            }
            assert!(pair[0].iteration_cap() < pair[1].iteration_cap());
        }
        assert_eq!(ComplexityLevel::NeuralField.escalate(), ComplexityLevel::NeuralField);
    }

    #[test]
    fn score_thresholds() {
        assert_eq!(ComplexityLevel::from_score(0.0), ComplexityLevel::Atom);
        assert_eq!(ComplexityLevel::from_score(0.2), ComplexityLevel::Molecule);
        assert_eq!(ComplexityLevel::from_score(0.49), ComplexityLevel::Cell);
        assert_eq!(ComplexityLevel::from_score(0.5), ComplexityLevel::Organ);
        assert_eq!(ComplexityLevel::from_score(0.79), ComplexityLevel::NeuralSystem);
        assert_eq!(ComplexityLevel::from_score(1.1), ComplexityLevel::NeuralField);
    }

    #[test]
    fn parse_names() {
        assert_eq!("neural-system".parse::<ComplexityLevel>(), Ok(ComplexityLevel::NeuralSystem));
        assert!("huge".parse::<ComplexityLevel>().is_err());
        assert_eq!("symbolic".parse::<SubsystemKind>(), Ok(SubsystemKind::Symbolic));
    }

    #[test]
    fn response_wire_shape_is_fixed() {
        let response = ContextualResponse {
            success: true,
            query: "q".into(),
            response: "r".into(),
            confidence: 50.0,
            processing_time: 0.1,
            components_used: 1,
            reasoning_trace: vec![ReasoningTraceEntry::note(1, "x")],
            diagnostics: Diagnostics::default(),
        };
        let value = serde_json::to_value(&response).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "components_used",
                "confidence",
                "processing_time",
                "query",
                "reasoning_trace",
                "response",
                "success"
            ]
        );
    }
}
