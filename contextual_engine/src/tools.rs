//! Structured-tool reasoning: a staged understand → extract → highlight → apply
//! → validate pass that produces the representation other subsystems build on.

use crate::capability::{CallCounters, Capability, CapabilityHealth, CapabilityOutput, CapabilityRequest};
use crate::error::SubsystemFailure;
use crate::settings::{Settings, ToolSelection};
use crate::text;
use crate::types::{ComplexityLevel, SubsystemKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::{debug, instrument};

/// Content-derived structure handed to symbolic processing and interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub concepts: Vec<String>,
    pub relations: Vec<Relation>,
    pub question_kind: QuestionKind,
    pub focus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Explanation,
    Definition,
    Comparison,
    Procedure,
    Evaluation,
    Statement,
}

impl QuestionKind {
    fn classify(lower: &str) -> Self {
        let starts = |p: &str| lower.starts_with(p);
        if ["compare", "difference", " vs ", " versus ", "contrast"]
            .iter()
            .any(|p| lower.contains(p))
        {
            Self::Comparison
        } else if starts("how to") || starts("how do i") || lower.contains("steps to") {
            Self::Procedure
        } else if starts("why") || starts("how") || lower.contains("explain") {
            Self::Explanation
        } else if starts("what is") || starts("what are") || starts("define") {
            Self::Definition
        } else if starts("should") || lower.contains("evaluate") || lower.contains("better") {
            Self::Evaluation
        } else {
            Self::Statement
        }
    }

    fn strategy(self) -> &'static str {
        match self {
            Self::Explanation => "causal decomposition",
            Self::Definition => "defining properties and boundaries",
            Self::Comparison => "side-by-side contrast",
            Self::Procedure => "ordered step planning",
            Self::Evaluation => "criteria-based weighing",
            Self::Statement => "claim analysis",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explanation => "explanation",
            Self::Definition => "definition",
            Self::Comparison => "comparison",
            Self::Procedure => "procedure",
            Self::Evaluation => "evaluation",
            Self::Statement => "statement",
        }
    }
}

const RELATION_WORDS: &[(&str, &str)] = &[
    ("affects", "influences"),
    ("against", "contrasts"),
    ("between", "relates"),
    ("cause", "causes"),
    ("causes", "causes"),
    ("enables", "enables"),
    ("influences", "influences"),
    ("leads", "leads_to"),
    ("requires", "requires"),
    ("than", "contrasts"),
    ("versus", "contrasts"),
    ("vs", "contrasts"),
];

/// Builds the content-only representation of a piece of text.
pub fn represent(content: &str, max_concepts: usize) -> Representation {
    let lower = content.to_lowercase();
    let concepts = text::key_terms(content, max_concepts);
    let tokens = text::tokenize(content);

    let is_content = |t: &String| t.len() >= 3 && !text::is_stopword(t);
    let mut relations = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        let Some((_, kind)) = RELATION_WORDS.iter().find(|(w, _)| *w == token.as_str()) else {
            continue;
        };
        let before = tokens[..idx].iter().rev().find(|t| is_content(t));
        let after = tokens[idx + 1..].iter().find(|t| is_content(t));
        if let (Some(from), Some(to)) = (before, after) {
            let relation = Relation {
                from: from.clone(),
                to: to.clone(),
                kind: (*kind).to_string(),
            };
            if !relations.contains(&relation) {
                relations.push(relation);
            }
        }
    }

    Representation {
        focus: concepts.first().cloned(),
        concepts,
        relations,
        question_kind: QuestionKind::classify(lower.trim()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Understand,
    Extract,
    Highlight,
    Apply,
    Validate,
}

impl Stage {
    const CORE: [Stage; 4] = [Stage::Understand, Stage::Extract, Stage::Highlight, Stage::Apply];

    fn name(self) -> &'static str {
        match self {
            Self::Understand => "understand",
            Self::Extract => "extract",
            Self::Highlight => "highlight",
            Self::Apply => "apply",
            Self::Validate => "validate",
        }
    }

    fn base_confidence(self) -> f64 {
        match self {
            Self::Understand => 0.85,
            Self::Extract => 0.80,
            Self::Highlight => 0.88,
            Self::Apply => 0.90,
            Self::Validate => 0.92,
        }
    }
}

/// Stages to run for a level under the configured selection strategy.
fn plan_stages(level: ComplexityLevel, settings: &Settings) -> Vec<Stage> {
    let core = match settings.tools.selection {
        ToolSelection::Minimal => 2,
        ToolSelection::Full => Stage::CORE.len(),
        ToolSelection::Auto => (2 + level.rank()).min(Stage::CORE.len()),
    };
    let mut stages = Stage::CORE[..core].to_vec();
    let validate = match settings.tools.selection {
        ToolSelection::Minimal => false,
        ToolSelection::Full => settings.tools.verification_enabled,
        ToolSelection::Auto => {
            settings.tools.verification_enabled && level >= ComplexityLevel::Cell
        }
    };
    if validate {
        stages.push(Stage::Validate);
    }
    stages
}

struct StageResult {
    stage: Stage,
    output: String,
    confidence: f64,
}

/// Structured-tool reasoner.
pub struct ToolReasoner {
    counters: CallCounters,
}

impl ToolReasoner {
    pub fn new() -> Self {
        Self {
            counters: CallCounters::default(),
        }
    }

    fn run_stage(stage: Stage, content: &str, domain: Option<&str>, rep: &Representation) -> StageResult {
        let base = stage.base_confidence();
        let (output, confidence) = match stage {
            Stage::Understand => {
                let words = content.split_whitespace().count();
                let confidence = if rep.concepts.is_empty() { base * 0.6 } else { base };
                (
                    format!(
                        "Reading this as a {} request ({} words, {} key concepts).",
                        rep.question_kind.as_str(),
                        words,
                        rep.concepts.len()
                    ),
                    confidence,
                )
            }
            Stage::Extract => {
                let coverage = (rep.concepts.len() as f64 / 3.0).min(1.0);
                let relations = if rep.relations.is_empty() {
                    String::from("no explicit relations")
                } else {
                    rep.relations
                        .iter()
                        .map(|r| format!("{} {} {}", r.from, r.kind, r.to))
                        .collect::<Vec<_>>()
                        .join("; ")
                };
                (
                    format!("Key concepts: {}; {}.", rep.concepts.join(", "), relations),
                    base * (0.75 + 0.25 * coverage),
                )
            }
            Stage::Highlight => {
                let focus = rep.focus.as_deref().unwrap_or("the overall request");
                let output = match domain {
                    Some(domain) => format!("Central element is '{focus}' within the {domain} domain."),
                    None => format!("Central element is '{focus}'."),
                };
                (output, base)
            }
            Stage::Apply => (
                format!(
                    "Applying {} to {}.",
                    rep.question_kind.strategy(),
                    if rep.concepts.is_empty() {
                        "the request as stated".to_string()
                    } else {
                        rep.concepts.join(" and ")
                    }
                ),
                base,
            ),
            Stage::Validate => {
                let grounded = rep
                    .relations
                    .iter()
                    .all(|r| !r.from.is_empty() && !r.to.is_empty());
                if !rep.concepts.is_empty() && grounded {
                    ("Checks passed: concepts and relations are grounded in the text.".to_string(), base)
                } else {
                    ("Checks flagged an underspecified request.".to_string(), 0.6)
                }
            }
        };
        StageResult {
            stage,
            output,
            confidence,
        }
    }
}

impl Default for ToolReasoner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for ToolReasoner {
    fn name(&self) -> &str {
        "structured_tools"
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::ToolReasoning
    }

    #[instrument(skip_all, fields(level = %request.level))]
    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let started = Instant::now();
        let result = self.reason(request).await;
        self.counters.record(&result, started.elapsed());
        result
    }

    async fn health_check(&self) -> CapabilityHealth {
        self.counters.health(None)
    }
}

impl ToolReasoner {
    async fn reason(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let content = request.query.text.trim();
        if text::tokenize(content).is_empty() {
            return Err(SubsystemFailure::failed("empty_input", "no words to reason about"));
        }

        let representation = represent(content, 3 + request.level.iteration_cap());
        let domain = request.query.domain();
        let stages = plan_stages(request.level, &request.settings);

        let mut results = Vec::with_capacity(stages.len());
        for stage in stages {
            let result = Self::run_stage(stage, content, domain.as_deref(), &representation);
            debug!(stage = stage.name(), confidence = result.confidence, "tool stage finished");
            results.push(result);
            tokio::task::yield_now().await;
        }

        let certainty =
            results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64;
        let verification_passed = results
            .iter()
            .find(|r| r.stage == Stage::Validate)
            .map(|r| r.confidence > 0.7);

        let contribution = results
            .iter()
            .map(|r| r.output.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let summary = format!(
            "{} stages over a {} request",
            results.len(),
            representation.question_kind.as_str()
        );
        let details = json!({
            "stages": results.iter().map(|r| json!({
                "tool": r.stage.name(),
                "confidence": r.confidence,
            })).collect::<Vec<_>>(),
            "verification_passed": verification_passed,
        });

        Ok(CapabilityOutput::new(contribution, certainty)
            .with_summary(summary)
            .with_representation(representation)
            .with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Query;
    use std::sync::Arc;

    fn request(text: &str, level: ComplexityLevel, settings: Settings) -> CapabilityRequest {
        CapabilityRequest {
            cycle_id: uuid::Uuid::new_v4(),
            query: Query::new(text, Default::default()),
            level,
            representation: None,
            settings: Arc::new(settings),
        }
    }

    #[test]
    fn representation_is_content_only() {
        let rep = represent("Why does heat cause expansion in metals?", 5);
        assert_eq!(rep.question_kind, QuestionKind::Explanation);
        assert!(rep.concepts.contains(&"heat".to_string()));
        assert_eq!(
            rep.relations,
            vec![Relation {
                from: "heat".into(),
                to: "expansion".into(),
                kind: "causes".into()
            }]
        );
    }

    #[test]
    fn question_kinds() {
        assert_eq!(represent("Compare rust and go", 3).question_kind, QuestionKind::Comparison);
        assert_eq!(represent("How to bake bread", 3).question_kind, QuestionKind::Procedure);
        assert_eq!(represent("What is entropy", 3).question_kind, QuestionKind::Definition);
        assert_eq!(represent("Cats sleep a lot", 3).question_kind, QuestionKind::Statement);
    }

    #[test]
    fn stage_plan_follows_selection() {
        let mut settings = Settings::default();
        assert_eq!(plan_stages(ComplexityLevel::Atom, &settings).len(), 2);
        assert_eq!(
            plan_stages(ComplexityLevel::NeuralField, &settings).last(),
            Some(&Stage::Validate)
        );

        settings.tools.selection = ToolSelection::Minimal;
        assert_eq!(plan_stages(ComplexityLevel::NeuralField, &settings).len(), 2);

        settings.tools.selection = ToolSelection::Full;
        settings.tools.verification_enabled = false;
        assert_eq!(plan_stages(ComplexityLevel::Atom, &settings).len(), 4);
    }

    #[tokio::test]
    async fn invoke_produces_representation_and_bounded_certainty() {
        let reasoner = ToolReasoner::new();
        let output = reasoner
            .invoke(&request("Explain how caching improves latency", ComplexityLevel::Organ, Settings::default()))
            .await
            .unwrap();
        assert!(output.representation.is_some());
        assert!(output.certainty > 0.0 && output.certainty <= 1.0);
        assert_eq!(output.details["verification_passed"], json!(true));

        let health = reasoner.health_check().await;
        assert_eq!(health.total_requests, 1);
        assert_eq!(health.error_count, 0);
    }

    #[tokio::test]
    async fn punctuation_only_input_fails() {
        let reasoner = ToolReasoner::new();
        let err = reasoner
            .invoke(&request("?!", ComplexityLevel::Atom, Settings::default()))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "empty_input");
        assert_eq!(reasoner.health_check().await.error_count, 1);
    }
}
