//! Ambiguity resolution: a content-derived set of candidate meanings that
//! collapses to one selected meaning under a given context.

use crate::capability::{CallCounters, Capability, CapabilityHealth, CapabilityOutput, CapabilityRequest};
use crate::error::SubsystemFailure;
use crate::settings::InterpretationConfig;
use crate::text;
use crate::tools::{represent, QuestionKind, Representation};
use crate::types::{Context, SubsystemKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::{debug, instrument};

/// Affinity multiplier applied when the context favours a perspective.
const CONTEXT_BOOST: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    Literal,
    Metaphorical,
    Contextual,
    Inferential,
    Pragmatic,
}

impl Perspective {
    pub const ALL: [Perspective; 5] = [
        Self::Literal,
        Self::Metaphorical,
        Self::Contextual,
        Self::Inferential,
        Self::Pragmatic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::Metaphorical => "metaphorical",
            Self::Contextual => "contextual",
            Self::Inferential => "inferential",
            Self::Pragmatic => "pragmatic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub perspective: Perspective,
    pub meaning: String,
    pub likelihood: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollapsedMeaning {
    pub perspective: Perspective,
    pub meaning: String,
    /// Posterior weight of the selected candidate after context weighting.
    pub weight: f64,
}

/// Candidate meanings for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretationSet {
    pub content: String,
    pub candidates: Vec<Interpretation>,
    /// Shannon entropy of the candidate likelihoods, in nats.
    pub entropy: f64,
    /// Entropy divided by its maximum for this candidate count, in `[0, 1]`.
    pub normalized_entropy: f64,
    pub selected: Option<CollapsedMeaning>,
}

impl InterpretationSet {
    /// Trace line naming the selected reading and every reading it ruled out.
    pub fn audit_line(&self) -> String {
        let selected = self.selected.as_ref().map(|s| s.perspective);
        let mut line = match selected
            .and_then(|p| self.candidates.iter().find(|c| c.perspective == p))
        {
            Some(chosen) => format!(
                "selected {} ({:.2})",
                chosen.perspective.as_str(),
                chosen.likelihood
            ),
            None => "nothing selected".to_string(),
        };

        let ruled_out: Vec<String> = self
            .candidates
            .iter()
            .filter(|c| Some(c.perspective) != selected)
            .map(|c| format!("{} {:.2} \"{}\"", c.perspective.as_str(), c.likelihood, c.meaning))
            .collect();
        if !ruled_out.is_empty() {
            line.push_str("; ruled out ");
            line.push_str(&ruled_out.join(", "));
        }
        line.push_str(&format!(" (entropy {:.2})", self.normalized_entropy));
        line
    }
}

const FIGURATIVE: &[&str] = &[
    " like a ", " as if ", "heart", "storm", "light", "shadow", "journey", "fire", "river",
    "bloom", "soul", "dream",
];
const DEICTIC: &[&str] = &[" this ", " that ", " it ", " they ", " those ", " these ", " here "];
const INFERENTIAL: &[&str] = &["why", "because", "therefore", "implies", "suggest", "mean"];
const PRAGMATIC: &[&str] = &["can you", "could you", "please", "should", "would you", "help"];

/// Generates candidates from the content alone.
pub fn candidates(content: &str, rep: &Representation, min_likelihood: f64) -> InterpretationSet {
    let padded = format!(" {} ", content.to_lowercase());
    let focus = rep.focus.as_deref().unwrap_or("the statement");

    let mut literal: f64 = 1.0;
    if matches!(rep.question_kind, QuestionKind::Definition | QuestionKind::Procedure) {
        literal += 0.5;
    }
    if padded.chars().any(|c| c.is_ascii_digit()) {
        literal += 0.3;
    }
    let metaphorical = 0.3 + 0.6 * text::count_indicators(&padded, FIGURATIVE) as f64;
    let contextual = 0.4 + 0.4 * text::count_indicators(&padded, DEICTIC) as f64;
    let inferential = 0.4
        + 0.5 * text::count_indicators(&padded, INFERENTIAL) as f64
        + if rep.relations.is_empty() { 0.0 } else { 0.3 };
    let pragmatic = 0.3 + 0.5 * text::count_indicators(&padded, PRAGMATIC) as f64;

    let raw = [
        (Perspective::Literal, literal, format!("Taken at face value, the request is about '{focus}'.")),
        (
            Perspective::Metaphorical,
            metaphorical,
            format!("Read figuratively, '{focus}' stands for something beyond its surface sense."),
        ),
        (
            Perspective::Contextual,
            contextual,
            format!("The meaning of '{focus}' depends on what came before in the conversation."),
        ),
        (
            Perspective::Inferential,
            inferential,
            format!("The request implies an underlying question about why '{focus}' holds."),
        ),
        (
            Perspective::Pragmatic,
            pragmatic,
            format!("The speaker wants something done with '{focus}', not just described."),
        ),
    ];

    let total: f64 = raw.iter().map(|(_, w, _)| w).sum();
    let mut kept: Vec<Interpretation> = raw
        .into_iter()
        .map(|(perspective, weight, meaning)| Interpretation {
            perspective,
            meaning,
            likelihood: weight / total,
        })
        .filter(|c| c.likelihood >= min_likelihood)
        .collect();

    // Literal always carries the largest prior, so at least one candidate survives.
    if kept.is_empty() {
        kept.push(Interpretation {
            perspective: Perspective::Literal,
            meaning: format!("Taken at face value, the request is about '{focus}'."),
            likelihood: 1.0,
        });
    }
    let kept_total: f64 = kept.iter().map(|c| c.likelihood).sum();
    for candidate in &mut kept {
        candidate.likelihood /= kept_total;
    }

    let (entropy, normalized_entropy) = entropy(kept.iter().map(|c| c.likelihood));
    InterpretationSet {
        content: content.to_string(),
        candidates: kept,
        entropy,
        normalized_entropy,
        selected: None,
    }
}

fn entropy(probabilities: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = probabilities.clone().count();
    let h: f64 = probabilities
        .filter(|p| *p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    let normalized = if n > 1 { (h / (n as f64).ln()).clamp(0.0, 1.0) } else { 0.0 };
    (h, normalized)
}

/// Perspectives the context explicitly favours.
fn favoured(context: &Context) -> Vec<Perspective> {
    let mut favoured = Vec::new();
    let domain = context
        .get("domain")
        .and_then(|v| v.as_str())
        .map(|d| d.trim().to_lowercase())
        .unwrap_or_default();

    match domain.as_str() {
        "poetry" | "literature" | "art" | "music" | "fiction" | "creative" => {
            favoured.push(Perspective::Metaphorical)
        }
        "law" | "legal" | "technical" | "engineering" | "science" | "medicine" | "finance" => {
            favoured.push(Perspective::Literal)
        }
        _ => {}
    }

    let non_empty = |key: &str| match context.get(key) {
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Null) | None => false,
        Some(_) => true,
    };
    if non_empty("prior_turns") || non_empty("history") {
        favoured.push(Perspective::Contextual);
    }
    if non_empty("intent") || non_empty("goal") {
        favoured.push(Perspective::Pragmatic);
    }
    if context.get("mode").and_then(|v| v.as_str()) == Some("analytical") {
        favoured.push(Perspective::Inferential);
    }
    favoured
}

/// Deterministically selects one candidate given the context. Ties go to the
/// earlier perspective.
pub fn collapse(set: &InterpretationSet, context: &Context) -> Option<CollapsedMeaning> {
    let favoured = favoured(context);
    let weights: Vec<f64> = set
        .candidates
        .iter()
        .map(|c| {
            let boost = if favoured.contains(&c.perspective) { CONTEXT_BOOST } else { 1.0 };
            c.likelihood * boost
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }

    let mut best = 0;
    for (idx, weight) in weights.iter().enumerate() {
        if *weight > weights[best] {
            best = idx;
        }
    }
    let chosen = &set.candidates[best];
    Some(CollapsedMeaning {
        perspective: chosen.perspective,
        meaning: chosen.meaning.clone(),
        weight: weights[best] / total,
    })
}

/// Builds the candidate set for `content` and collapses it under `context`.
pub fn interpret(content: &str, context: &Context, config: &InterpretationConfig) -> InterpretationSet {
    let rep = represent(content, 5);
    let mut set = candidates(content, &rep, config.min_likelihood);
    set.selected = collapse(&set, context);
    set
}

/// Ambiguity resolver capability.
pub struct AmbiguityResolver {
    counters: CallCounters,
}

impl AmbiguityResolver {
    pub fn new() -> Self {
        Self {
            counters: CallCounters::default(),
        }
    }
}

impl Default for AmbiguityResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for AmbiguityResolver {
    fn name(&self) -> &str {
        "ambiguity_resolver"
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Interpretation
    }

    #[instrument(skip_all)]
    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let started = Instant::now();
        let result = match &request.representation {
            None => Err(SubsystemFailure::DependencyUnavailable(
                SubsystemKind::ToolReasoning.to_string(),
            )),
            Some(rep) => {
                let config = &request.settings.interpretation;
                let mut set = candidates(&request.query.text, rep, config.min_likelihood);
                set.selected = collapse(&set, &request.query.context);
                match set.selected.clone() {
                    None => Err(SubsystemFailure::failed("no_candidates", "nothing to collapse")),
                    Some(selected) => {
                        debug!(
                            perspective = selected.perspective.as_str(),
                            entropy = set.normalized_entropy,
                            "interpretation collapsed"
                        );
                        let certainty = 0.4 + 0.6 * selected.weight;
                        Ok(CapabilityOutput::new(selected.meaning.clone(), certainty)
                            .with_summary(set.audit_line())
                            .with_details(json!({
                                "selected": selected.perspective,
                                "candidates": set.candidates.len(),
                            }))
                            .with_interpretations(set))
                    }
                }
            }
        };
        self.counters.record(&result, started.elapsed());
        result
    }

    async fn health_check(&self) -> CapabilityHealth {
        self.counters.health(None)
    }
}
