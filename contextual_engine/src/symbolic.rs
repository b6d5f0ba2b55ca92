//! Three-stage symbolic processing: abstraction into variables, induction of
//! patterns over them, and retrieval of a concrete restatement.

use crate::capability::{CallCounters, Capability, CapabilityHealth, CapabilityOutput, CapabilityRequest};
use crate::error::SubsystemFailure;
use crate::tools::{QuestionKind, Representation};
use crate::types::SubsystemKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SymbolicVariable {
    pub symbol: String,
    pub concept: String,
    pub relationships: Vec<String>,
    pub abstraction_level: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SymbolicPattern {
    pub sequence: Vec<String>,
    pub rule: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolicResult {
    pub variables: Vec<SymbolicVariable>,
    pub patterns: Vec<SymbolicPattern>,
    pub concrete: String,
    pub depth: usize,
    pub confidence: f64,
}

/// Runs the three stages over a representation, bounded by `depth`.
pub fn process(rep: &Representation, depth: usize) -> SymbolicResult {
    let depth = depth.max(1);
    let (variables, abstraction_conf) = abstract_symbols(rep, depth);
    let (patterns, induction_conf) = induce_patterns(rep, &variables, depth);
    let (concrete, retrieval_conf) = retrieve(rep, &variables, &patterns);

    SymbolicResult {
        variables,
        patterns,
        concrete,
        depth,
        confidence: (abstraction_conf + induction_conf + retrieval_conf) / 3.0,
    }
}

fn abstract_symbols(rep: &Representation, depth: usize) -> (Vec<SymbolicVariable>, f64) {
    let variables: Vec<_> = rep
        .concepts
        .iter()
        .take(depth * 2)
        .enumerate()
        .map(|(idx, concept)| {
            let relationships = rep
                .relations
                .iter()
                .filter(|r| &r.from == concept || &r.to == concept)
                .map(|r| r.kind.clone())
                .collect::<Vec<_>>();
            SymbolicVariable {
                symbol: format!("X{}", idx + 1),
                concept: concept.clone(),
                abstraction_level: 1 + (idx * depth) / rep.concepts.len().max(1),
                relationships,
            }
        })
        .collect();

    let confidence = if variables.is_empty() {
        0.4
    } else {
        (0.6 + 0.1 * variables.len().min(4) as f64).min(0.95)
    };
    (variables, confidence)
}

fn symbol_for<'a>(variables: &'a [SymbolicVariable], concept: &str) -> Option<&'a str> {
    variables
        .iter()
        .find(|v| v.concept == concept)
        .map(|v| v.symbol.as_str())
}

fn concept_of<'a>(variables: &'a [SymbolicVariable], symbol: &'a str) -> &'a str {
    variables
        .iter()
        .find(|v| v.symbol == symbol)
        .map(|v| v.concept.as_str())
        .unwrap_or(symbol)
}

fn induce_patterns(
    rep: &Representation,
    variables: &[SymbolicVariable],
    depth: usize,
) -> (Vec<SymbolicPattern>, f64) {
    let mut patterns = Vec::new();

    for relation in &rep.relations {
        if let (Some(a), Some(b)) = (symbol_for(variables, &relation.from), symbol_for(variables, &relation.to)) {
            patterns.push(SymbolicPattern {
                sequence: vec![a.to_string(), b.to_string()],
                rule: format!("{a} {} {b}", relation.kind),
            });
        }
    }

    // Chains a→b, b→c generalize to a reaching c.
    let direct = patterns.clone();
    for first in &direct {
        for second in &direct {
            if first.sequence[1] == second.sequence[0] && first.sequence[0] != second.sequence[1] {
                patterns.push(SymbolicPattern {
                    sequence: vec![
                        first.sequence[0].clone(),
                        first.sequence[1].clone(),
                        second.sequence[1].clone(),
                    ],
                    rule: format!("{} transitively reaches {}", first.sequence[0], second.sequence[1]),
                });
            }
        }
    }

    if patterns.is_empty() && variables.len() >= 2 && rep.question_kind == QuestionKind::Comparison {
        patterns.push(SymbolicPattern {
            sequence: vec![variables[0].symbol.clone(), variables[1].symbol.clone()],
            rule: format!("{} contrasts {}", variables[0].symbol, variables[1].symbol),
        });
    }

    patterns.truncate(depth * 2);
    let confidence = if patterns.is_empty() { 0.5 } else { 0.75 };
    (patterns, confidence)
}

fn retrieve(
    rep: &Representation,
    variables: &[SymbolicVariable],
    patterns: &[SymbolicPattern],
) -> (String, f64) {
    if let Some(pattern) = patterns.first() {
        let concrete = pattern
            .rule
            .split(' ')
            .map(|word| concept_of(variables, word))
            .collect::<Vec<_>>()
            .join(" ");
        let statement = format!(
            "Generalized structure: {} ({} pattern{}).",
            concrete,
            patterns.len(),
            if patterns.len() == 1 { "" } else { "s" }
        );
        (statement, 0.8)
    } else if let Some(focus) = &rep.focus {
        (format!("Generalized structure: '{focus}' governs the request."), 0.65)
    } else {
        ("No stable symbolic structure found.".to_string(), 0.4)
    }
}

/// Symbolic processor capability.
pub struct SymbolicProcessor {
    counters: CallCounters,
}

impl SymbolicProcessor {
    pub fn new() -> Self {
        Self {
            counters: CallCounters::default(),
        }
    }
}

impl Default for SymbolicProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for SymbolicProcessor {
    fn name(&self) -> &str {
        "symbolic_processor"
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Symbolic
    }

    #[instrument(skip_all, fields(level = %request.level))]
    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let started = Instant::now();
        let result = match &request.representation {
            None => Err(SubsystemFailure::DependencyUnavailable(
                SubsystemKind::ToolReasoning.to_string(),
            )),
            Some(rep) => {
                let depth = request
                    .level
                    .iteration_cap()
                    .min(request.settings.symbolic.abstraction_depth);
                let result = process(rep, depth);
                debug!(
                    variables = result.variables.len(),
                    patterns = result.patterns.len(),
                    "symbolic processing finished"
                );
                Ok(CapabilityOutput::new(result.concrete.clone(), result.confidence)
                    .with_summary(format!(
                        "{} variables, {} patterns at depth {}",
                        result.variables.len(),
                        result.patterns.len(),
                        result.depth
                    ))
                    .with_details(json!({
                        "variables": result.variables,
                        "patterns": result.patterns,
                        "abstraction_depth": result.depth,
                    })))
            }
        };
        self.counters.record(&result, started.elapsed());
        result
    }

    async fn health_check(&self) -> CapabilityHealth {
        self.counters.health(None)
    }
}
