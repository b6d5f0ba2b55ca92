//! Heuristic complexity assessment with performance-driven escalation.

use crate::monitoring::PerformanceSnapshot;
use crate::settings::OrchestratorConfig;
use crate::types::{ComplexityLevel, Context, Query};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

const ABSTRACT_INDICATORS: &[&str] = &[
    "concept", "theory", "principle", "philosophy", "methodology", "framework", "paradigm",
    "perspective", "interpretation", "analysis",
];
const REASONING_INDICATORS: &[&str] = &[
    "because", "therefore", "thus", "consequently", "implies", "suggests", "indicates",
    "demonstrates", "proves", "shows",
];
const META_INDICATORS: &[&str] = &[
    "thinking", "understanding", "reasoning", "cognition", "awareness", "consciousness",
    "reflection", "introspection", "analysis",
];
const ABSTRACTION_KEYWORDS: &[&str] = &[
    "abstract", "general", "universal", "pattern", "model", "framework", "structure",
    "relationship", "system", "process", "mechanism", "principle", "rule", "law", "theory",
    "hypothesis",
];
const ABSTRACT_QUESTIONS: &[&str] = &[
    "why", "how", "what if", "suppose", "imagine", "consider", "analyze", "evaluate",
    "synthesize", "generalize",
];
const INTEGRATION_INDICATORS: &[&str] = &[
    "combine", "integrate", "synthesize", "merge", "unify", "connect", "relate", "compare",
    "contrast", "balance", "coordinate", "align",
];
const SOURCE_INDICATORS: &[&str] = &[
    "according to", "based on", "from", "considering", "given", "taking into account",
    "in light of", "perspective", "viewpoint",
];
const TECHNICAL_SUFFIXES: &[&str] = &[
    "tion", "sion", "ment", "ness", "ity", "ism", "ology", "ics", "ing",
];

/// The seven factors behind a complexity score, each nominally in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComplexityFactors {
    pub content_length: f64,
    pub vocabulary: f64,
    pub syntax: f64,
    pub semantic_depth: f64,
    pub contextual_richness: f64,
    pub abstraction: f64,
    pub integration: f64,
}

impl ComplexityFactors {
    pub fn analyze(text: &str, context: &Context) -> Self {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        Self {
            content_length: (text.chars().count() as f64 / 1000.0).min(1.0),
            vocabulary: vocabulary(&words),
            syntax: syntax(text),
            semantic_depth: semantic_depth(&lower, words.len()),
            contextual_richness: contextual_richness(context),
            abstraction: abstraction(&lower, words.len()),
            integration: integration(&lower, words.len(), context.len()),
        }
    }

    fn named(&self) -> [(&'static str, f64); 7] {
        [
            ("content length", self.content_length),
            ("vocabulary complexity", self.vocabulary),
            ("syntactic complexity", self.syntax),
            ("semantic depth", self.semantic_depth),
            ("contextual richness", self.contextual_richness),
            ("abstraction requirement", self.abstraction),
            ("integration demand", self.integration),
        ]
    }

    /// Weighted sum of the factors.
    pub fn score(&self) -> f64 {
        self.content_length * 0.1
            + self.vocabulary * 0.15
            + self.syntax * 0.15
            + self.semantic_depth * 0.25
            + self.contextual_richness * 0.15
            + self.abstraction * 0.2
            + self.integration * 0.2
    }

    /// Agreement between factors, lowered when any factor is extreme.
    pub fn consistency(&self) -> f64 {
        let values = self.named().map(|(_, v)| v);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let extreme = values.iter().any(|v| *v > 0.9 || *v < 0.1);
        let penalty = if extreme { 0.1 } else { 0.0 };
        (1.0 - variance.min(1.0) - penalty).max(0.3)
    }
}

fn count(lower: &str, needles: &[&str]) -> f64 {
    crate::text::count_indicators(lower, needles) as f64
}

fn is_technical(word: &str) -> bool {
    word.chars().count() > 8
        || TECHNICAL_SUFFIXES.iter().any(|s| word.ends_with(s))
        || (word.chars().any(char::is_alphabetic) && word.to_uppercase() == word)
}

fn vocabulary(words: &[&str]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let n = words.len() as f64;
    let long = words.iter().filter(|w| w.chars().count() > 6).count() as f64;
    let technical = words.iter().filter(|w| is_technical(w)).count() as f64;
    let unique = words.iter().collect::<std::collections::HashSet<_>>().len() as f64;
    (long / n * 0.4 + technical / n * 0.4 + unique / n * 0.2).min(1.0)
}

fn syntax(text: &str) -> f64 {
    let sentences = text.split('.').count().max(1) as f64;
    let words = text.split_whitespace().count() as f64;
    let length = (words / sentences / 20.0).min(1.0);
    let punctuation = text.matches([',', ';', ':']).count() as f64;
    let punctuation = (punctuation / sentences / 3.0).min(1.0);
    let nesting = text.matches(['(', '[', '{']).count() as f64;
    let nesting = (nesting / sentences).min(1.0);
    length * 0.5 + punctuation * 0.3 + nesting * 0.2
}

fn semantic_depth(lower: &str, words: usize) -> f64 {
    if words == 0 {
        return 0.0;
    }
    let hits = count(lower, ABSTRACT_INDICATORS)
        + count(lower, REASONING_INDICATORS)
        + count(lower, META_INDICATORS);
    (hits / words as f64 * 100.0 * 0.5).min(1.0)
}

fn contextual_richness(context: &Context) -> f64 {
    if context.is_empty() {
        return 0.0;
    }
    let mut nested = 0usize;
    let mut elements = 0usize;
    for value in context.values() {
        elements += 1;
        match value {
            Value::Object(map) => {
                nested += 1;
                elements += map.len();
            }
            Value::Array(items) => {
                nested += 1;
                elements += items.len();
            }
            _ => {}
        }
    }
    let size = (context.len() as f64 / 10.0).min(1.0);
    let depth = nested as f64 / context.len() as f64;
    let richness = (elements as f64 / 20.0).min(1.0);
    size * 0.4 + depth * 0.3 + richness * 0.3
}

fn abstraction(lower: &str, words: usize) -> f64 {
    if words == 0 {
        return 0.0;
    }
    let hits = count(lower, ABSTRACTION_KEYWORDS) + count(lower, ABSTRACT_QUESTIONS);
    (hits / words as f64 * 50.0).min(1.0)
}

fn integration(lower: &str, words: usize, context_len: usize) -> f64 {
    let from_context = context_len as f64 / 5.0;
    if words == 0 {
        return from_context.min(1.0);
    }
    let hits = count(lower, INTEGRATION_INDICATORS) + count(lower, SOURCE_INDICATORS);
    (hits / words as f64 * 50.0 + from_context * 0.3).min(1.0)
}

/// Result of one assessment.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub level: ComplexityLevel,
    pub score: f64,
    pub confidence: f64,
    pub rationale: String,
    /// Set when the heuristics failed and the assessor fell back to `Atom`.
    pub degraded: bool,
}

/// Maps queries to a complexity level. Never fails.
#[derive(Debug, Clone, Default)]
pub struct ComplexityAssessor;

impl ComplexityAssessor {
    pub fn new() -> Self {
        Self
    }

    /// Deterministic for the same query, context, configuration and
    /// performance snapshot.
    pub fn assess(
        &self,
        query: &Query,
        performance: &PerformanceSnapshot,
        config: &OrchestratorConfig,
        preference: Option<ComplexityLevel>,
    ) -> Assessment {
        let factors = ComplexityFactors::analyze(&query.text, &query.context);
        let score = factors.score();
        if let Some(level) = preference {
            return Assessment {
                level,
                score,
                confidence: 1.0,
                rationale: format!("Caller requested level {level}"),
                degraded: false,
            };
        }

        if !score.is_finite() {
            warn!(?factors, "complexity score is not finite; falling back to atom");
            return Assessment {
                level: ComplexityLevel::Atom,
                score: 0.0,
                confidence: 0.3,
                rationale: "Complexity heuristics failed; degraded to atom".to_string(),
                degraded: true,
            };
        }

        let mut lines = vec![format!("Complexity score: {score:.2}")];
        let level = if config.auto_scaling {
            let recommended = ComplexityLevel::from_score(score);
            match performance.recent_success_rate {
                Some(rate)
                    if performance.recent_samples >= config.min_samples
                        && rate < config.performance_threshold =>
                {
                    lines.push(format!(
                        "Recent success rate {rate:.2} below {:.2}; escalating from {recommended}",
                        config.performance_threshold
                    ));
                    recommended.escalate()
                }
                _ => recommended,
            }
        } else {
            lines.push("Auto-scaling disabled; using configured default".to_string());
            config.default_level
        };
        lines.insert(1, format!("Level: {level}"));

        let mut drivers = factors.named();
        drivers.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (name, value) in drivers.iter().take(3).filter(|(_, v)| *v > 0.3) {
            let intensity = if *value > 0.7 { "high" } else { "moderate" };
            lines.push(format!("{name}: {intensity} ({value:.2})"));
        }

        debug!(score, %level, "complexity assessed");
        Assessment {
            level,
            score,
            confidence: factors.consistency(),
            rationale: lines.join("; "),
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{CycleSample, PerformanceMonitor};
    use serde_json::json;
    use std::time::Duration;

    fn query(text: &str, context: Value) -> Query {
        Query::new(text, context.as_object().cloned().unwrap_or_default())
    }

    fn snapshot() -> PerformanceSnapshot {
        PerformanceMonitor::default().snapshot()
    }

    #[test]
    fn short_plain_query_is_shallow() {
        let assessment = ComplexityAssessor::new().assess(
            &query("hi there", json!({})),
            &snapshot(),
            &OrchestratorConfig::default(),
            None,
        );
        assert!(assessment.level <= ComplexityLevel::Molecule);
        assert!(!assessment.degraded);
    }

    #[test]
    fn abstract_integrative_query_is_deep() {
        let text = "Why does the theory of evolution, considering the framework of natural \
                    selection, imply a general principle? Compare and integrate this analysis \
                    with the philosophy of systems thinking, because the relationship matters.";
        let context = json!({
            "domain": "science",
            "prior_turns": ["a", "b", "c"],
            "constraints": {"depth": "high", "sources": 3},
        });
        let assessment = ComplexityAssessor::new().assess(
            &query(text, context),
            &snapshot(),
            &OrchestratorConfig::default(),
            None,
        );
        assert!(assessment.level >= ComplexityLevel::Organ, "{assessment:?}");
    }

    #[test]
    fn assessment_is_deterministic() {
        let q = query("How do caches and consistency models relate?", json!({"domain": "cs"}));
        let assessor = ComplexityAssessor::new();
        let config = OrchestratorConfig::default();
        let a = assessor.assess(&q, &snapshot(), &config, None);
        let b = assessor.assess(&q, &snapshot(), &config, None);
        assert_eq!(a.level, b.level);
        assert_eq!(a.score, b.score);
        assert_eq!(a.rationale, b.rationale);
    }

    #[test]
    fn preference_overrides() {
        let assessment = ComplexityAssessor::new().assess(
            &query("hi", json!({})),
            &snapshot(),
            &OrchestratorConfig::default(),
            Some(ComplexityLevel::NeuralField),
        );
        assert_eq!(assessment.level, ComplexityLevel::NeuralField);
    }

    #[test]
    fn disabled_scaling_uses_default_level() {
        let config = OrchestratorConfig {
            auto_scaling: false,
            default_level: ComplexityLevel::Organ,
            ..Default::default()
        };
        let assessment =
            ComplexityAssessor::new().assess(&query("hi", json!({})), &snapshot(), &config, None);
        assert_eq!(assessment.level, ComplexityLevel::Organ);
    }

    #[test]
    fn poor_recent_performance_escalates() {
        let q = query("hi there", json!({}));
        let config = OrchestratorConfig::default();
        let assessor = ComplexityAssessor::new();
        let baseline = assessor.assess(&q, &snapshot(), &config, None).level;

        let monitor = PerformanceMonitor::default();
        for _ in 0..config.min_samples {
            monitor.record(CycleSample {
                level: Some(baseline),
                success: false,
                confidence: 0.0,
                duration: Duration::from_millis(1),
            });
        }
        let escalated = assessor.assess(&q, &monitor.snapshot(), &config, None).level;
        assert_eq!(escalated, baseline.escalate());
    }
}
