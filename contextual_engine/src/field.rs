//! Persistent semantic field shared by every reasoning cycle.
//!
//! Patterns are injected with a strength scaled by the boundary permeability.
//! Similar injections reinforce an existing pattern. Decay weakens all
//! patterns each cycle; a reinforced pattern that stays above the attractor
//! threshold through a decay step becomes an attractor.

use crate::capability::{
    CallCounters, Capability, CapabilityHealth, CapabilityOutput, CapabilityRequest, CycleCommit,
};
use crate::error::{EngineError, EngineResult, SubsystemFailure};
use crate::settings::FieldConfig;
use crate::text;
use crate::types::SubsystemKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Patterns this similar to a new injection receive a small sympathetic boost.
const INTERACTION_SIMILARITY: f64 = 0.2;
const INTERACTION_GAIN: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct FieldPattern {
    pub content: String,
    #[serde(skip)]
    pub tokens: HashSet<String>,
    pub strength: f64,
    pub reinforcements: u32,
    pub attractor: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InjectionOutcome {
    /// Reinforced an existing pattern rather than adding one.
    pub merged: bool,
    pub strength: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecayReport {
    pub pruned: usize,
    pub attractors_formed: usize,
    pub attractors_lost: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttractorSummary {
    pub content: String,
    pub strength: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSnapshot {
    pub patterns: usize,
    pub total_energy: f64,
    pub attractors: Vec<AttractorSummary>,
    pub decay_rate: f64,
    pub boundary_permeability: f64,
}

#[derive(Debug)]
pub struct NeuralField {
    patterns: RwLock<Vec<FieldPattern>>,
    params: parking_lot::RwLock<FieldConfig>,
}

impl Default for NeuralField {
    fn default() -> Self {
        Self::new(FieldConfig::default())
    }
}

impl NeuralField {
    pub fn new(params: FieldConfig) -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
            params: parking_lot::RwLock::new(params),
        }
    }

    pub fn set_params(&self, params: FieldConfig) {
        *self.params.write() = params;
    }

    pub fn params(&self) -> FieldConfig {
        self.params.read().clone()
    }

    #[instrument(skip(self, content), fields(chars = content.len()))]
    pub async fn inject(&self, content: &str, strength: f64) -> EngineResult<InjectionOutcome> {
        if content.trim().is_empty() {
            return Err(EngineError::Validation("cannot inject an empty pattern".to_string()));
        }
        if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
            return Err(EngineError::Validation(format!(
                "pattern strength must be within [0, 1], got {strength}"
            )));
        }

        let params = self.params();
        let effective = strength * params.boundary_permeability;
        let tokens = text::token_set(content);
        let mut patterns = self.patterns.write().await;

        let best = patterns
            .iter()
            .enumerate()
            .map(|(idx, p)| (idx, text::jaccard(&tokens, &p.tokens)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let outcome = match best {
            Some((idx, similarity)) if similarity >= params.merge_similarity => {
                let pattern = &mut patterns[idx];
                pattern.strength = (pattern.strength + effective).min(1.0);
                pattern.reinforcements += 1;
                InjectionOutcome {
                    merged: true,
                    strength: pattern.strength,
                }
            }
            _ => {
                for pattern in patterns.iter_mut() {
                    let similarity = text::jaccard(&tokens, &pattern.tokens);
                    if similarity > INTERACTION_SIMILARITY {
                        pattern.strength =
                            (pattern.strength + effective * similarity * INTERACTION_GAIN).min(1.0);
                    }
                }
                patterns.push(FieldPattern {
                    content: content.to_string(),
                    tokens,
                    strength: effective,
                    reinforcements: 0,
                    attractor: false,
                    created_at: Utc::now(),
                });
                InjectionOutcome {
                    merged: false,
                    strength: effective,
                }
            }
        };

        debug!(merged = outcome.merged, strength = outcome.strength, "pattern injected");
        Ok(outcome)
    }

    /// Strength-weighted similarity of `content` to the field, in `[0, 1]`.
    /// Never mutates the field.
    pub async fn resonance(&self, content: &str) -> f64 {
        let tokens = text::token_set(content);
        let patterns = self.patterns.read().await;
        let energy: f64 = patterns.iter().map(|p| p.strength).sum();
        if energy <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = patterns
            .iter()
            .map(|p| text::jaccard(&tokens, &p.tokens) * p.strength)
            .sum();
        (weighted / energy).clamp(0.0, 1.0)
    }

    #[instrument(skip(self))]
    pub async fn decay(&self, rate: f64) -> EngineResult<DecayReport> {
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(EngineError::Validation(format!(
                "decay rate must be within [0, 1], got {rate}"
            )));
        }

        let params = self.params();
        let threshold = params.attractor_threshold;
        let mut report = DecayReport::default();
        let mut patterns = self.patterns.write().await;

        for pattern in patterns.iter_mut() {
            let before = pattern.strength;
            let after = before * (1.0 - rate);
            pattern.strength = after;

            let holds = pattern.reinforcements >= 1 && before >= threshold && after >= threshold;
            if holds && !pattern.attractor {
                report.attractors_formed += 1;
            } else if !holds && pattern.attractor {
                report.attractors_lost += 1;
            }
            pattern.attractor = holds;
        }

        let before = patterns.len();
        patterns.retain(|p| p.strength >= params.prune_floor);
        report.pruned = before - patterns.len();

        let mut ranked: Vec<(usize, f64)> = patterns
            .iter()
            .enumerate()
            .filter(|(_, p)| p.attractor)
            .map(|(idx, p)| (idx, p.strength))
            .collect();
        if ranked.len() > params.max_attractors {
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            for (idx, _) in ranked.into_iter().skip(params.max_attractors) {
                patterns[idx].attractor = false;
                report.attractors_lost += 1;
            }
        }

        debug!(?report, remaining = patterns.len(), "field decayed");
        Ok(report)
    }

    pub async fn attractors(&self) -> Vec<AttractorSummary> {
        let patterns = self.patterns.read().await;
        let mut attractors: Vec<AttractorSummary> = patterns
            .iter()
            .filter(|p| p.attractor)
            .map(|p| AttractorSummary {
                content: p.content.clone(),
                strength: p.strength,
            })
            .collect();
        attractors.sort_by(|a, b| b.strength.partial_cmp(&a.strength).unwrap_or(Ordering::Equal));
        attractors
    }

    pub async fn snapshot(&self) -> FieldSnapshot {
        let attractors = self.attractors().await;
        let patterns = self.patterns.read().await;
        let params = self.params();
        FieldSnapshot {
            patterns: patterns.len(),
            total_energy: patterns.iter().map(|p| p.strength).sum(),
            attractors,
            decay_rate: params.decay_rate,
            boundary_permeability: params.boundary_permeability,
        }
    }

    pub async fn reset(&self) {
        self.patterns.write().await.clear();
        info!("Neural field reset");
    }
}

/// Field resonance as a reasoning capability. Reads on invoke; injects and
/// decays on commit.
pub struct FieldResonator {
    field: Arc<NeuralField>,
    counters: CallCounters,
}

impl FieldResonator {
    pub fn new(field: Arc<NeuralField>) -> Self {
        Self {
            field,
            counters: CallCounters::default(),
        }
    }
}

#[async_trait]
impl Capability for FieldResonator {
    fn name(&self) -> &str {
        "field_resonator"
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::FieldResonance
    }

    #[instrument(skip_all, fields(cycle = %request.cycle_id))]
    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let started = Instant::now();
        let resonance = self.field.resonance(&request.query.text).await;
        let attractors = self.field.attractors().await;

        let mut contribution = format!(
            "Resonance {resonance:.2} with {} attractor{}.",
            attractors.len(),
            if attractors.len() == 1 { "" } else { "s" }
        );
        if let Some(strongest) = attractors.first() {
            contribution.push_str(&format!(
                " Strongest attractor: \"{}\".",
                text::truncate_words(&strongest.content, 12)
            ));
        }

        let result = Ok(CapabilityOutput::new(contribution, 0.35 + 0.6 * resonance)
            .with_summary(format!("resonance {resonance:.2}"))
            .with_details(json!({
                "resonance": resonance,
                "attractors": attractors,
            })));
        self.counters.record(&result, started.elapsed());
        result
    }

    async fn health_check(&self) -> CapabilityHealth {
        let snapshot = self.field.snapshot().await;
        self.counters.health(Some(format!(
            "{} patterns, {} attractors",
            snapshot.patterns,
            snapshot.attractors.len()
        )))
    }

    async fn commit(&self, commit: &CycleCommit) -> Result<(), SubsystemFailure> {
        self.field
            .inject(&commit.query.text, 1.0)
            .await
            .map_err(|e| SubsystemFailure::failed("inject_rejected", e.to_string()))?;
        self.field
            .decay(commit.settings.field.decay_rate)
            .await
            .map_err(|e| SubsystemFailure::failed("decay_rejected", e.to_string()))?;
        Ok(())
    }
}
