//! The uniform contract every reasoning subsystem exposes to the orchestrator.

use crate::error::SubsystemFailure;
use crate::interpretation::InterpretationSet;
use crate::settings::Settings;
use crate::tools::Representation;
use crate::types::{ComplexityLevel, Query, SubsystemKind};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A reasoning subsystem. Calls are abortable: the orchestrator may drop the
/// `invoke` future at any suspension point.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> SubsystemKind;
    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure>;
    async fn health_check(&self) -> CapabilityHealth;

    /// Applies post-cycle state changes. Called only for capabilities that
    /// completed in a successful cycle.
    async fn commit(&self, _commit: &CycleCommit) -> Result<(), SubsystemFailure> {
        Ok(())
    }
}

/// Input to one subsystem call.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub cycle_id: Uuid,
    pub query: Query,
    pub level: ComplexityLevel,
    /// Structured representation from the tool reasoner, for dependents.
    pub representation: Option<Representation>,
    pub settings: Arc<Settings>,
}

impl CapabilityRequest {
    /// Snapshot recorded with the invocation.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "query": self.query.text,
            "context_keys": self.query.context.keys().collect::<Vec<_>>(),
            "level": self.level,
            "representation": self.representation,
        })
    }
}

/// Successful result of one subsystem call.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityOutput {
    pub contribution: String,
    /// Self-reported certainty in `[0, 1]`.
    pub certainty: f64,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representation: Option<Representation>,
    /// Normalized entropy of the interpretation set before collapse.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambiguity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretations: Option<InterpretationSet>,
    pub details: serde_json::Value,
}

impl CapabilityOutput {
    pub fn new(contribution: impl Into<String>, certainty: f64) -> Self {
        let contribution = contribution.into();
        let certainty = if certainty.is_finite() {
            certainty.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            summary: crate::text::truncate_words(&contribution, 12),
            contribution,
            certainty,
            representation: None,
            ambiguity: None,
            interpretations: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = Some(representation);
        self
    }

    pub fn with_interpretations(mut self, set: InterpretationSet) -> Self {
        self.ambiguity = Some(set.normalized_entropy);
        self.interpretations = Some(set);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// What a successful cycle hands back to its completed capabilities.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    pub cycle_id: Uuid,
    pub query: Query,
    pub response: String,
    pub confidence: f64,
    pub settings: Arc<Settings>,
}

/// Capability health information
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
}

impl Default for CapabilityHealth {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
            details: None,
            uptime_seconds: 0,
            total_requests: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
        }
    }
}

/// Request/error counters shared by the built-in capabilities.
#[derive(Debug)]
pub struct CallCounters {
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_micros: AtomicU64,
    start_time: Instant,
}

impl Default for CallCounters {
    fn default() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl CallCounters {
    pub fn record<T, E>(&self, result: &Result<T, E>, elapsed: Duration) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn health(&self, details: Option<String>) -> CapabilityHealth {
        let requests = self.request_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let micros = self.total_micros.load(Ordering::Relaxed);
        let status = if requests > 0 && errors * 2 > requests {
            "degraded"
        } else {
            "healthy"
        };

        CapabilityHealth {
            status: status.to_string(),
            details,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_requests: requests,
            error_count: errors,
            average_response_time_ms: if requests == 0 {
                0.0
            } else {
                micros as f64 / requests as f64 / 1_000.0
            },
        }
    }
}
