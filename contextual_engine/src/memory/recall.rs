//! Memory as a reasoning capability: recall on invoke, store on commit.

use super::{Fingerprint, MemoryStore};
use crate::capability::{
    CallCounters, Capability, CapabilityHealth, CapabilityOutput, CapabilityRequest, CycleCommit,
};
use crate::error::SubsystemFailure;
use crate::types::SubsystemKind;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

pub struct MemoryRecall {
    store: Arc<dyn MemoryStore>,
    counters: CallCounters,
}

impl MemoryRecall {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            counters: CallCounters::default(),
        }
    }
}

#[async_trait]
impl Capability for MemoryRecall {
    fn name(&self) -> &str {
        "memory_recall"
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Memory
    }

    #[instrument(skip_all, fields(cycle = %request.cycle_id))]
    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let started = Instant::now();
        let fingerprint = Fingerprint::of(&request.query.text);
        let recalled = self
            .store
            .retrieve(&fingerprint, request.settings.memory.max_results)
            .await;

        let output = match recalled.first() {
            None => CapabilityOutput::new("No related memories.", 0.3),
            Some(best) => {
                let semantic = fingerprint.similarity(&best.record.fingerprint);
                let lines = recalled
                    .iter()
                    .map(|r| format!("({:.2}) {}", r.relevance, r.record.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                CapabilityOutput::new(
                    format!("Recalled {} related memories:\n{lines}", recalled.len()),
                    0.5 + 0.5 * semantic,
                )
                .with_summary(format!(
                    "{} memories, best relevance {:.2}",
                    recalled.len(),
                    best.relevance
                ))
            }
        }
        .with_details(json!({
            "keys": recalled.iter().map(|r| r.record.key.as_str()).collect::<Vec<_>>(),
            "exact_match": recalled.first().is_some_and(|r| r.exact),
        }));

        let result = Ok(output);
        self.counters.record(&result, started.elapsed());
        result
    }

    async fn health_check(&self) -> CapabilityHealth {
        let stats = self.store.stats().await;
        self.counters.health(Some(format!(
            "{} records, {}/{} tokens",
            stats.records, stats.total_tokens, stats.budget_tokens
        )))
    }

    #[instrument(skip_all, fields(cycle = %commit.cycle_id))]
    async fn commit(&self, commit: &CycleCommit) -> Result<(), SubsystemFailure> {
        let content = format!("Query: {}\nResponse: {}", commit.query.text, commit.response);
        let priority = (commit.confidence / 100.0).clamp(0.0, 1.0);
        let ack = self
            .store
            .store(&format!("cycle:{}", commit.cycle_id), &content, priority)
            .await
            .map_err(|e| SubsystemFailure::failed("store_rejected", e.to_string()))?;

        if ack.consolidation.is_none() {
            let stats = self.store.stats().await;
            if stats.total_tokens > stats.budget_tokens {
                let report = self.store.consolidate().await;
                if report.over_budget {
                    warn!(tokens = report.tokens_after, "memory remains over budget");
                }
            }
        }
        debug!(key = %ack.key, reasoning_value = ack.reasoning_value, "cycle committed to memory");
        Ok(())
    }
}
