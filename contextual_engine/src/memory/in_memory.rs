//! In-process memory store.

use super::consolidation::{self, total_tokens};
use super::{
    assess_reasoning_value, reestimate_reasoning_value, CompressionTier, ConsolidationReport,
    Fingerprint, MemoryRecord, MemoryStats, MemoryStore, ScoredRecord, StoreAck,
};
use crate::error::{EngineError, EngineResult};
use crate::settings::MemoryConfig;
use crate::text;
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// HashMap-backed store guarded by an async `RwLock`.
#[derive(Debug)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, MemoryRecord>>,
    policy: parking_lot::RwLock<MemoryConfig>,
    clock: AtomicU64,
    stores: AtomicU64,
    retrievals: AtomicU64,
    consolidations: AtomicU64,
}

impl InMemoryStore {
    pub fn new(policy: MemoryConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            policy: parking_lot::RwLock::new(policy),
            clock: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            retrievals: AtomicU64::new(0),
            consolidations: AtomicU64::new(0),
        }
    }

    pub fn with_budget(self, budget_tokens: usize) -> Self {
        self.policy.write().budget_tokens = budget_tokens;
        self
    }

    pub fn with_consolidation_frequency(self, frequency: usize) -> Self {
        self.policy.write().consolidation_frequency = frequency;
        self
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn validate(key: &str, content: &str, priority: f64) -> EngineResult<()> {
        if key.trim().is_empty() {
            return Err(EngineError::Validation("memory key cannot be empty".to_string()));
        }
        if content.trim().is_empty() {
            return Err(EngineError::Validation(
                "cannot store empty content in memory".to_string(),
            ));
        }
        if !priority.is_finite() || !(0.0..=1.0).contains(&priority) {
            return Err(EngineError::Validation(format!(
                "priority must be within [0, 1], got {priority}"
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    #[instrument(skip(self, content))]
    async fn store(&self, key: &str, content: &str, priority: f64) -> EngineResult<StoreAck> {
        Self::validate(key, content, priority)?;

        let tick = self.tick();
        let now = Utc::now();
        let reasoning_value = assess_reasoning_value(content, priority);
        let tokens = text::estimate_tokens(content);

        let mut records = self.records.write().await;
        let access_count = records.get(key).map(|r| r.access_count).unwrap_or(0);
        let replaced = records
            .insert(
                key.to_string(),
                MemoryRecord {
                    key: key.to_string(),
                    content: content.to_string(),
                    priority,
                    reasoning_value,
                    tokens,
                    tier: CompressionTier::Original,
                    fingerprint: Fingerprint::of(content),
                    created_at: now,
                    last_access: now,
                    last_tick: tick,
                    access_count,
                },
            )
            .is_some();

        let stores = self.stores.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = self.policy.read().clone();
        let consolidation = if policy.consolidation_frequency > 0
            && stores % policy.consolidation_frequency as u64 == 0
        {
            self.consolidations.fetch_add(1, Ordering::Relaxed);
            Some(consolidation::consolidate(&mut records, &policy, tick))
        } else {
            None
        };

        debug!(reasoning_value, tokens, replaced, "memory record stored");
        Ok(StoreAck {
            key: key.to_string(),
            reasoning_value,
            tokens,
            replaced,
            consolidation,
        })
    }

    #[instrument(skip(self, fingerprint))]
    async fn retrieve(&self, fingerprint: &Fingerprint, max_results: usize) -> Vec<ScoredRecord> {
        if max_results == 0 {
            return Vec::new();
        }
        let tick = self.tick();
        self.retrievals.fetch_add(1, Ordering::Relaxed);

        let mut scored: Vec<(bool, f64, f64, String)> = {
            let records = self.records.read().await;
            records
                .values()
                .filter_map(|record| {
                    let exact = record.fingerprint.digest == fingerprint.digest;
                    let semantic = fingerprint.similarity(&record.fingerprint);
                    if semantic <= 0.0 && !exact {
                        return None;
                    }
                    let frequency = (record.access_count as f64 / 10.0).min(1.0);
                    let relevance = 0.45 * semantic
                        + 0.2 * record.reasoning_value
                        + 0.2 * record.recency(tick)
                        + 0.15 * frequency;
                    Some((exact, relevance, semantic, record.key.clone()))
                })
                .collect()
        };

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(CmpOrdering::Equal))
                .then_with(|| a.3.cmp(&b.3))
        });
        scored.truncate(max_results);

        let mut records = self.records.write().await;
        let now = Utc::now();
        let results: Vec<ScoredRecord> = scored
            .into_iter()
            .filter_map(|(exact, relevance, semantic, key)| {
                let record = records.get_mut(&key)?;
                record.last_tick = tick;
                record.last_access = now;
                record.access_count += 1;
                record.reasoning_value = reestimate_reasoning_value(record.reasoning_value, semantic);
                Some(ScoredRecord {
                    record: record.clone(),
                    relevance,
                    exact,
                })
            })
            .collect();

        debug!(results = results.len(), "memory retrieval finished");
        results
    }

    #[instrument(skip(self))]
    async fn consolidate(&self) -> ConsolidationReport {
        let policy = self.policy.read().clone();
        let mut records = self.records.write().await;
        let now_tick = self.clock.load(Ordering::SeqCst);
        self.consolidations.fetch_add(1, Ordering::Relaxed);
        consolidation::consolidate(&mut records, &policy, now_tick)
    }

    async fn get(&self, key: &str) -> Option<MemoryRecord> {
        self.records.read().await.get(key).cloned()
    }

    async fn clear(&self) {
        let mut records = self.records.write().await;
        records.clear();
        info!("Memory store cleared");
    }

    async fn stats(&self) -> MemoryStats {
        let records = self.records.read().await;
        let budget_tokens = self.policy.read().budget_tokens;
        let total = total_tokens(&records);
        MemoryStats {
            records: records.len(),
            consolidated_records: records.values().filter(|r| r.is_consolidated()).count(),
            total_tokens: total,
            budget_tokens,
            budget_utilization: total as f64 / budget_tokens.max(1) as f64,
            stores: self.stores.load(Ordering::Relaxed),
            retrievals: self.retrievals.load(Ordering::Relaxed),
            consolidations: self.consolidations.load(Ordering::Relaxed),
        }
    }

    fn set_policy(&self, policy: MemoryConfig) {
        *self.policy.write() = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::default().with_consolidation_frequency(0)
    }

    #[tokio::test]
    async fn stored_record_ranks_first_for_its_own_fingerprint() {
        let memory = store();
        memory.store("a", "ownership moves values between bindings", 0.5).await.unwrap();
        memory.store("b", "borrowing lends values without moving ownership", 0.9).await.unwrap();
        memory.store("c", "lifetimes bound how long borrows live", 0.9).await.unwrap();

        let results = memory
            .retrieve(&Fingerprint::of("ownership moves values between bindings"), 5)
            .await;
        assert_eq!(results[0].record.key, "a");
        assert!(results[0].exact);
        assert!(results.iter().all(|r| r.record.key != "c"));
    }

    #[tokio::test]
    async fn retrieval_updates_access_metadata() {
        let memory = store();
        let ack = memory.store("k", "cache invalidation strategy", 0.5).await.unwrap();
        memory.retrieve(&Fingerprint::of("cache invalidation strategy"), 1).await;

        let record = memory.get("k").await.unwrap();
        assert_eq!(record.access_count, 1);
        assert_ne!(record.reasoning_value, ack.reasoning_value);
        assert_eq!(memory.stats().await.retrievals, 1);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let memory = store();
        assert!(matches!(
            memory.store("", "x", 0.5).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            memory.store("k", "   ", 0.5).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            memory.store("k", "x", 1.5).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn consolidation_respects_budget_and_is_idempotent() {
        let memory = store().with_budget(60);
        for i in 0..6 {
            let content = format!(
                "Entry {i} describes a long observation. {}",
                "details ".repeat(20)
            );
            memory.store(&format!("k{i}"), &content, 0.3).await.unwrap();
        }
        assert!(memory.stats().await.total_tokens > 60);

        let first = memory.consolidate().await;
        assert!(first.changed() > 0);
        assert!(memory.stats().await.total_tokens <= 60);

        let second = memory.consolidate().await;
        assert_eq!(second.changed(), 0);
    }

    #[tokio::test]
    async fn frequency_triggers_automatic_consolidation() {
        let memory = InMemoryStore::default()
            .with_budget(10)
            .with_consolidation_frequency(2);
        let first = memory.store("a", &"word ".repeat(40), 0.2).await.unwrap();
        let second = memory.store("b", &"term ".repeat(40), 0.2).await.unwrap();
        assert!(first.consolidation.is_none());
        assert!(second.consolidation.unwrap().changed() > 0);
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let memory = store();
        memory.store("a", "something", 0.5).await.unwrap();
        memory.clear().await;
        assert_eq!(memory.stats().await.records, 0);
        assert!(memory.get("a").await.is_none());
    }
}
