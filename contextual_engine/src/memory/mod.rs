//! Prioritized memory with budget-aware consolidation.
//!
//! Records carry a reasoning value that is re-estimated whenever a retrieval
//! uses them. When the store grows past its token budget, consolidation
//! compresses the least valuable records first and evicts only when
//! compression is not enough.

use crate::error::EngineResult;
use crate::settings::MemoryConfig;
use crate::text;
use async_trait::async_trait;
use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub mod consolidation;
pub mod in_memory;
pub mod recall;

pub use in_memory::InMemoryStore;
pub use recall::MemoryRecall;

/// Storage interface the orchestrator consumes. Mutations are serialized per
/// store; scoring for retrieval may run concurrently.
#[async_trait]
pub trait MemoryStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace a record.
    async fn store(&self, key: &str, content: &str, priority: f64) -> EngineResult<StoreAck>;

    /// Records most relevant to `fingerprint`, best first.
    async fn retrieve(&self, fingerprint: &Fingerprint, max_results: usize) -> Vec<ScoredRecord>;

    /// Bring the store within budget. Repeating it without an intervening
    /// store reports zero changes.
    async fn consolidate(&self) -> ConsolidationReport;

    async fn get(&self, key: &str) -> Option<MemoryRecord>;

    /// Drop every record.
    async fn clear(&self);

    async fn stats(&self) -> MemoryStats;

    /// Replace the budget and consolidation policy.
    fn set_policy(&self, policy: MemoryConfig);
}

/// Content identity used for retrieval: a token set plus an exact digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub tokens: HashSet<String>,
    pub digest: String,
}

impl Fingerprint {
    pub fn of(content: &str) -> Self {
        let tokens = text::tokenize(content)
            .into_iter()
            .filter(|t| !text::is_stopword(t))
            .collect();
        Self {
            tokens,
            digest: content_digest(content),
        }
    }

    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        text::jaccard(&self.tokens, &other.tokens)
    }
}

/// Create a Blake3 digest of whitespace-normalized, lowercased content.
fn content_digest(content: &str) -> String {
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Hasher::new();
    hasher.update(normalized.as_bytes());
    format!("memory:{}", hasher.finalize().to_hex())
}

/// How far consolidation has shrunk a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionTier {
    Original,
    /// Replaced by a short summary.
    Compressed,
    /// Reduced to key terms.
    Condensed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: String,
    pub content: String,
    pub priority: f64,
    /// Estimated usefulness for future reasoning, in `[0, 1]`.
    pub reasoning_value: f64,
    pub tokens: usize,
    pub tier: CompressionTier,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Logical clock value of the last store or retrieval touching this record.
    pub last_tick: u64,
    pub access_count: u64,
}

impl MemoryRecord {
    pub fn is_consolidated(&self) -> bool {
        self.tier != CompressionTier::Original
    }

    /// Decays with the number of store/retrieve operations since last use.
    pub fn recency(&self, now_tick: u64) -> f64 {
        let age = now_tick.saturating_sub(self.last_tick) as f64;
        1.0 / (1.0 + age / 10.0)
    }
}

const REASONING_INDICATORS: &[&str] = &[
    "analysis", "conclusion", "insight", "pattern", "relationship", "because", "therefore",
    "thus", "consequently", "implies",
];

/// Initial reasoning value of new content at the given caller priority.
pub fn assess_reasoning_value(content: &str, priority: f64) -> f64 {
    let lower = content.to_lowercase();
    let density = (text::count_indicators(&lower, REASONING_INDICATORS) as f64 / 3.0).min(1.0);
    let substance = (content.chars().count() as f64 / 500.0).min(1.0);
    (0.6 * priority + 0.4 * (0.5 * density + 0.5 * substance)).clamp(0.0, 1.0)
}

/// Reasoning value after a retrieval used the record with the given relevance.
pub fn reestimate_reasoning_value(current: f64, relevance: f64) -> f64 {
    (0.85 * current + 0.15 * relevance.clamp(0.0, 1.0) + 0.02).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreAck {
    pub key: String,
    pub reasoning_value: f64,
    pub tokens: usize,
    pub replaced: bool,
    /// Set when this store triggered an automatic consolidation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<ConsolidationReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub relevance: f64,
    pub exact: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub compressed: usize,
    pub condensed: usize,
    pub evicted: usize,
    /// Distinct records compacted or evicted.
    pub records_changed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Protected records alone exceed the budget.
    pub over_budget: bool,
}

impl ConsolidationReport {
    pub fn changed(&self) -> usize {
        self.records_changed
    }
}

/// Memory statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub records: usize,
    pub consolidated_records: usize,
    pub total_tokens: usize,
    pub budget_tokens: usize,
    pub budget_utilization: f64,
    pub stores: u64,
    pub retrievals: u64,
    pub consolidations: u64,
}
