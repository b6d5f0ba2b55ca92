//! Budget enforcement for the memory store.
//!
//! Records are ranked by `0.7 * reasoning_value + 0.3 * recency`, lowest
//! first. Passes run in order until the store fits its budget:
//!
//! 1. compress unprotected records to a summary
//! 2. condense unprotected records to key terms
//! 3. evict unprotected records
//! 4. compress protected records
//!
//! A record is protected when its reasoning value is above the high-water
//! mark. Protected records are never evicted.

use super::{CompressionTier, ConsolidationReport, MemoryRecord};
use crate::settings::MemoryConfig;
use crate::text;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub fn total_tokens(records: &HashMap<String, MemoryRecord>) -> usize {
    records.values().map(|r| r.tokens).sum()
}

/// Consolidation rank of a record; lower values go first.
pub fn rank(record: &MemoryRecord, now_tick: u64) -> f64 {
    0.7 * record.reasoning_value + 0.3 * record.recency(now_tick)
}

fn ranked_keys(records: &HashMap<String, MemoryRecord>, now_tick: u64) -> Vec<String> {
    let mut ranked: Vec<(f64, &String)> = records
        .iter()
        .map(|(key, record)| (rank(record, now_tick), key))
        .collect();
    ranked.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(b.1))
    });
    ranked.into_iter().map(|(_, key)| key.clone()).collect()
}

/// Rewrites a record at `tier` and returns the tokens saved. A record whose
/// replacement would not be smaller is left untouched and saves nothing.
fn shrink(record: &mut MemoryRecord, tier: CompressionTier) -> usize {
    let replacement = match tier {
        CompressionTier::Original => return 0,
        CompressionTier::Compressed => {
            let first = text::sentences(&record.content)
                .first()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("Summary: {}", text::truncate_words(&first, 12))
        }
        CompressionTier::Condensed => {
            let source = record.content.trim_start_matches("Summary: ");
            format!("Key terms: {}", text::key_terms(source, 5).join(", "))
        }
    };

    let new_tokens = text::estimate_tokens(&replacement);
    if new_tokens >= record.tokens {
        return 0;
    }
    let saved = record.tokens - new_tokens;
    record.tier = tier;
    record.content = replacement;
    record.tokens = new_tokens;
    saved
}

/// Brings `records` within `config.budget_tokens`. A no-op when already within budget.
pub fn consolidate(
    records: &mut HashMap<String, MemoryRecord>,
    config: &MemoryConfig,
    now_tick: u64,
) -> ConsolidationReport {
    let budget = config.budget_tokens;
    let tokens_before = total_tokens(records);
    let mut report = ConsolidationReport {
        tokens_before,
        tokens_after: tokens_before,
        ..Default::default()
    };
    if tokens_before <= budget {
        return report;
    }

    let order = ranked_keys(records, now_tick);
    let protected = |r: &MemoryRecord| r.reasoning_value > config.high_water_mark;
    let mut changed: HashSet<String> = HashSet::new();
    let mut total = tokens_before;

    for target in [CompressionTier::Compressed, CompressionTier::Condensed] {
        for key in &order {
            if total <= budget {
                break;
            }
            let Some(record) = records.get_mut(key) else { continue };
            if protected(record) || record.tier >= target {
                continue;
            }
            let saved = shrink(record, target);
            if saved == 0 {
                continue;
            }
            total -= saved;
            changed.insert(key.clone());
            match target {
                CompressionTier::Compressed => report.compressed += 1,
                _ => report.condensed += 1,
            }
        }
    }

    for key in &order {
        if total <= budget {
            break;
        }
        let evict = records.get(key).is_some_and(|r| !protected(r));
        if evict {
            if let Some(record) = records.remove(key) {
                total -= record.tokens;
                changed.insert(key.clone());
                report.evicted += 1;
            }
        }
    }

    for key in &order {
        if total <= budget {
            break;
        }
        let Some(record) = records.get_mut(key) else { continue };
        if protected(record) && record.tier == CompressionTier::Original {
            let saved = shrink(record, CompressionTier::Compressed);
            if saved > 0 {
                total -= saved;
                changed.insert(key.clone());
                report.compressed += 1;
            }
        }
    }

    report.tokens_after = total;
    report.records_changed = changed.len();
    report.over_budget = total > budget;
    if report.over_budget {
        warn!(total, budget, "protected memory records alone exceed the budget");
    }
    debug!(?report, "memory consolidation finished");
    report
}
