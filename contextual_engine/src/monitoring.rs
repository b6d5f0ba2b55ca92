//! Per-cycle performance statistics feeding adaptive scaling and status reports.

use crate::types::ComplexityLevel;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of one finished cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleSample {
    pub level: Option<ComplexityLevel>,
    pub success: bool,
    pub confidence: f64,
    pub duration: Duration,
}

/// Running totals for one complexity level.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelStats {
    pub cycles: u64,
    pub successes: u64,
    pub average_confidence: f64,
    pub average_duration_ms: f64,
}

impl LevelStats {
    fn record(&mut self, sample: &CycleSample) {
        self.cycles += 1;
        if sample.success {
            self.successes += 1;
        }
        let n = self.cycles as f64;
        self.average_confidence += (sample.confidence - self.average_confidence) / n;
        let ms = sample.duration.as_secs_f64() * 1_000.0;
        self.average_duration_ms += (ms - self.average_duration_ms) / n;
    }

    pub fn success_rate(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.successes as f64 / self.cycles as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub overall_success_rate: f64,
    /// Success rate over the recent window; `None` until a cycle is recorded.
    pub recent_success_rate: Option<f64>,
    pub recent_samples: usize,
    pub levels: BTreeMap<ComplexityLevel, LevelStats>,
}

/// Thread-safe cycle recorder shared by concurrent cycles.
#[derive(Debug)]
pub struct PerformanceMonitor {
    levels: DashMap<ComplexityLevel, LevelStats>,
    recent: Mutex<VecDeque<bool>>,
    window: AtomicU64,
    total: AtomicU64,
    successes: AtomicU64,
}

impl PerformanceMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            levels: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(window)),
            window: AtomicU64::new(window.max(1) as u64),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
        }
    }

    pub fn set_window(&self, window: usize) {
        let window = window.max(1);
        self.window.store(window as u64, Ordering::Relaxed);
        let mut recent = self.recent.lock();
        while recent.len() > window {
            recent.pop_front();
        }
    }

    pub fn record(&self, sample: CycleSample) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if sample.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(level) = sample.level {
            self.levels.entry(level).or_default().record(&sample);
        }

        let window = self.window.load(Ordering::Relaxed) as usize;
        let mut recent = self.recent.lock();
        recent.push_back(sample.success);
        while recent.len() > window {
            recent.pop_front();
        }
    }

    /// Success rate over the recent window together with the sample count.
    pub fn recent_success_rate(&self) -> (Option<f64>, usize) {
        let recent = self.recent.lock();
        if recent.is_empty() {
            return (None, 0);
        }
        let ok = recent.iter().filter(|s| **s).count();
        (Some(ok as f64 / recent.len() as f64), recent.len())
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let (recent_success_rate, recent_samples) = self.recent_success_rate();
        PerformanceSnapshot {
            total_cycles: total,
            successful_cycles: successes,
            overall_success_rate: if total == 0 {
                0.0
            } else {
                successes as f64 / total as f64
            },
            recent_success_rate,
            recent_samples,
            levels: self
                .levels
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        }
    }

    pub fn clear(&self) {
        self.levels.clear();
        self.recent.lock().clear();
        self.total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(level: ComplexityLevel, success: bool) -> CycleSample {
        CycleSample {
            level: Some(level),
            success,
            confidence: if success { 80.0 } else { 0.0 },
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn recent_window_is_bounded() {
        let monitor = PerformanceMonitor::new(3);
        monitor.record(sample(ComplexityLevel::Atom, false));
        for _ in 0..3 {
            monitor.record(sample(ComplexityLevel::Cell, true));
        }
        assert_eq!(monitor.recent_success_rate(), (Some(1.0), 3));

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total_cycles, 4);
        assert_eq!(snapshot.overall_success_rate, 0.75);
        assert_eq!(snapshot.levels[&ComplexityLevel::Cell].cycles, 3);
        assert_eq!(snapshot.levels[&ComplexityLevel::Atom].success_rate(), 0.0);
    }

    #[test]
    fn per_level_averages() {
        let monitor = PerformanceMonitor::default();
        monitor.record(sample(ComplexityLevel::Organ, true));
        monitor.record(sample(ComplexityLevel::Organ, false));
        let stats = &monitor.snapshot().levels[&ComplexityLevel::Organ];
        assert_eq!(stats.average_confidence, 40.0);
        assert!((stats.average_duration_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn clear_resets_everything() {
        let monitor = PerformanceMonitor::default();
        monitor.record(sample(ComplexityLevel::Atom, true));
        monitor.clear();
        assert_eq!(monitor.recent_success_rate(), (None, 0));
        assert_eq!(monitor.snapshot().total_cycles, 0);
    }
}
