use analysis_core::AnalysisMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the running aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub timeouts: u64,
    pub rejections: u64,
    pub by_mode: BTreeMap<String, u64>,
}

/// Lock-free request counters shared by every in-flight request.
#[derive(Debug, Default)]
pub struct StatsCollector {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    timeouts: AtomicU64,
    rejections: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
    single: AtomicU64,
    sector: AtomicU64,
    multiple: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request passed validation and got a handle.
    pub fn record_request(&self, mode: AnalysisMode) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let per_mode = match mode {
            AnalysisMode::Single => &self.single,
            AnalysisMode::Sector => &self.sector,
            AnalysisMode::Multiple => &self.multiple,
        };
        per_mode.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, latency: Duration, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.record_latency(latency);
    }

    pub fn record_timeout(&self, latency: Duration) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Validation or capacity rejection; never counted as a request.
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        ratio(
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed) + self.cache_misses.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let latency_us = self.latency_total_us.load(Ordering::Relaxed);

        let mut by_mode = BTreeMap::new();
        by_mode.insert(AnalysisMode::Single.as_str().to_string(), self.single.load(Ordering::Relaxed));
        by_mode.insert(AnalysisMode::Sector.as_str().to_string(), self.sector.load(Ordering::Relaxed));
        by_mode.insert(AnalysisMode::Multiple.as_str().to_string(), self.multiple.load(Ordering::Relaxed));

        StatsSnapshot {
            total_requests: total,
            successes: self.successes.load(Ordering::Relaxed),
            failures,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            avg_latency_ms: if samples == 0 {
                0.0
            } else {
                latency_us as f64 / samples as f64 / 1000.0
            },
            error_rate: ratio(failures + timeouts, total),
            timeouts,
            rejections: self.rejections.load(Ordering::Relaxed),
            by_mode,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
