//! # Monitoring
//!
//! Latency samples and hit/miss counters for the primary operations.
//! Disabled by default; enabling it costs one lock acquisition per
//! operation. Samples are kept in a bounded window so a long-lived cache
//! cannot grow its telemetry without limit.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Primary operations tracked by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `get` latency
    Get,
    /// `put` latency
    Put,
    /// `delete` latency
    Delete,
}

impl Operation {
    /// Stable name used as the report key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Delete => "delete",
        }
    }
}

/// Summary of one operation's latency samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Number of samples in the window
    pub count: usize,

    /// Mean latency in microseconds
    pub avg_us: u64,

    /// Median latency in microseconds
    pub p50_us: u64,

    /// 95th percentile latency in microseconds
    pub p95_us: u64,

    /// 99th percentile latency in microseconds
    pub p99_us: u64,
}

/// Snapshot of every monitored counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfReport {
    /// Latency summaries keyed by operation name
    pub operations: HashMap<String, LatencySummary>,

    /// Cache hits observed
    pub hits: u64,

    /// Cache misses observed
    pub misses: u64,

    /// hits / (hits + misses)
    pub hit_rate: f64,
}

struct PerfInner {
    enabled: bool,
    samples: HashMap<Operation, VecDeque<Duration>>,
    hits: u64,
    misses: u64,
}

/// Latency and hit-rate monitor.
pub struct PerfMonitor {
    inner: RwLock<PerfInner>,
}

/// Samples retained per operation.
const MAX_SAMPLES: usize = 10_000;

impl Default for PerfMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfMonitor {
    /// Create a disabled monitor.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PerfInner {
                enabled: false,
                samples: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Start collecting samples.
    pub fn enable(&self) {
        self.inner.write().enabled = true;
        log::info!("cache monitoring enabled");
    }

    /// Whether the monitor is collecting.
    pub fn is_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Record one operation latency.
    pub fn record_latency(&self, op: Operation, elapsed: Duration) {
        let mut inner = self.inner.write();
        if !inner.enabled {
            return;
        }
        let samples = inner.samples.entry(op).or_default();
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    /// Record a cache hit.
    pub fn record_hit(&self) {
        let mut inner = self.inner.write();
        if inner.enabled {
            inner.hits += 1;
        }
    }

    /// Record a cache miss.
    pub fn record_miss(&self) {
        let mut inner = self.inner.write();
        if inner.enabled {
            inner.misses += 1;
        }
    }

    /// Build a report over the current sample window.
    pub fn report(&self) -> PerfReport {
        let inner = self.inner.read();
        let mut report = PerfReport {
            hits: inner.hits,
            misses: inner.misses,
            ..Default::default()
        };
        let total = inner.hits + inner.misses;
        if total > 0 {
            report.hit_rate = inner.hits as f64 / total as f64;
        }

        for (op, samples) in &inner.samples {
            report
                .operations
                .insert(op.as_str().to_string(), summarize(samples));
        }
        report
    }
}

fn summarize(samples: &VecDeque<Duration>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted: Vec<u64> = samples.iter().map(|d| d.as_micros() as u64).collect();
    sorted.sort_unstable();

    let sum: u64 = sorted.iter().sum();
    LatencySummary {
        count: sorted.len(),
        avg_us: sum / sorted.len() as u64,
        p50_us: percentile(&sorted, 50),
        p95_us: percentile(&sorted, 95),
        p99_us: percentile(&sorted, 99),
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let idx = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[idx]
}
