//! # Server Metrics
//!
//! Provide lightweight counters and a latency histogram to compute
//! throughput, error rate, and tail latency for the `INFO` command.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Fixed Buckets**: Keep histogram buckets in a contiguous array for cache locality.
//! 3. **Plain Snapshots**: Expose snapshots as plain structs detached from the atomics.
//!
//! ## Notes
//! - Bucket boundaries are expressed in microseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dice_common::DiceErrorCategory;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] =
    [1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000];

/// Snapshot of all server metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total number of commands dispatched.
    pub requests_total: u64,
    /// Total number of error replies sent.
    pub errors_total: u64,
    /// Error replies per category, in [`DiceErrorCategory::ALL`] order.
    pub errors: [u64; 4],
    /// Commands currently being dispatched.
    pub inflight: u64,
    /// Latency histogram snapshot.
    pub latency: LatencySnapshot,
}

impl MetricsSnapshot {
    /// Error replies counted under `category`.
    pub fn errors_in(&self, category: DiceErrorCategory) -> u64 {
        self.errors[slot(category)]
    }
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Returns the upper bucket bound (microseconds) covering quantile `q`.
    ///
    /// Samples in the overflow bucket report the largest finite bound.
    /// Returns 0 when no samples were recorded.
    pub fn quantile_us(&self, q: f64) -> u64 {
        if self.samples == 0 {
            return 0;
        }
        let target = ((self.samples as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, &count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return self
                    .bounds_us
                    .get(idx)
                    .or(self.bounds_us.last())
                    .copied()
                    .unwrap_or(0);
            }
        }
        self.bounds_us.last().copied().unwrap_or(0)
    }

    /// Mean latency in microseconds.
    pub fn mean_us(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.sum_us / self.samples
        }
    }
}

/// Thread-safe metrics aggregator for the server.
///
/// `Ordering::Relaxed` is sufficient because we do not require cross-field
/// ordering, only eventual consistency.
pub struct Metrics {
    requests_total: AtomicU64,
    errors: [AtomicU64; 4],
    inflight: AtomicU64,
    latency: LatencyHistogram,
}

impl Metrics {
    /// Creates a new metrics aggregator with the default latency buckets.
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a new metrics aggregator with custom latency bucket boundaries.
    ///
    /// The boundaries must be sorted ascending and represent microseconds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        Metrics {
            requests_total: AtomicU64::new(0),
            errors: Default::default(),
            inflight: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    /// Records the start of a command.
    pub fn record_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of a command and captures its latency.
    pub fn record_request_end(&self, latency: Duration) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    /// Records an error reply of the given category.
    pub fn record_error(&self, category: DiceErrorCategory) {
        self.errors[slot(category)].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors: [u64; 4] = std::array::from_fn(|idx| self.errors[idx].load(Ordering::Relaxed));
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: errors.iter().sum(),
            errors,
            inflight: self.inflight.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(category: DiceErrorCategory) -> usize {
    match category {
        DiceErrorCategory::Client => 0,
        DiceErrorCategory::Server => 1,
        DiceErrorCategory::Command => 2,
        DiceErrorCategory::Protocol => 3,
    }
}

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; this is O(buckets) but the list is small
/// and stays hot in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with explicit bucket boundaries (microseconds).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();

        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement into the histogram.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let bucket_idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
    pub fn snapshot(&self) -> LatencySnapshot {
        let buckets: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();

        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets,
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
