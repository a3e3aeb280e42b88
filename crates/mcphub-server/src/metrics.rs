//! Hub metrics: counters, gauges and latency histograms.
//!
//! Values are updated lock-free where possible; histograms keep a bounded
//! sample reservoir from which percentiles are computed on demand. Export
//! format is the embedding layer's concern; [`MetricsSnapshot`] is the
//! typed boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Bounded histogram sample count
const HISTOGRAM_CAPACITY: usize = 2048;

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Signed gauge
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Set the value
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Increment by one
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one
    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Latency histogram with a bounded reservoir
#[derive(Debug)]
pub struct Histogram {
    samples: Mutex<VecDeque<f64>>,
    count: AtomicU64,
}

impl Histogram {
    /// Create an empty histogram
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(HISTOGRAM_CAPACITY)),
            count: AtomicU64::new(0),
        }
    }

    /// Record a duration sample
    pub fn record(&self, value: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        if samples.len() >= HISTOGRAM_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(value.as_secs_f64() * 1000.0);
    }

    /// Total recorded samples (including evicted ones)
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Percentile in milliseconds over the retained reservoir
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted.get(rank.min(sorted.len() - 1)).copied()
    }

    /// p50/p95/p99 summary
    #[must_use]
    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count(),
            p50_ms: self.percentile(50.0),
            p95_ms: self.percentile(95.0),
            p99_ms: self.percentile(99.0),
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile summary of a histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Total samples recorded
    pub count: u64,
    /// Median latency in milliseconds
    pub p50_ms: Option<f64>,
    /// 95th percentile latency in milliseconds
    pub p95_ms: Option<f64>,
    /// 99th percentile latency in milliseconds
    pub p99_ms: Option<f64>,
}

/// The hub's metric set
#[derive(Debug, Default)]
pub struct HubMetrics {
    /// Downstream requests handled
    pub requests: Counter,
    /// Tool calls forwarded
    pub tool_calls: Counter,
    /// Errors surfaced
    pub errors: Counter,
    /// Connected upstream servers
    pub connected_upstreams: Gauge,
    /// Active sessions
    pub active_sessions: Gauge,
    /// Active progress streams
    pub active_streams: Gauge,
    /// Downstream request latency
    pub request_latency: Histogram,
    /// Upstream call latency
    pub call_latency: Histogram,
}

impl HubMetrics {
    /// Create a fresh metric set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a point-in-time snapshot
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.get(),
            tool_calls: self.tool_calls.get(),
            errors: self.errors.get(),
            connected_upstreams: self.connected_upstreams.get(),
            active_sessions: self.active_sessions.get(),
            active_streams: self.active_streams.get(),
            request_latency: self.request_latency.summary(),
            call_latency: self.call_latency.summary(),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Downstream requests handled
    pub requests: u64,
    /// Tool calls forwarded
    pub tool_calls: u64,
    /// Errors surfaced
    pub errors: u64,
    /// Connected upstream servers
    pub connected_upstreams: i64,
    /// Active sessions
    pub active_sessions: i64,
    /// Active progress streams
    pub active_streams: i64,
    /// Downstream request latency summary
    pub request_latency: HistogramSummary,
    /// Upstream call latency summary
    pub call_latency: HistogramSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let metrics = HubMetrics::new();
        metrics.requests.incr();
        metrics.requests.add(2);
        metrics.connected_upstreams.set(3);
        metrics.connected_upstreams.decr();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.connected_upstreams, 2);
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = Histogram::new();
        for ms in 1..=100u64 {
            histogram.record(Duration::from_millis(ms));
        }

        let summary = histogram.summary();
        assert_eq!(summary.count, 100);
        let p50 = summary.p50_ms.unwrap();
        let p99 = summary.p99_ms.unwrap();
        assert!((45.0..=55.0).contains(&p50), "p50 was {p50}");
        assert!(p99 >= 95.0, "p99 was {p99}");
    }

    #[test]
    fn test_histogram_empty() {
        let histogram = Histogram::new();
        assert_eq!(histogram.percentile(50.0), None);
        assert_eq!(histogram.summary().count, 0);
    }

    #[test]
    fn test_histogram_reservoir_bounded() {
        let histogram = Histogram::new();
        for _ in 0..(HISTOGRAM_CAPACITY + 100) {
            histogram.record(Duration::from_millis(1));
        }
        assert_eq!(histogram.count(), (HISTOGRAM_CAPACITY + 100) as u64);
        assert!(histogram.samples.lock().len() <= HISTOGRAM_CAPACITY);
    }
}
