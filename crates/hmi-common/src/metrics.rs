//! Link metrics collection.
//!
//! [`LinkMetrics`] is shared between a link's engine task and whoever
//! reports on it; counters are lock-free. Round-trip latencies go into a
//! ring buffer-based [`LatencyHistogram`] that does not allocate after
//! construction.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Round-trip latency histogram backed by a ring buffer.
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Ring buffer of latencies in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    /// Total replies recorded.
    total: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u64,
}

impl LatencyHistogram {
    /// Create a histogram retaining `histogram_size` samples (at least one).
    #[must_use]
    pub fn new(histogram_size: usize) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
        }
    }

    /// Record one round-trip latency.
    pub fn record(&mut self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);
    }

    /// Total number of latencies recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Minimum observed latency.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.min_ns))
    }

    /// Maximum observed latency.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Mean latency.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.sum_ns / self.total))
    }

    /// Compute a percentile (0.0 to 100.0) over the retained samples.
    ///
    /// Returns `None` if no samples have been collected or if percentile is out of range.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        self.percentiles(&[percentile]).first().map(|&(_, d)| d)
    }

    /// Compute multiple percentiles with a single sort.
    ///
    /// Invalid percentiles (< 0, > 100, or NaN) are skipped.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, Duration)> {
        if self.sample_count == 0 {
            return vec![];
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        percentiles
            .iter()
            .filter(|p| (0.0..=100.0).contains(*p))
            .map(|&p| {
                let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
                let idx = idx.min(sorted.len() - 1);
                (p, Duration::from_nanos(sorted[idx]))
            })
            .collect()
    }

    /// Get a snapshot of current latency statistics.
    #[must_use]
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            total: self.total,
            min_ns: (self.total > 0).then_some(self.min_ns),
            max_ns: (self.total > 0).then_some(self.max_ns),
            mean_ns: (self.total > 0).then(|| self.sum_ns / self.total),
            p99_ns: self
                .percentile(99.0)
                .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            sample_count: self.sample_count,
        }
    }

    /// Reset all statistics.
    pub fn reset(&mut self) {
        self.samples.fill(0);
        self.write_pos = 0;
        self.sample_count = 0;
        self.total = 0;
        self.min_ns = u64::MAX;
        self.max_ns = 0;
        self.sum_ns = 0;
    }
}

/// Immutable snapshot of latency statistics for reporting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySnapshot {
    /// Total latencies recorded.
    pub total: u64,
    /// Minimum latency in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum latency in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean latency in nanoseconds.
    pub mean_ns: Option<u64>,
    /// 99th percentile latency in nanoseconds.
    pub p99_ns: Option<u64>,
    /// Number of samples in the histogram.
    pub sample_count: usize,
}

/// Per-link counters, shared between the engine and its observers.
#[derive(Debug)]
pub struct LinkMetrics {
    requests: AtomicU64,
    frames_sent: AtomicU64,
    replies: AtomicU64,
    exceptions: AtomicU64,
    correlation_misses: AtomicU64,
    framing_faults: AtomicU64,
    function_mismatches: AtomicU64,
    timeouts: AtomicU64,
    connects: AtomicU64,
    reconnects: AtomicU64,
    connect_failures: AtomicU64,
    discarded_bytes: AtomicU64,
    latency: Mutex<LatencyHistogram>,
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new(1024)
    }
}

macro_rules! counters {
    ($($(#[$doc:meta])* $field:ident => $record:ident;)*) => {
        impl LinkMetrics {
            $(
                $(#[$doc])*
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }

                /// Current value of the counter.
                #[must_use]
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )*
        }
    };
}

counters! {
    /// A request was accepted by the client.
    requests => record_request;
    /// A frame was written and flushed.
    frames_sent => record_frame_sent;
    /// A reply was correlated and dispatched.
    replies => record_reply;
    /// A reply carried a protocol exception.
    exceptions => record_exception;
    /// A reply referenced no in-flight transaction.
    correlation_misses => record_correlation_miss;
    /// A frame failed marker or trailer validation.
    framing_faults => record_framing_fault;
    /// A reply's function code differed from its request's.
    function_mismatches => record_function_mismatch;
    /// An in-flight transaction expired.
    timeouts => record_timeout;
    /// A transport was established.
    connects => record_connect;
    /// An established transport was lost.
    reconnects => record_reconnect;
    /// A connect (or accept) attempt failed.
    connect_failures => record_connect_failure;
}

impl LinkMetrics {
    /// Create metrics retaining `histogram_size` latency samples.
    #[must_use]
    pub fn new(histogram_size: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            replies: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            correlation_misses: AtomicU64::new(0),
            framing_faults: AtomicU64::new(0),
            function_mismatches: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            discarded_bytes: AtomicU64::new(0),
            latency: Mutex::new(LatencyHistogram::new(histogram_size)),
        }
    }

    /// Count bytes left unconsumed by a decoder.
    pub fn record_discarded(&self, bytes: usize) {
        self.discarded_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes discarded so far.
    #[must_use]
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes.load(Ordering::Relaxed)
    }

    /// Record a request/reply round trip.
    pub fn record_latency(&self, latency: Duration) {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency);
    }

    /// Get a snapshot of all counters and latency statistics.
    #[must_use]
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            requests: self.requests(),
            frames_sent: self.frames_sent(),
            replies: self.replies(),
            exceptions: self.exceptions(),
            correlation_misses: self.correlation_misses(),
            framing_faults: self.framing_faults(),
            function_mismatches: self.function_mismatches(),
            timeouts: self.timeouts(),
            connects: self.connects(),
            reconnects: self.reconnects(),
            connect_failures: self.connect_failures(),
            discarded_bytes: self.discarded_bytes(),
            latency: self
                .latency
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot(),
        }
    }
}

/// Point-in-time copy of [`LinkMetrics`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[allow(missing_docs)]
pub struct LinkMetricsSnapshot {
    pub requests: u64,
    pub frames_sent: u64,
    pub replies: u64,
    pub exceptions: u64,
    pub correlation_misses: u64,
    pub framing_faults: u64,
    pub function_mismatches: u64,
    pub timeouts: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub discarded_bytes: u64,
    pub latency: LatencySnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_recording() {
        let mut hist = LatencyHistogram::new(100);

        hist.record(Duration::from_micros(500));
        hist.record(Duration::from_micros(600));
        hist.record(Duration::from_micros(550));

        assert_eq!(hist.total(), 3);
        assert_eq!(hist.min(), Some(Duration::from_micros(500)));
        assert_eq!(hist.max(), Some(Duration::from_micros(600)));
        assert_eq!(hist.mean(), Some(Duration::from_micros(550)));
    }

    #[test]
    fn test_percentile_calculation() {
        let mut hist = LatencyHistogram::new(100);

        for i in 1..=100 {
            hist.record(Duration::from_micros(i));
        }

        let p50 = hist.percentile(50.0).unwrap();
        assert!(p50.as_micros() >= 49 && p50.as_micros() <= 51);

        let p99 = hist.percentile(99.0).unwrap();
        assert!(p99.as_micros() >= 98 && p99.as_micros() <= 100);

        assert!(hist.percentile(-1.0).is_none());
        assert!(hist.percentile(f64::NAN).is_none());
        let results = hist.percentiles(&[-10.0, 50.0, 150.0, 99.0]);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_ring_buffer_wrapping() {
        let mut hist = LatencyHistogram::new(10);

        for i in 0..25 {
            hist.record(Duration::from_micros(i));
        }

        assert_eq!(hist.total(), 25);
        assert_eq!(hist.snapshot().sample_count, 10);

        hist.reset();
        assert_eq!(hist.total(), 0);
        assert!(hist.min().is_none());
    }

    #[test]
    fn test_link_counters() {
        let metrics = LinkMetrics::new(16);
        metrics.record_request();
        metrics.record_request();
        metrics.record_correlation_miss();
        metrics.record_discarded(3);
        metrics.record_latency(Duration::from_millis(4));

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.correlation_misses, 1);
        assert_eq!(snap.discarded_bytes, 3);
        assert_eq!(snap.replies, 0);
        assert_eq!(snap.latency.total, 1);
        assert_eq!(snap.latency.max_ns, Some(4_000_000));
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = LinkMetrics::default();
        metrics.record_timeout();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["timeouts"], 1);
        assert!(json["latency"]["min_ns"].is_null());
    }
}
