use hdrhistogram::Histogram;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{GaleError, LatencySample, SessionOutcome, TimeoutKind};

/// Highest latency the histograms can represent: one hour, in microseconds
const MAX_TRACKABLE_US: u64 = 3_600_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_TRACKABLE_US, SIGNIFICANT_DIGITS)
        .expect("histogram bounds are constant and valid")
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    unmatched: AtomicU64,
    lost: AtomicU64,
    sessions: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    connect_errors: AtomicU64,
    transport_errors: AtomicU64,
    timed_out: AtomicU64,
    handshake_timeouts: AtomicU64,
    close_timeouts: AtomicU64,
    fifo_sessions: AtomicU64,
    overruns: AtomicU64,
    skipped: AtomicU64,
}

/// Thread-safe accumulator shared by every virtual user.
///
/// Counters are plain atomics. Latencies go into one of several histogram
/// shards picked by session id, so concurrent sessions rarely contend on the
/// same lock. All recording operations commute.
#[derive(Debug)]
pub struct MetricsAggregator {
    counters: Counters,
    shards: Box<[Mutex<Histogram<u64>>]>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(parallelism * 4)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(new_histogram()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            counters: Counters::default(),
            shards,
        }
    }

    fn shard(&self, session_id: u64) -> MutexGuard<'_, Histogram<u64>> {
        let index = (session_id % self.shards.len() as u64) as usize;
        // A poisoned shard still holds valid counts.
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_sent(&self) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, sample: LatencySample) {
        let micros = u64::try_from(sample.latency.as_micros()).unwrap_or(u64::MAX);
        self.shard(sample.session_id).saturating_record(micros);
    }

    pub fn record_unmatched(&self) {
        self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, count: u64) {
        if count > 0 {
            self.counters.lost.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_outcome(&self, outcome: &SessionOutcome) {
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        match outcome {
            SessionOutcome::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            SessionOutcome::Errored(error) => {
                self.counters.errored.fetch_add(1, Ordering::Relaxed);
                match error {
                    GaleError::Connect(_) => {
                        self.counters.connect_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    GaleError::Transport(_) | GaleError::Io(_) => {
                        self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            SessionOutcome::TimedOut(kind) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                match kind {
                    TimeoutKind::Handshake => {
                        self.counters.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    TimeoutKind::Close => {
                        self.counters.close_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    TimeoutKind::Response => {}
                }
            }
        }
    }

    /// A session opened in FIFO correlation mode
    pub fn record_degraded_correlation(&self) {
        self.counters.fifo_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// A runner that ignored cancellation and had to be aborted
    pub fn record_overrun(&self) {
        self.counters.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// A virtual user cancelled before its session could start
    pub fn record_skipped(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent copy of everything recorded so far.
    ///
    /// Holds at most one shard lock at a time, so writers are only ever
    /// delayed by a single histogram merge.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut latency = new_histogram();
        for shard in self.shards.iter() {
            let guard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Same bounds on both sides, so merging cannot fail.
            let _ = latency.add(&*guard);
        }

        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            sent: load(&c.sent),
            // one histogram entry per matched reply
            received: latency.len(),
            unmatched: load(&c.unmatched),
            lost: load(&c.lost),
            sessions: load(&c.sessions),
            completed: load(&c.completed),
            errored: load(&c.errored),
            connect_errors: load(&c.connect_errors),
            transport_errors: load(&c.transport_errors),
            timed_out: load(&c.timed_out),
            handshake_timeouts: load(&c.handshake_timeouts),
            close_timeouts: load(&c.close_timeouts),
            fifo_sessions: load(&c.fifo_sessions),
            overruns: load(&c.overruns),
            skipped: load(&c.skipped),
            latency_summary: LatencySummary::from_histogram(&latency),
            latency,
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency distribution digest, all values in microseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            count: histogram.len(),
            min_us: histogram.min(),
            max_us: histogram.max(),
            mean_us: histogram.mean(),
            p50_us: histogram.value_at_quantile(0.50),
            p90_us: histogram.value_at_quantile(0.90),
            p95_us: histogram.value_at_quantile(0.95),
            p99_us: histogram.value_at_quantile(0.99),
            p999_us: histogram.value_at_quantile(0.999),
        }
    }
}

/// Immutable point-in-time copy of the aggregated metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    /// Replies matched to a request; equals the number of latency samples.
    pub received: u64,
    pub unmatched: u64,
    pub lost: u64,
    pub sessions: u64,
    pub completed: u64,
    pub errored: u64,
    pub connect_errors: u64,
    pub transport_errors: u64,
    pub timed_out: u64,
    pub handshake_timeouts: u64,
    pub close_timeouts: u64,
    pub fifo_sessions: u64,
    pub overruns: u64,
    pub skipped: u64,
    #[serde(rename = "latency")]
    pub latency_summary: LatencySummary,
    #[serde(skip)]
    latency: Histogram<u64>,
}

impl MetricsSnapshot {
    /// Latency at an arbitrary quantile in `[0, 1]`
    pub fn latency_at_quantile(&self, quantile: f64) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency.value_at_quantile(quantile))
    }

    pub fn latency_histogram(&self) -> &Histogram<u64> {
        &self.latency
    }

    /// Every VU that the scheduler accounted for, whatever its fate
    pub fn accounted_vus(&self) -> u64 {
        self.sessions + self.overruns + self.skipped
    }
}
