use std::sync::atomic::{AtomicU64, Ordering};

pub use tokio::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic time source used for every latency measurement.
///
/// Backed by the tokio clock so that paused-time tests observe exact durations.
pub fn now() -> Instant {
    Instant::now()
}

/// Process-wide, strictly increasing request id.
///
/// Ids are never reused while the process lives, so they are unique within
/// any single session and increase in send order.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide session id, used to tag latency samples.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}
