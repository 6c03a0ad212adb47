use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use gale_client::{ConnectionSession, Connector};
use gale_core::{MetricsAggregator, SessionState, VirtualUserConfig};

/// What a runner did before it returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSummary {
    pub vu_id: u64,
    pub sessions: u64,
    /// Cancelled before its first session started
    pub skipped: bool,
}

/// Drives the session(s) of one virtual user.
///
/// The runner waits for its ramp-up offset and a concurrency slot, then runs
/// one session, or keeps starting fresh sessions until cancelled when the
/// config asks for repeat sessions. Every session outcome is recorded here.
pub struct VirtualUserRunner {
    vu_id: u64,
    start_offset: Duration,
    config: Arc<VirtualUserConfig>,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsAggregator>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl VirtualUserRunner {
    /// Create a runner together with a receiver that follows its current
    /// session's state.
    pub fn new(
        vu_id: u64,
        config: Arc<VirtualUserConfig>,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsAggregator>,
        slots: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let runner = Self {
            vu_id,
            start_offset: Duration::ZERO,
            config,
            connector,
            metrics,
            slots,
            cancel,
            state_tx: Arc::new(state_tx),
        };
        (runner, state_rx)
    }

    /// Delay the first session by `offset` from the start of the run
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub async fn run(self) -> RunnerSummary {
        let cancel = self.cancel.clone();

        if !self.start_offset.is_zero() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return self.skip("cancelled during ramp-up"),
                _ = sleep(self.start_offset) => {}
            }
        }

        let slots = self.slots.clone();
        let _permit = tokio::select! {
            biased;

            _ = cancel.cancelled() => return self.skip("cancelled while waiting for a slot"),
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.skip("concurrency slots closed"),
            },
        };

        let mut sessions = 0u64;
        loop {
            let session = ConnectionSession::new(
                self.config.clone(),
                self.connector.clone(),
                self.metrics.clone(),
                self.cancel.clone(),
            )
            .with_state_observer(self.state_tx.clone());
            let session_id = session.id();

            let report = session.run().await;
            trace!(
                "VU {} session {} finished: {:?} ({:?})",
                self.vu_id,
                session_id,
                report.outcome,
                report.tally
            );
            self.metrics.record_outcome(&report.outcome);
            sessions += 1;

            if !self.config.repeat_sessions || self.cancel.is_cancelled() {
                break;
            }
            // Failed connections are not retried.
            if report.outcome.is_handshake_failure() {
                debug!(
                    "VU {} stops repeating after a failed handshake: {:?}",
                    self.vu_id, report.outcome
                );
                break;
            }
            // A session that ended early on a transport error is followed by
            // a fresh one only after a send interval.
            if !report.outcome.is_completed() {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = sleep(self.config.send_interval) => {}
                }
            }
        }

        RunnerSummary {
            vu_id: self.vu_id,
            sessions,
            skipped: false,
        }
    }

    fn skip(&self, reason: &str) -> RunnerSummary {
        debug!("VU {} skipped: {}", self.vu_id, reason);
        self.metrics.record_skipped();
        RunnerSummary {
            vu_id: self.vu_id,
            sessions: 0,
            skipped: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gale_client::LoopbackConnector;

    fn config() -> Arc<VirtualUserConfig> {
        Arc::new(
            VirtualUserConfig::new("ws://loopback/ws")
                .with_vus(1)
                .with_send_interval(Duration::from_millis(100))
                .with_session_timeout(Duration::from_secs(1)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_session_is_recorded() {
        let metrics = Arc::new(MetricsAggregator::new());
        let (runner, state_rx) = VirtualUserRunner::new(
            7,
            config(),
            Arc::new(LoopbackConnector::echo(Duration::from_millis(2))),
            metrics.clone(),
            Arc::new(Semaphore::new(1)),
            CancellationToken::new(),
        );

        let summary = runner.run().await;
        assert_eq!(
            summary,
            RunnerSummary {
                vu_id: 7,
                sessions: 1,
                skipped: false
            }
        );
        assert_eq!(*state_rx.borrow(), SessionState::Closed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.sent, 10);
        assert_eq!(snapshot.received, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_ramp_up_is_skipped() {
        let metrics = Arc::new(MetricsAggregator::new());
        let cancel = CancellationToken::new();
        let (runner, state_rx) = VirtualUserRunner::new(
            0,
            config(),
            Arc::new(LoopbackConnector::echo(Duration::ZERO)),
            metrics.clone(),
            Arc::new(Semaphore::new(1)),
            cancel.clone(),
        );
        let handle = tokio::spawn(runner.with_start_offset(Duration::from_secs(5)).run());

        sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let summary = handle.await.unwrap();

        assert!(summary.skipped);
        assert_eq!(summary.sessions, 0);
        assert_eq!(*state_rx.borrow(), SessionState::Idle);
        assert_eq!(metrics.snapshot().skipped, 1);
        assert_eq!(metrics.snapshot().sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_a_slot_is_cancellable() {
        let metrics = Arc::new(MetricsAggregator::new());
        let cancel = CancellationToken::new();
        let slots = Arc::new(Semaphore::new(1));
        let _held = slots.clone().acquire_owned().await.unwrap();

        let (runner, _state_rx) = VirtualUserRunner::new(
            1,
            config(),
            Arc::new(LoopbackConnector::echo(Duration::ZERO)),
            metrics.clone(),
            slots,
            cancel.clone(),
        );
        let handle = tokio::spawn(runner.run());

        sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        assert!(handle.await.unwrap().skipped);
        assert_eq!(metrics.snapshot().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_sessions_until_cancelled() {
        let metrics = Arc::new(MetricsAggregator::new());
        let cancel = CancellationToken::new();
        let config = Arc::new(
            VirtualUserConfig::new("ws://loopback/ws")
                .with_send_interval(Duration::from_millis(100))
                .with_session_timeout(Duration::from_secs(1))
                .with_repeat_sessions(true),
        );
        let (runner, _state_rx) = VirtualUserRunner::new(
            3,
            config,
            Arc::new(LoopbackConnector::echo(Duration::from_millis(1))),
            metrics.clone(),
            Arc::new(Semaphore::new(1)),
            cancel.clone(),
        );
        let handle = tokio::spawn(runner.run());

        // Sessions span [0,1), [1,2), [2,3) and a fourth cut short at 3.55s.
        sleep(Duration::from_millis(3_550)).await;
        cancel.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.sessions, 4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions, 4);
        assert_eq!(snapshot.completed, 4);
        assert_eq!(snapshot.received, snapshot.sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_mode_does_not_retry_failed_handshakes() {
        let metrics = Arc::new(MetricsAggregator::new());
        let config = Arc::new(
            VirtualUserConfig::new("ws://loopback/ws")
                .with_send_interval(Duration::from_millis(100))
                .with_session_timeout(Duration::from_secs(1))
                .with_repeat_sessions(true),
        );
        let (runner, state_rx) = VirtualUserRunner::new(
            4,
            config,
            Arc::new(LoopbackConnector::refusing()),
            metrics.clone(),
            Arc::new(Semaphore::new(1)),
            CancellationToken::new(),
        );

        let summary = runner.run().await;

        assert_eq!(summary.sessions, 1);
        assert_eq!(*state_rx.borrow(), SessionState::Errored);
        assert_eq!(metrics.snapshot().connect_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_after_transport_error_waits_a_send_interval() {
        // The target closes every connection after its first request.
        let connector = LoopbackConnector::with_responder(Arc::new(|_, _: &gale_core::Frame| {
            vec![(Duration::ZERO, gale_core::Frame::Close)]
        }));
        let metrics = Arc::new(MetricsAggregator::new());
        let cancel = CancellationToken::new();
        let config = Arc::new(
            VirtualUserConfig::new("ws://loopback/ws")
                .with_send_interval(Duration::from_millis(100))
                .with_session_timeout(Duration::from_secs(1))
                .with_repeat_sessions(true),
        );
        let (runner, _state_rx) = VirtualUserRunner::new(
            5,
            config,
            Arc::new(connector),
            metrics.clone(),
            Arc::new(Semaphore::new(1)),
            cancel.clone(),
        );
        let handle = tokio::spawn(runner.run());

        // sessions start at 0, 100, 200, 300 and 400
        sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.sessions, 5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transport_errors, 5);
        assert_eq!(snapshot.lost, snapshot.sent);
    }
}
