use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, sleep_until, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gale_core::clock;
use gale_core::{
    CorrelationMode, Frame, GaleError, LatencySample, MessageCodec, MetricsAggregator, Result,
    SessionOutcome, SessionReport, SessionState, SessionTally, TimeoutKind, VirtualUserConfig,
};

use crate::{Connection, Connector, FrameSink, FrameStream, PendingRequests};

enum Handshake {
    Connected(Connection),
    Ended(SessionOutcome),
}

/// One virtual user's WebSocket connection, from handshake to close.
///
/// `connecting -> open -> closing -> closed`, with `errored` reachable from
/// every non-closed state. While open, a single select loop owns both halves
/// of the connection: it sends on every interval tick and matches every
/// inbound frame against the pending-request table, so there is exactly one
/// receive path for the whole life of the session.
pub struct ConnectionSession {
    session_id: u64,
    config: Arc<VirtualUserConfig>,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsAggregator>,
    cancel: CancellationToken,
    state: SessionState,
    state_tx: Option<Arc<watch::Sender<SessionState>>>,
    pending: PendingRequests,
    tally: SessionTally,
}

impl ConnectionSession {
    pub fn new(
        config: Arc<VirtualUserConfig>,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsAggregator>,
        cancel: CancellationToken,
    ) -> Self {
        let session_id = clock::next_session_id();
        let pending = PendingRequests::new(session_id, config.correlation);
        Self {
            session_id,
            config,
            connector,
            metrics,
            cancel,
            state: SessionState::Idle,
            state_tx: None,
            pending,
            tally: SessionTally::default(),
        }
    }

    /// Publish every state transition on a watch channel
    pub fn with_state_observer(mut self, state_tx: Arc<watch::Sender<SessionState>>) -> Self {
        self.state_tx = Some(state_tx);
        self
    }

    pub fn id(&self) -> u64 {
        self.session_id
    }

    /// Drive the session to a terminal state. Never fails: every error ends
    /// up in the returned report's outcome.
    pub async fn run(mut self) -> SessionReport {
        let Connection {
            mut sink,
            mut stream,
        } = match self.handshake().await {
            Handshake::Connected(connection) => connection,
            Handshake::Ended(outcome) => return self.finish(outcome),
        };

        let result = match self.exchange(&mut sink, &mut stream).await {
            Ok(()) => self.close(&mut sink, &mut stream).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Err(e) => {
                self.transition(SessionState::Errored);
                SessionOutcome::Errored(e)
            }
            Ok(close_confirmed) => {
                self.transition(SessionState::Closed);
                if self.tally.lost > 0 || !self.pending.is_empty() {
                    SessionOutcome::TimedOut(TimeoutKind::Response)
                } else if !close_confirmed {
                    SessionOutcome::TimedOut(TimeoutKind::Close)
                } else {
                    SessionOutcome::Completed
                }
            }
        };
        self.finish(outcome)
    }

    async fn handshake(&mut self) -> Handshake {
        self.transition(SessionState::Connecting);
        let cancel = self.cancel.clone();
        let connector = self.connector.clone();
        let config = self.config.clone();
        let connect = timeout(config.handshake_timeout, connector.connect(&config.url));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Session {} cancelled while connecting", self.session_id);
                self.transition(SessionState::Closed);
                Handshake::Ended(SessionOutcome::Completed)
            }

            result = connect => match result {
                Ok(Ok(connection)) => {
                    self.transition(SessionState::Open);
                    if self.pending.mode() == CorrelationMode::Fifo {
                        self.metrics.record_degraded_correlation();
                    }
                    Handshake::Connected(connection)
                }
                Ok(Err(e)) => {
                    warn!("Session {} failed to connect: {}", self.session_id, e);
                    self.transition(SessionState::Errored);
                    Handshake::Ended(SessionOutcome::Errored(e))
                }
                Err(_) => {
                    warn!(
                        "Session {} handshake with {} timed out after {:?}",
                        self.session_id, config.url, config.handshake_timeout
                    );
                    self.transition(SessionState::Closed);
                    Handshake::Ended(SessionOutcome::TimedOut(TimeoutKind::Handshake))
                }
            }
        }
    }

    /// The open state: periodic sends raced against replies, the session
    /// deadline and cancellation. Returns once the session should close.
    async fn exchange(&mut self, sink: &mut FrameSink, stream: &mut FrameStream) -> Result<()> {
        let cancel = self.cancel.clone();
        let deadline = sleep_until(clock::now() + self.config.session_timeout);
        tokio::pin!(deadline);

        let mut ticker = interval(self.config.send_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Session {} cancelled", self.session_id);
                    return Ok(());
                }

                _ = &mut deadline => {
                    debug!("Session {} reached its timeout", self.session_id);
                    return Ok(());
                }

                frame = stream.next() => match frame {
                    Some(Ok(Frame::Close)) => {
                        return Err(GaleError::Transport("connection closed by peer".to_string()));
                    }
                    Some(Ok(frame)) => self.on_frame(frame),
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(GaleError::Transport("connection dropped by peer".to_string()));
                    }
                },

                _ = ticker.tick() => {
                    let id = clock::next_request_id();
                    let payload = MessageCodec::payload(&self.config.payload_prefix);
                    let frame = MessageCodec::encode_request(
                        self.config.correlation,
                        self.config.wire_format,
                        id,
                        payload,
                    )?;
                    let sent_at = clock::now();

                    // A send blocked by backpressure must not hold up shutdown.
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        _ = &mut deadline => false,
                        result = sink.send(frame) => {
                            result?;
                            true
                        }
                    };
                    if !sent {
                        debug!(
                            "Session {} stopped while request {} was being sent",
                            self.session_id, id
                        );
                        return Ok(());
                    }

                    self.pending.insert(id, sent_at);
                    self.tally.sent += 1;
                    self.metrics.record_sent();
                }
            }
        }
    }

    /// The closing state: send Close, keep matching late replies, and wait
    /// for the peer's Close or end of stream for at most the close grace.
    /// Returns whether the peer confirmed the close in time.
    async fn close(&mut self, sink: &mut FrameSink, stream: &mut FrameStream) -> Result<bool> {
        self.transition(SessionState::Closing);
        let grace = sleep(self.config.close_grace);
        tokio::pin!(grace);

        tokio::select! {
            biased;
            _ = &mut grace => return Ok(false),
            result = sink.send(Frame::Close) => result?,
        }

        loop {
            tokio::select! {
                biased;

                _ = &mut grace => {
                    debug!(
                        "Session {} close was not confirmed within {:?}",
                        self.session_id, self.config.close_grace
                    );
                    return Ok(false);
                }

                frame = stream.next() => match frame {
                    Some(Ok(Frame::Close)) | None => return Ok(true),
                    Some(Ok(frame)) => self.on_frame(frame),
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        // tungstenite answers pings itself
        if !frame.is_data() {
            return;
        }

        let reply_id = match self.pending.mode() {
            CorrelationMode::Embedded => match MessageCodec::decode_reply_id(&frame) {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!("Session {}: {}", self.session_id, e);
                    None
                }
            },
            CorrelationMode::Fifo => None,
        };

        match self.pending.take(reply_id) {
            Some(request) => {
                let latency = clock::now().saturating_duration_since(request.sent_at);
                if latency > self.config.session_timeout {
                    debug!(
                        "Session {} reply to request {} took {:?}; counted as lost",
                        self.session_id, request.id, latency
                    );
                    self.tally.lost += 1;
                    self.metrics.record_lost(1);
                } else {
                    self.tally.matched += 1;
                    self.metrics.record_latency(LatencySample {
                        session_id: self.session_id,
                        latency,
                    });
                }
            }
            None => {
                debug!("Session {} discarded unmatched reply {:?}", self.session_id, reply_id);
                self.tally.unmatched += 1;
                self.metrics.record_unmatched();
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.session_id, self.state, next);
        self.state = next;
        if let Some(state_tx) = &self.state_tx {
            state_tx.send_replace(next);
        }
    }

    fn finish(mut self, outcome: SessionOutcome) -> SessionReport {
        let lost = self.pending.drain_lost();
        self.tally.lost += lost;
        self.metrics.record_lost(lost);

        debug!(
            "Session {} finished: {:?} (sent {}, matched {}, unmatched {}, lost {})",
            self.session_id,
            outcome,
            self.tally.sent,
            self.tally.matched,
            self.tally.unmatched,
            self.tally.lost
        );

        SessionReport {
            session_id: self.session_id,
            outcome,
            tally: self.tally,
            correlation: self.pending.mode(),
        }
    }
}

// A session dropped mid-flight (its runner aborted) still accounts for what it
// sent. `finish` has already drained the table on the normal path.
impl Drop for ConnectionSession {
    fn drop(&mut self) {
        let lost = self.pending.drain_lost();
        if lost > 0 {
            debug!(
                "Session {} dropped with {} request(s) outstanding",
                self.session_id, lost
            );
            self.metrics.record_lost(lost);
        }
    }
}
