use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::clock::Instant;
use crate::{GaleError, Result};

/// How replies are matched to the requests that caused them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationMode {
    /// The request id travels inside the frame and the target echoes it back.
    Embedded,
    /// Degraded mode for targets that cannot echo an id: every reply is
    /// matched to the oldest outstanding request.
    Fifo,
}

/// Encoding of the envelope in embedded correlation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    Json,
    Binary,
}

/// Shared, read-only description of the load to generate
#[derive(Debug, Clone)]
pub struct VirtualUserConfig {
    pub url: String,
    pub vus: usize,
    pub test_duration: Duration,
    pub send_interval: Duration,
    pub session_timeout: Duration,
    pub handshake_timeout: Duration,
    pub close_grace: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrency: Option<usize>,
    pub ramp_up: Duration,
    pub correlation: CorrelationMode,
    pub wire_format: WireFormat,
    pub payload_prefix: String,
    pub repeat_sessions: bool,
}

impl VirtualUserConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            vus: 3000,
            test_duration: Duration::from_secs(30),
            send_interval: Duration::from_millis(100),
            session_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            max_concurrency: None,
            ramp_up: Duration::ZERO,
            correlation: CorrelationMode::Embedded,
            wire_format: WireFormat::Json,
            payload_prefix: "user-".to_string(),
            repeat_sessions: false,
        }
    }

    pub fn with_vus(mut self, vus: usize) -> Self {
        self.vus = vus;
        self
    }

    pub fn with_test_duration(mut self, duration: Duration) -> Self {
        self.test_duration = duration;
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Cap on simultaneously open connections; defaults to `vus`
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    /// Spread VU start times evenly over this period
    pub fn with_ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up = ramp_up;
        self
    }

    pub fn with_correlation(mut self, mode: CorrelationMode) -> Self {
        self.correlation = mode;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_payload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.payload_prefix = prefix.into();
        self
    }

    /// Run sessions back-to-back for each VU until the test ends
    pub fn with_repeat_sessions(mut self, repeat: bool) -> Self {
        self.repeat_sessions = repeat;
        self
    }

    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(self.vus).min(self.vus).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(GaleError::Config(format!(
                "target must be a ws:// or wss:// URL, got '{}'",
                self.url
            )));
        }
        if self.vus == 0 {
            return Err(GaleError::Config("vus must be at least 1".to_string()));
        }
        if self.max_concurrency == Some(0) {
            return Err(GaleError::Config("max concurrency must be at least 1".to_string()));
        }
        if self.send_interval.is_zero() {
            return Err(GaleError::Config("send interval must be greater than zero".to_string()));
        }
        if self.session_timeout.is_zero() {
            return Err(GaleError::Config("session timeout must be greater than zero".to_string()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(GaleError::Config(
                "handshake timeout must be greater than zero".to_string(),
            ));
        }
        if self.test_duration.is_zero() {
            return Err(GaleError::Config("test duration must be greater than zero".to_string()));
        }
        if self.shutdown_grace < self.close_grace {
            warn!(
                "Shutdown grace {:?} is shorter than close grace {:?}; runners may be reported as overruns",
                self.shutdown_grace, self.close_grace
            );
        }
        Ok(())
    }
}

/// Connection session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    Handshake,
    /// At least one request never got its reply before the session closed.
    Response,
    /// The peer did not confirm the close within the grace period.
    Close,
}

/// Terminal record of one connection session
#[derive(Debug)]
pub enum SessionOutcome {
    Completed,
    Errored(GaleError),
    TimedOut(TimeoutKind),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }

    /// The session never reached `open`
    pub fn is_handshake_failure(&self) -> bool {
        match self {
            SessionOutcome::Errored(e) => e.is_connect(),
            SessionOutcome::TimedOut(kind) => *kind == TimeoutKind::Handshake,
            SessionOutcome::Completed => false,
        }
    }
}

/// Bookkeeping for a sent, not yet matched request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: u64,
    pub sent_at: Instant,
    pub session_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub session_id: u64,
    pub latency: Duration,
}

/// Per-session message accounting; `matched + lost == sent` once closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionTally {
    pub sent: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub lost: u64,
}

#[derive(Debug)]
pub struct SessionReport {
    pub session_id: u64,
    pub outcome: SessionOutcome,
    pub tally: SessionTally,
    pub correlation: CorrelationMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_reference_scenario() {
        let config = VirtualUserConfig::new("ws://localhost:8080/ws");
        assert_eq!(config.vus, 3000);
        assert_eq!(config.test_duration, Duration::from_secs(30));
        assert_eq!(config.send_interval, Duration::from_millis(100));
        assert_eq!(config.session_timeout, Duration::from_secs(10));
        assert_eq!(config.effective_concurrency(), 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let base = VirtualUserConfig::new("ws://127.0.0.1:9000");

        let http = VirtualUserConfig::new("http://127.0.0.1:9000");
        assert!(matches!(http.validate(), Err(GaleError::Config(_))));

        let zero_interval = base.clone().with_send_interval(Duration::ZERO);
        assert!(matches!(zero_interval.validate(), Err(GaleError::Config(_))));

        let zero_timeout = base.clone().with_session_timeout(Duration::ZERO);
        assert!(matches!(zero_timeout.validate(), Err(GaleError::Config(_))));

        let zero_ceiling = base.clone().with_max_concurrency(0);
        assert!(matches!(zero_ceiling.validate(), Err(GaleError::Config(_))));

        assert!(base.with_vus(0).validate().is_err());
    }

    #[test]
    fn test_concurrency_ceiling_is_capped_by_vus() {
        let config = VirtualUserConfig::new("wss://example.test")
            .with_vus(10)
            .with_max_concurrency(64);
        assert_eq!(config.effective_concurrency(), 10);

        let config = config.with_max_concurrency(4);
        assert_eq!(config.effective_concurrency(), 4);
    }

    #[test]
    fn test_handshake_failures_are_recognised() {
        let refused = SessionOutcome::Errored(GaleError::Connect("refused".to_string()));
        assert!(refused.is_handshake_failure());
        assert!(SessionOutcome::TimedOut(TimeoutKind::Handshake).is_handshake_failure());

        let dropped = SessionOutcome::Errored(GaleError::Transport("reset".to_string()));
        assert!(!dropped.is_handshake_failure());
        assert!(!SessionOutcome::TimedOut(TimeoutKind::Response).is_handshake_failure());
        assert!(!SessionOutcome::Completed.is_handshake_failure());
    }
}
