use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gale_client::Connector;
use gale_core::clock;
use gale_core::{
    CorrelationMode, GaleError, MetricsAggregator, MetricsSnapshot, Result, SessionOutcome,
    SessionState, VirtualUserConfig,
};

use crate::{RunnerSummary, VirtualUserRunner};

type LiveRunners = Arc<DashMap<u64, watch::Receiver<SessionState>>>;

/// A runner still alive when the shutdown grace period ran out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverrunRecord {
    pub vu_id: u64,
    pub last_state: SessionState,
}

/// Result of one load run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub elapsed: Duration,
    pub snapshot: MetricsSnapshot,
    pub overruns: Vec<OverrunRecord>,
}

impl RunReport {
    /// Fail when any runner had to be aborted
    pub fn ensure_no_overrun(&self) -> Result<()> {
        if self.overruns.is_empty() {
            return Ok(());
        }
        Err(GaleError::SchedulerOverrun {
            count: self.overruns.len(),
            vu_ids: self.overruns.iter().map(|o| o.vu_id).collect(),
        })
    }
}

/// How a runner task came back to the scheduler
#[derive(Debug)]
enum RunnerExit {
    Returned(RunnerSummary),
    Panicked { vu_id: u64, message: String },
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Starts one runner per virtual user and bounds the whole run in time.
///
/// The run ends when every runner has returned or the test duration elapses,
/// whichever comes first, or earlier if the token from
/// [`LoadScheduler::cancel_token`] is cancelled. Runners then get
/// `shutdown_grace` to wind down; whatever is still alive after that is
/// reported as an overrun and aborted.
pub struct LoadScheduler {
    config: Arc<VirtualUserConfig>,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsAggregator>,
    cancel: CancellationToken,
}

impl LoadScheduler {
    pub fn new(config: VirtualUserConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connector,
            metrics: Arc::new(MetricsAggregator::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Record into an existing aggregator instead of a fresh one
    pub fn with_metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Live view of the counters, safe to snapshot while the run is going
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        self.metrics.clone()
    }

    /// Cancelling this token ends the run early
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &VirtualUserConfig {
        &self.config
    }

    pub async fn run(self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started = clock::now();
        let config = self.config.clone();

        info!(
            "Run {} starting: {} VUs against {} for {:?} (interval {:?}, session timeout {:?}, concurrency {})",
            run_id,
            config.vus,
            config.url,
            config.test_duration,
            config.send_interval,
            config.session_timeout,
            config.effective_concurrency()
        );
        if config.correlation == CorrelationMode::Fifo {
            warn!(
                "Run {}: replies carry no request id, latencies are matched in FIFO order and are approximate",
                run_id
            );
        }

        let slots = Arc::new(Semaphore::new(config.effective_concurrency()));
        let live: LiveRunners = Arc::new(DashMap::new());
        let mut runners = JoinSet::new();

        for vu_id in 0..config.vus as u64 {
            let offset = config
                .ramp_up
                .mul_f64(vu_id as f64 / config.vus as f64);
            let (runner, state_rx) = VirtualUserRunner::new(
                vu_id,
                config.clone(),
                self.connector.clone(),
                self.metrics.clone(),
                slots.clone(),
                self.cancel.child_token(),
            );
            live.insert(vu_id, state_rx);

            runners.spawn(async move {
                let run = AssertUnwindSafe(runner.with_start_offset(offset).run());
                match run.catch_unwind().await {
                    Ok(summary) => RunnerExit::Returned(summary),
                    Err(panic) => RunnerExit::Panicked {
                        vu_id,
                        message: panic_message(&*panic),
                    },
                }
            });
        }
        debug!("Run {}: {} runners spawned", run_id, runners.len());

        let deadline = sleep(config.test_duration);
        tokio::pin!(deadline);

        let all_returned = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Run {} cancelled, stopping {} runner(s)", run_id, runners.len());
                    break false;
                }
                _ = &mut deadline => {
                    info!(
                        "Run {}: test duration elapsed, stopping {} runner(s)",
                        run_id,
                        runners.len()
                    );
                    break false;
                }
                joined = runners.join_next() => match joined {
                    Some(result) => self.on_runner_exit(&live, result),
                    None => break true,
                },
            }
        };

        self.cancel.cancel();

        if !all_returned {
            let grace = sleep(config.shutdown_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    biased;

                    joined = runners.join_next() => match joined {
                        Some(result) => self.on_runner_exit(&live, result),
                        None => break,
                    },
                    _ = &mut grace => break,
                }
            }
        }

        // Whatever is still registered after the aborted tasks are reaped
        // never returned on its own.
        if !runners.is_empty() {
            runners.abort_all();
            while let Some(result) = runners.join_next().await {
                self.on_runner_exit(&live, result);
            }
        }
        let overruns = self.collect_overruns(run_id, &live);

        let elapsed = started.elapsed();
        let snapshot = self.metrics.snapshot();
        info!(
            "Run {} finished in {:?}: {} sessions ({} completed, {} errored, {} timed out), {} skipped, {} overrun(s)",
            run_id,
            elapsed,
            snapshot.sessions,
            snapshot.completed,
            snapshot.errored,
            snapshot.timed_out,
            snapshot.skipped,
            snapshot.overruns
        );

        RunReport {
            run_id,
            elapsed,
            snapshot,
            overruns,
        }
    }

    fn on_runner_exit(
        &self,
        live: &LiveRunners,
        result: std::result::Result<RunnerExit, JoinError>,
    ) {
        match result {
            Ok(RunnerExit::Returned(summary)) => {
                live.remove(&summary.vu_id);
                debug!(
                    "VU {} returned after {} session(s)",
                    summary.vu_id, summary.sessions
                );
            }
            Ok(RunnerExit::Panicked { vu_id, message }) => {
                live.remove(&vu_id);
                error!("VU {} runner panicked: {}", vu_id, message);
                self.metrics.record_outcome(&SessionOutcome::Errored(GaleError::Internal(
                    format!("runner panicked: {}", message),
                )));
            }
            // Aborted after the shutdown grace; it stays registered as an overrun.
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                warn!("Runner task ended unexpectedly: {}", e);
            }
        }
    }

    fn collect_overruns(&self, run_id: Uuid, live: &LiveRunners) -> Vec<OverrunRecord> {
        let mut overruns: Vec<OverrunRecord> = live
            .iter()
            .map(|entry| OverrunRecord {
                vu_id: *entry.key(),
                last_state: *entry.value().borrow(),
            })
            .collect();
        overruns.sort_by_key(|o| o.vu_id);

        for overrun in &overruns {
            error!(
                "Run {}: VU {} was still running after the shutdown grace period (last state {:?}) and was aborted",
                run_id, overrun.vu_id, overrun.last_state
            );
            self.metrics.record_overrun();
        }
        overruns
    }
}
