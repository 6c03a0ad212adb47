use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use gale_client::{EchoServer, TungsteniteConnector};
use gale_core::{MetricsSnapshot, VirtualUserConfig};
use gale_engine::{LoadScheduler, RunReport};

use crate::RunArgs;

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = VirtualUserConfig::new(args.url)
        .with_vus(args.vus)
        .with_test_duration(Duration::from_secs(args.duration_secs))
        .with_send_interval(Duration::from_millis(args.interval_ms))
        .with_session_timeout(Duration::from_millis(args.session_timeout_ms))
        .with_handshake_timeout(Duration::from_millis(args.handshake_timeout_ms))
        .with_close_grace(Duration::from_millis(args.close_grace_ms))
        .with_shutdown_grace(Duration::from_millis(args.shutdown_grace_ms))
        .with_ramp_up(Duration::from_secs(args.ramp_up_secs))
        .with_correlation(args.correlation.into())
        .with_wire_format(args.wire_format.into())
        .with_payload_prefix(args.payload_prefix)
        .with_repeat_sessions(args.repeat);
    if let Some(max) = args.max_concurrency {
        config = config.with_max_concurrency(max);
    }

    if !args.json {
        println!("=== GALE Load Run ===");
        println!("Target: {}", config.url);
        println!("Virtual users: {}", config.vus);
        println!("Duration: {} seconds", args.duration_secs);
        println!("Send interval: {} ms", args.interval_ms);
        println!("Session timeout: {} ms", args.session_timeout_ms);
        println!("Concurrency: {}", config.effective_concurrency());
        println!("Correlation: {:?}", config.correlation);
        println!();
    }

    let scheduler = LoadScheduler::new(config, Arc::new(TungsteniteConnector::new()))?;

    let cancel = scheduler.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, winding down virtual users");
            cancel.cancel();
        }
    });

    let progress = (args.progress_secs > 0 && !args.json).then(|| {
        let metrics = scheduler.metrics();
        let period = Duration::from_secs(args.progress_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                print_progress(&metrics.snapshot());
            }
        })
    });

    let report = scheduler.run().await;
    if let Some(progress) = progress {
        progress.abort();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    report.ensure_no_overrun()?;
    Ok(())
}

pub async fn echo(bind: &str, delay_ms: u64) -> anyhow::Result<()> {
    let server = EchoServer::bind(bind)
        .await?
        .with_delay(Duration::from_millis(delay_ms));
    info!("Echo target ready at ws://{}/", server.local_addr()?);
    server.run().await?;
    Ok(())
}

fn print_progress(snapshot: &MetricsSnapshot) {
    println!(
        "Sent {} / received {} / lost {}; sessions done {} (errored {}, timed out {})",
        snapshot.sent,
        snapshot.received,
        snapshot.lost,
        snapshot.sessions,
        snapshot.errored,
        snapshot.timed_out
    );
}

fn print_report(report: &RunReport) {
    let s = &report.snapshot;
    let elapsed = report.elapsed.as_secs_f64();

    println!("\n=== Run Results ===");
    println!("Run id: {}", report.run_id);
    println!("Test duration: {:.2}s", elapsed);
    println!("Requests sent: {}", s.sent);
    println!("Replies matched: {}", s.received);
    println!("Unmatched replies: {}", s.unmatched);
    println!("Lost requests: {}", s.lost);
    if elapsed > 0.0 {
        println!("Reply rate: {:.0} msg/s", s.received as f64 / elapsed);
    }
    println!();
    println!("Sessions: {}", s.sessions);
    println!("  Completed:  {}", s.completed);
    println!(
        "  Errored:    {} (connect {}, transport {})",
        s.errored, s.connect_errors, s.transport_errors
    );
    println!(
        "  Timed out:  {} (handshake {}, close {})",
        s.timed_out, s.handshake_timeouts, s.close_timeouts
    );
    println!("  Skipped:    {}", s.skipped);
    println!("  Overruns:   {}", s.overruns);
    if s.fifo_sessions > 0 {
        println!(
            "  FIFO-correlated sessions: {} (latencies approximate)",
            s.fifo_sessions
        );
    }
    for overrun in &report.overruns {
        println!(
            "  VU {} overran shutdown (last state {:?})",
            overrun.vu_id, overrun.last_state
        );
    }
    println!();

    let latency = &s.latency_summary;
    if latency.count == 0 {
        println!("No latency samples recorded");
        return;
    }
    println!("Latency distribution (microseconds):");
    println!("  Min:  {}", latency.min_us);
    println!("  Mean: {:.0}", latency.mean_us);
    println!("  p50:  {}", latency.p50_us);
    println!("  p90:  {}", latency.p90_us);
    println!("  p95:  {}", latency.p95_us);
    println!("  p99:  {}", latency.p99_us);
    println!("  p99.9:{}", latency.p999_us);
    println!("  Max:  {}", latency.max_us);
}
