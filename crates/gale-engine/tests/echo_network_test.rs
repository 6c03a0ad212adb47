use std::sync::Arc;
use tokio::time::Duration;

use gale_client::{EchoServer, TungsteniteConnector};
use gale_core::{CorrelationMode, VirtualUserConfig, WireFormat};
use gale_engine::LoadScheduler;

async fn start_echo_server() -> String {
    let server = EchoServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    format!("ws://{}/ws", addr)
}

fn config(url: String) -> VirtualUserConfig {
    VirtualUserConfig::new(url)
        .with_vus(5)
        .with_send_interval(Duration::from_millis(50))
        .with_session_timeout(Duration::from_millis(500))
        .with_test_duration(Duration::from_secs(10))
}

#[tokio::test]
async fn test_run_against_echo_server() {
    let _ = tracing_subscriber::fmt().try_init();
    let url = start_echo_server().await;

    for (correlation, wire_format) in [
        (CorrelationMode::Embedded, WireFormat::Json),
        (CorrelationMode::Embedded, WireFormat::Binary),
        (CorrelationMode::Fifo, WireFormat::Json),
    ] {
        let config = config(url.clone())
            .with_correlation(correlation)
            .with_wire_format(wire_format);
        let scheduler = LoadScheduler::new(config, Arc::new(TungsteniteConnector::new())).unwrap();

        let report = scheduler.run().await;
        report.ensure_no_overrun().unwrap();

        let s = &report.snapshot;
        assert_eq!(s.completed, 5, "{:?}/{:?}: {:?}", correlation, wire_format, s);
        assert_eq!(s.received, s.sent);
        assert_eq!(s.unmatched, 0);
        assert!(s.sent >= 45);
        // every session ends on its own well before the deadline
        assert!(report.elapsed < Duration::from_secs(5));
    }
}

#[tokio::test]
async fn test_run_against_closed_port() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = config(format!("ws://{}/ws", addr));
    let scheduler = LoadScheduler::new(config, Arc::new(TungsteniteConnector::new())).unwrap();

    let report = scheduler.run().await;
    assert_eq!(report.snapshot.errored, 5);
    assert_eq!(report.snapshot.connect_errors, 5);
    assert_eq!(report.snapshot.sent, 0);
}
