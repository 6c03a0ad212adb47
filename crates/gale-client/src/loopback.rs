use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use gale_core::{Frame, GaleError, Result};

use crate::{Connection, Connector};

/// Decides how the loopback target answers the n-th data frame of a connection.
/// Each returned entry is sent back after its delay.
pub type Responder = Arc<dyn Fn(usize, &Frame) -> Vec<(Duration, Frame)> + Send + Sync>;

/// In-process load target.
///
/// Every `connect` spawns a small task that plays the server side of the
/// connection according to a scripted responder. Useful for dry runs and for
/// exercising sessions and schedulers deterministically under a paused clock.
#[derive(Clone)]
pub struct LoopbackConnector {
    responder: Responder,
    connect_delay: Duration,
    refuse: bool,
    ack_close: bool,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            connect_delay: Duration::ZERO,
            refuse: false,
            ack_close: true,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Echo every data frame back unchanged after `delay`
    pub fn echo(delay: Duration) -> Self {
        Self::with_responder(Arc::new(move |_, frame: &Frame| vec![(delay, frame.clone())]))
    }

    /// Accept connections but never answer
    pub fn silent() -> Self {
        Self::with_responder(Arc::new(|_, _: &Frame| Vec::new()))
    }

    /// Fail every handshake
    pub fn refusing() -> Self {
        let mut connector = Self::silent();
        connector.refuse = true;
        connector
    }

    /// Delay applied to every handshake
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Never answer the client's Close frame
    pub fn stall_close(mut self) -> Self {
        self.ack_close = false;
        self
    }

    /// Connections currently open
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections seen so far
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the open-connection gauge when the server side goes away
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.refuse {
            return Err(GaleError::Connect(format!("{}: connection refused", url)));
        }

        let (client_tx, mut server_rx) = mpsc::unbounded::<Frame>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<Frame>>();

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        let responder = self.responder.clone();
        let ack_close = self.ack_close;
        tokio::spawn(async move {
            let _guard = guard;
            let mut seen = 0usize;
            while let Some(frame) = server_rx.next().await {
                match frame {
                    Frame::Close => {
                        if ack_close {
                            let _ = server_tx.unbounded_send(Ok(Frame::Close));
                            server_tx.close_channel();
                            return;
                        }
                        debug!("Loopback target ignoring close");
                    }
                    Frame::Ping(data) => {
                        let _ = server_tx.unbounded_send(Ok(Frame::Pong(data)));
                    }
                    Frame::Pong(_) => {}
                    data => {
                        for (delay, reply) in responder(seen, &data) {
                            let tx = server_tx.clone();
                            tokio::spawn(async move {
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                                let _ = tx.unbounded_send(Ok(reply));
                            });
                        }
                        seen += 1;
                    }
                }
            }
        });

        let sink = client_tx.sink_map_err(|e| GaleError::Transport(e.to_string()));
        Ok(Connection::new(Box::pin(sink), Box::pin(client_rx)))
    }
}
