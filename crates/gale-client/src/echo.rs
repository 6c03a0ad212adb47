use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use gale_core::Result;

/// Minimal WebSocket target that echoes every data frame back.
///
/// Embedded correlation ids survive the round trip unchanged, which makes it
/// a convenient local target for smoke runs.
pub struct EchoServer {
    listener: TcpListener,
    delay: Duration,
}

impl EchoServer {
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            delay: Duration::ZERO,
        })
    }

    /// Hold every echo back by `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("Echo server listening on {}", self.listener.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let delay = self.delay;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, delay).await {
                            warn!("Connection {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    delay: Duration,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut ws = accept_async(stream).await?;

    while let Some(message) = ws.next().await {
        match message? {
            msg @ (Message::Text(_) | Message::Binary(_)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                ws.send(msg).await?;
            }
            // tungstenite answers pings and queues the close reply on its own
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Flush the queued close reply; the peer may already be gone.
    let _ = ws.close(None).await;
    Ok(())
}
