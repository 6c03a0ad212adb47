use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use gale_core::{Frame, GaleError, Result};

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = GaleError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An open, full-duplex connection split into its outbound and inbound halves
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to a load target.
///
/// One connector is shared by every virtual user; each `connect` call
/// performs one independent handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| GaleError::Connect(format!("{}: {}", url, e)))?;
        debug!("Handshake with {} completed ({})", url, response.status());

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| GaleError::Transport(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, GaleError>(into_message(frame))));

        // A finished close handshake surfaces as an error; treat it as end of stream.
        let stream = read
            .take_while(|msg| {
                future::ready(!matches!(
                    msg,
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed)
                ))
            })
            .map(|msg| {
                msg.map(from_message)
                    .map_err(|e| GaleError::Transport(e.to_string()))
            });

        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}

pub(crate) fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
        Frame::Ping(data) => Message::Ping(data.to_vec()),
        Frame::Pong(data) => Message::Pong(data.to_vec()),
        Frame::Close => Message::Close(None),
    }
}

pub(crate) fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(data) => Frame::Binary(Bytes::from(data)),
        Message::Ping(data) => Frame::Ping(Bytes::from(data)),
        Message::Pong(data) => Frame::Pong(Bytes::from(data)),
        Message::Close(_) => Frame::Close,
        other => Frame::Binary(Bytes::from(other.into_data())),
    }
}
