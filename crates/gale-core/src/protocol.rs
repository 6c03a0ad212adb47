use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Transport-neutral WebSocket frame exchanged between a session and its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// Text and binary frames carry application data; the rest is control traffic
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Text(_) | Frame::Binary(_))
    }
}

/// Request envelope carrying the correlation id next to the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub payload: String,
}

/// Correlation id as found in a reply: targets may echo it as a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Int(u64),
    Str(String),
}

/// Only the id matters when reading a JSON reply; other fields are ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct ReplyId {
    pub id: CorrelationId,
}
