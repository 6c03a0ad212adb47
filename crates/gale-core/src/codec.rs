use bytes::Bytes;
use rand::Rng;

use crate::protocol::ReplyId;
use crate::{CorrelationId, CorrelationMode, Envelope, Frame, GaleError, Result, WireFormat};

const MAX_REPLY_SIZE: usize = 16 * 1024 * 1024; // 16MB limit

pub struct MessageCodec;

impl MessageCodec {
    /// Random request body, `<prefix><random fraction>`
    pub fn payload(prefix: &str) -> String {
        let r: f64 = rand::thread_rng().gen();
        format!("{}{}", prefix, r)
    }

    /// Encode an outbound request; FIFO mode sends the bare payload
    pub fn encode_request(
        mode: CorrelationMode,
        format: WireFormat,
        id: u64,
        payload: String,
    ) -> Result<Frame> {
        match (mode, format) {
            (CorrelationMode::Fifo, _) => Ok(Frame::Text(payload)),
            (CorrelationMode::Embedded, WireFormat::Json) => {
                let text = serde_json::to_string(&Envelope { id, payload })?;
                Ok(Frame::Text(text))
            }
            (CorrelationMode::Embedded, WireFormat::Binary) => {
                let data = bincode::serialize(&Envelope { id, payload })?;
                Ok(Frame::Binary(Bytes::from(data)))
            }
        }
    }

    /// Extract the correlation id embedded in a reply
    pub fn decode_reply_id(frame: &Frame) -> Result<u64> {
        match frame {
            Frame::Text(text) => {
                if text.len() > MAX_REPLY_SIZE {
                    return Err(GaleError::UnmatchedResponse(format!(
                        "reply too large: {} bytes",
                        text.len()
                    )));
                }
                let reply: ReplyId = serde_json::from_str(text).map_err(|e| {
                    GaleError::UnmatchedResponse(format!("reply carries no id: {}", e))
                })?;
                match reply.id {
                    CorrelationId::Int(id) => Ok(id),
                    CorrelationId::Str(s) => s.trim().parse().map_err(|_| {
                        GaleError::UnmatchedResponse(format!("non-numeric id '{}'", s))
                    }),
                }
            }
            Frame::Binary(data) => {
                if data.len() > MAX_REPLY_SIZE {
                    return Err(GaleError::UnmatchedResponse(format!(
                        "reply too large: {} bytes",
                        data.len()
                    )));
                }
                let envelope: Envelope = bincode::deserialize(data).map_err(|e| {
                    GaleError::UnmatchedResponse(format!("undecodable binary reply: {}", e))
                })?;
                Ok(envelope.id)
            }
            other => Err(GaleError::UnmatchedResponse(format!(
                "control frame is not a reply: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_request_embeds_id() {
        let frame = MessageCodec::encode_request(
            CorrelationMode::Embedded,
            WireFormat::Json,
            42,
            "user-0.5".to_string(),
        )
        .unwrap();

        match &frame {
            Frame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text).unwrap();
                assert_eq!(value["id"], 42);
                assert_eq!(value["payload"], "user-0.5");
            }
            other => panic!("expected text frame, got {:?}", other),
        }
        assert_eq!(MessageCodec::decode_reply_id(&frame).unwrap(), 42);
    }

    #[test]
    fn test_reply_id_may_be_string_and_carry_extra_fields() {
        let reply = Frame::Text(r#"{"matchId":"m-9","id":"17","status":"ok"}"#.to_string());
        assert_eq!(MessageCodec::decode_reply_id(&reply).unwrap(), 17);
    }

    #[test]
    fn test_malformed_replies_are_unmatched() {
        let cases = vec![
            Frame::Text("m-123".to_string()),
            Frame::Text(r#"{"payload":"no id"}"#.to_string()),
            Frame::Text(r#"{"id":"abc"}"#.to_string()),
            Frame::Binary(Bytes::from_static(&[1, 2])),
            Frame::Pong(Bytes::new()),
        ];
        for frame in cases {
            assert!(matches!(
                MessageCodec::decode_reply_id(&frame),
                Err(GaleError::UnmatchedResponse(_))
            ));
        }
    }

    #[test]
    fn test_binary_envelope() {
        let frame = MessageCodec::encode_request(
            CorrelationMode::Embedded,
            WireFormat::Binary,
            7,
            "user-1".to_string(),
        )
        .unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
        assert_eq!(MessageCodec::decode_reply_id(&frame).unwrap(), 7);
    }

    #[test]
    fn test_fifo_sends_bare_payload() {
        let payload = MessageCodec::payload("user-");
        assert!(payload.starts_with("user-"));

        let frame = MessageCodec::encode_request(
            CorrelationMode::Fifo,
            WireFormat::Json,
            1,
            payload.clone(),
        )
        .unwrap();
        assert_eq!(frame, Frame::Text(payload));
    }
}
