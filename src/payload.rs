//! Typed inbound payloads, one per channel purpose.
//!
//! Every inbound data frame is decoded synchronously by [`Payload::decode`].
//! Unrecognized shapes are decode errors; the connection drops the frame
//! and keeps running.

use crate::error::DecodeError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_tungstenite::tungstenite::Message;

/// A value decoded from one WebSocket data frame.
///
/// `PartialEq` must be structural: it drives duplicate suppression.
pub trait Payload: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Decode a text or binary frame.
    fn decode(message: &Message) -> Result<Self, DecodeError>;
}

/// Parse a JSON object from a text (or UTF-8 binary) frame.
///
/// A bare `{"detail": "..."}` object is the server's rejection notice and
/// is reported as [`DecodeError::Rejected`].
fn json_object(message: &Message) -> Result<serde_json::Map<String, Value>, DecodeError> {
    let value: Value = match message {
        Message::Text(text) => serde_json::from_str(text)?,
        Message::Binary(data) => serde_json::from_slice(data)?,
        Message::Ping(_) => return Err(DecodeError::UnexpectedFrame("ping")),
        Message::Pong(_) => return Err(DecodeError::UnexpectedFrame("pong")),
        Message::Close(_) => return Err(DecodeError::UnexpectedFrame("close")),
        Message::Frame(_) => return Err(DecodeError::UnexpectedFrame("raw")),
    };

    let Value::Object(object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    if object.len() == 1 {
        if let Some(Value::String(detail)) = object.get("detail") {
            return Err(DecodeError::Rejected(detail.clone()));
        }
    }

    Ok(object)
}

fn decode_json<T: DeserializeOwned>(message: &Message) -> Result<T, DecodeError> {
    let object = json_object(message)?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

/// Any JSON object, compared structurally.
impl Payload for Value {
    fn decode(message: &Message) -> Result<Self, DecodeError> {
        json_object(message).map(Value::Object)
    }
}

/// Vehicle counts and average speeds for one road, from `/ws/info/{road}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleCountUpdate {
    pub count_car: u32,
    pub count_motor: u32,
    /// Average car speed in km/h
    pub speed_car: f64,
    /// Average motorbike speed in km/h
    pub speed_motor: f64,
}

impl Payload for VehicleCountUpdate {
    fn decode(message: &Message) -> Result<Self, DecodeError> {
        decode_json(message)
    }
}

/// One camera frame for a road, from `/ws/frames/{road}`.
#[derive(Clone, PartialEq)]
pub enum FrameUpdate {
    /// Raw JPEG bytes, sent as a binary frame
    Jpeg(Vec<u8>),
    /// Base64 JPEG sent as `{"frame": "..."}`
    Base64(String),
}

impl FrameUpdate {
    /// Size of the encoded frame in bytes.
    pub fn len(&self) -> usize {
        match self {
            FrameUpdate::Jpeg(bytes) => bytes.len(),
            FrameUpdate::Base64(text) => text.len(),
        }
    }

    /// Whether the frame carries no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Frames are large; keep logs readable.
impl fmt::Debug for FrameUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameUpdate::Jpeg(bytes) => write!(f, "Jpeg({} bytes)", bytes.len()),
            FrameUpdate::Base64(text) => write!(f, "Base64({} chars)", text.len()),
        }
    }
}

#[derive(Deserialize)]
struct EncodedFrame {
    frame: String,
}

impl Payload for FrameUpdate {
    fn decode(message: &Message) -> Result<Self, DecodeError> {
        match message {
            Message::Binary(data) => Ok(FrameUpdate::Jpeg(data.clone())),
            _ => {
                let encoded: EncodedFrame = decode_json(message)?;
                Ok(FrameUpdate::Base64(encoded.frame))
            }
        }
    }
}

/// Reply from the chat assistant, from `/ws/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Markdown reply text
    #[serde(alias = "response", alias = "text")]
    pub message: String,
    /// Optional image attachment (URL or base64)
    #[serde(default)]
    pub image: Option<String>,
}

impl Payload for ChatResponse {
    fn decode(message: &Message) -> Result<Self, DecodeError> {
        decode_json(message)
    }
}

/// Outbound chat prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    #[test]
    fn test_value_requires_object() {
        assert!(Value::decode(&text(r#"{"count":3}"#)).is_ok());
        assert!(matches!(Value::decode(&text("[1,2]")), Err(DecodeError::NotAnObject)));
        assert!(matches!(Value::decode(&text("not json")), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_detail_notice_is_rejected() {
        let msg = text(r#"{"detail":"Unauthorized — missing or invalid token"}"#);
        match VehicleCountUpdate::decode(&msg) {
            Err(DecodeError::Rejected(detail)) => assert!(detail.starts_with("Unauthorized")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_vehicle_counts() {
        let msg = text(r#"{"count_car":12,"count_motor":40,"speed_car":31.5,"speed_motor":24.0}"#);
        let update = VehicleCountUpdate::decode(&msg).expect("valid counts");
        assert_eq!(update.count_car, 12);
        assert_eq!(update.count_motor, 40);
        assert_eq!(update.speed_car, 31.5);
    }

    #[test]
    fn test_vehicle_counts_reject_partial_object() {
        let msg = text(r#"{"count_car":12}"#);
        assert!(matches!(VehicleCountUpdate::decode(&msg), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_frame_from_binary_and_json() {
        let jpeg = FrameUpdate::decode(&Message::Binary(vec![0xFF, 0xD8, 0xFF])).expect("binary");
        assert_eq!(jpeg, FrameUpdate::Jpeg(vec![0xFF, 0xD8, 0xFF]));
        assert_eq!(jpeg.len(), 3);

        let b64 = FrameUpdate::decode(&text(r#"{"frame":"/9j/4AAQ"}"#)).expect("json");
        assert_eq!(b64, FrameUpdate::Base64("/9j/4AAQ".to_string()));
    }

    #[test]
    fn test_frame_null_is_rejected() {
        assert!(FrameUpdate::decode(&text(r#"{"frame":null}"#)).is_err());
    }

    #[test]
    fn test_chat_response_aliases() {
        let a = ChatResponse::decode(&text(r#"{"message":"hi","image":null}"#)).expect("message");
        let b = ChatResponse::decode(&text(r#"{"response":"hi"}"#)).expect("response");
        let c = ChatResponse::decode(&text(r#"{"text":"hi","image":null}"#)).expect("text");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.image, None);
    }

    #[test]
    fn test_control_frames_are_not_payloads() {
        assert!(matches!(
            Value::decode(&Message::Ping(vec![1])),
            Err(DecodeError::UnexpectedFrame("ping"))
        ));
    }
}
