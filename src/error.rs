use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for state reporting.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be stored alongside connection state (see `ChannelState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (timeout, refused, bad address, etc.)
    ConnectionFailed,
    /// All reconnection attempts used up
    RetriesExhausted,
    /// Manager or channel is shutting down
    ShuttingDown,
    /// Inbound payload could not be decoded
    Decode,
}

/// Errors that can occur in ws-stream-mux
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A single connection attempt failed
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// Connection attempt did not complete in time
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Target address could not be parsed or uses an unsupported scheme
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Connection settled into `Failed` after the configured attempts
    #[error("Gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// Inbound payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed { .. } | Error::ConnectTimeout(_) | Error::InvalidAddress(_) => {
                ErrorKind::ConnectionFailed
            }
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Decode(_) => ErrorKind::Decode,
        }
    }
}

/// Reasons an inbound frame was rejected by a payload decoder.
///
/// Decode errors never affect the connection: the offending frame is
/// dropped and the stream keeps running.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame body is not valid JSON, or does not match the expected shape
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame type cannot carry this payload (e.g. binary on a JSON channel)
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    /// JSON value was valid but not an object
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// Server sent a `{"detail": ...}` rejection notice instead of data
    #[error("server rejected the stream: {0}")]
    Rejected(String),
}
