use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Client errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("closed")]
    Closed,

    #[error("negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("method error: {0}")]
    Rpc(RemoteError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error payload carried by a DDP `result` or `nosub` frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RemoteError {
    /// Lenient conversion: anything that is not an error object becomes the `error` field.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<RemoteError>(value.clone()) {
            Ok(err) if value.is_object() => err,
            _ => RemoteError {
                error: value,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            return f.write_str(message);
        }
        match (&self.error, &self.reason) {
            (Value::String(code), Some(reason)) => write!(f, "{} ({})", reason, code),
            (error, Some(reason)) => write!(f, "{} ({})", reason, error),
            (Value::String(code), None) => f.write_str(code),
            (error, None) => write!(f, "{}", error),
        }
    }
}

/// Failure reported by the media engine.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MediaError(pub String);

impl MediaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<MediaError> for Error {
    fn from(e: MediaError) -> Self {
        Error::NegotiationFailed(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_error_prefers_message() {
        let err = RemoteError::from_value(json!({
            "error": 403,
            "reason": "denied",
            "message": "denied [403]"
        }));
        assert_eq!(err.to_string(), "denied [403]");
    }

    #[test]
    fn remote_error_reason_and_code() {
        let err = RemoteError::from_value(json!({"error": "not-found", "reason": "no such method"}));
        assert_eq!(err.to_string(), "no such method (not-found)");
    }

    #[test]
    fn remote_error_from_scalar() {
        let err = RemoteError::from_value(json!("boom"));
        assert_eq!(err.error, json!("boom"));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn media_error_becomes_negotiation_failure() {
        let err: Error = MediaError::new("ice failed").into();
        assert!(matches!(err, Error::NegotiationFailed(ref m) if m == "ice failed"));
    }
}
