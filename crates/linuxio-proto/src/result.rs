//! Result and progress payloads.
//!
//! Exactly one result record terminates a unidirectional stream, before
//! its close frame. Progress records are handler-defined JSON and may be
//! emitted zero or more times before the result; upload handlers reuse
//! them as flow-control acknowledgements via the [`ACKED_FIELD`] key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;

/// Well-known error codes, following HTTP conventions.
pub mod code {
    /// Client sent arguments the handler cannot act on.
    pub const BAD_REQUEST: u16 = 400;
    /// The session lacks the privilege the handler requires.
    pub const FORBIDDEN: u16 = 403;
    /// No handler registered under the requested namespace/command.
    pub const NOT_FOUND: u16 = 404;
    /// The client aborted the stream mid-operation.
    pub const CLIENT_ABORT: u16 = 499;
    /// Handler failure not attributable to the client.
    pub const INTERNAL: u16 = 500;
    /// The operation exceeded its deadline.
    pub const TIMEOUT: u16 = 504;
}

/// Progress key carrying cumulative acknowledged bytes for flow control.
pub const ACKED_FIELD: &str = "acked";

/// Terminal status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The operation completed.
    Ok,
    /// The operation failed; `error` and `code` describe how.
    Error,
}

/// The JSON record inside a `StreamResult` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    /// Terminal status.
    pub status: ResultStatus,
    /// Handler-defined payload, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Short human-readable message, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error code per [`code`], present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl StreamResult {
    /// Successful result carrying a payload.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            status: ResultStatus::Ok,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    /// Successful result with no payload.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self {
            status: ResultStatus::Ok,
            data: None,
            error: None,
            code: None,
        }
    }

    /// Failed result.
    #[must_use]
    pub fn error(message: impl Into<String>, code: u16) -> Self {
        Self {
            status: ResultStatus::Error,
            data: None,
            error: Some(message.into()),
            code: Some(code),
        }
    }

    /// Whether the stream completed successfully.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    /// Encode to the JSON bytes carried in a `StreamResult` frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of this shape cannot fail.
        serde_json::to_vec(self).expect("result record serializes")
    }

    /// Decode from a `StreamResult` frame payload.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::MalformedPayload` if the payload is not a
    /// valid result record.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(payload).map_err(|_| FrameError::MalformedPayload("result"))
    }
}

/// Extract the cumulative acknowledged byte count from a progress value,
/// if the handler chose to piggyback flow control on it.
#[must_use]
pub fn progress_acked(progress: &Value) -> Option<u64> {
    progress.get(ACKED_FIELD).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_roundtrip() {
        let result = StreamResult::ok(json!({"path": "/tmp/x", "size": 10}));
        let decoded = StreamResult::decode(&result.encode()).unwrap();
        assert_eq!(decoded, result);
        assert!(decoded.is_ok());
    }

    #[test]
    fn test_error_roundtrip() {
        let result = StreamResult::error("size mismatch: expected 10, got 9", code::BAD_REQUEST);
        let decoded = StreamResult::decode(&result.encode()).unwrap();
        assert_eq!(decoded.code, Some(400));
        assert!(!decoded.is_ok());
        assert!(decoded.error.unwrap().contains("size mismatch"));
    }

    #[test]
    fn test_ok_empty_omits_fields() {
        let encoded = StreamResult::ok_empty().encode();
        let text = String::from_utf8(encoded).unwrap();
        assert_eq!(text, r#"{"status":"ok"}"#);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(StreamResult::decode(b"not json").is_err());
        assert!(StreamResult::decode(b"{\"status\":\"maybe\"}").is_err());
    }

    #[test]
    fn test_progress_acked() {
        assert_eq!(progress_acked(&json!({"acked": 524288})), Some(524288));
        assert_eq!(progress_acked(&json!({"written": 10})), None);
        assert_eq!(progress_acked(&json!("opaque")), None);
    }
}
