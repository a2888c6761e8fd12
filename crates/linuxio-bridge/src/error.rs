//! Bridge error types.

use linuxio_mux::MuxError;
use linuxio_proto::result::code;
use thiserror::Error;

/// A handler failure, already mapped to a wire error code and a short
/// message. Raw OS error text never crosses the frame boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct HandlerError {
    /// Error code per [`linuxio_proto::result::code`].
    pub code: u16,
    /// Short, user-presentable message.
    pub message: String,
}

impl HandlerError {
    /// A handler error with an explicit code.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The client sent arguments the handler cannot act on.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(code::BAD_REQUEST, message)
    }

    /// The session lacks the required privilege.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(code::FORBIDDEN, message)
    }

    /// The named thing does not exist.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(code::NOT_FOUND, message)
    }

    /// The client aborted the stream.
    #[must_use]
    pub fn aborted() -> Self {
        Self::new(code::CLIENT_ABORT, "aborted")
    }

    /// Internal failure not attributable to the client.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL, message)
    }

    /// A deadline passed.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(code::TIMEOUT, message)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        // Map kinds to short messages instead of leaking OS error text.
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found("file not found"),
            std::io::ErrorKind::PermissionDenied => Self::forbidden("permission denied"),
            std::io::ErrorKind::AlreadyExists => Self::bad_request("already exists"),
            _ => Self::internal("I/O failure"),
        }
    }
}

impl From<MuxError> for HandlerError {
    fn from(_: MuxError) -> Self {
        Self::internal("channel lost")
    }
}

impl From<crate::bus::BusError> for HandlerError {
    fn from(err: crate::bus::BusError) -> Self {
        use crate::bus::BusError;
        match err {
            BusError::Timeout(label) => {
                Self::timeout(format!("bus call timed out ({label})"))
            }
            BusError::Unavailable(_) => Self::internal("system bus unavailable"),
            BusError::Closed(_) => Self::internal("system bus connection lost"),
            BusError::Call { name, .. } => Self::internal(format!("bus call failed: {name}")),
            BusError::Decode(_) => Self::internal("bus reply malformed"),
        }
    }
}

/// Runtime-level bridge failures (not per-stream).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The inherited client fd could not be adopted.
    #[error("cannot adopt inherited socket: {0}")]
    InheritedFd(std::io::Error),

    /// Reconnect socket setup failed.
    #[error("bridge socket error: {0}")]
    Socket(std::io::Error),

    /// Invalid runtime configuration.
    #[error("invalid bridge configuration: {0}")]
    Config(String),

    /// Channel failure below the stream layer.
    #[error("mux error: {0}")]
    Mux(#[from] MuxError),
}
