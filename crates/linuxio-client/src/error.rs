//! Client error types.

use linuxio_mux::MuxError;
use linuxio_proto::WireError;
use thiserror::Error;

/// Failures on the web tier's side of the substrate.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker (or bridge) socket is missing or refusing.
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// The broker rejected the login.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The bridge refused the reconnect handshake.
    #[error("reconnect refused")]
    ReconnectRefused,

    /// A handshake deadline passed.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// The bridge channel is gone and the one permitted retry failed or
    /// was already spent.
    #[error("bridge channel lost")]
    ChannelLost,

    /// The stream ended without a result record.
    #[error("stream closed without result")]
    NoResult,

    /// Stream-layer failure.
    #[error("mux error: {0}")]
    Mux(#[from] MuxError),

    /// Malformed record on the auth socket.
    #[error("auth wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether this failure means the channel died (and a fresh channel
    /// may succeed).
    #[must_use]
    pub fn is_channel_lost(&self) -> bool {
        match self {
            ClientError::ChannelLost => true,
            ClientError::Mux(err) => err.is_channel_lost(),
            _ => false,
        }
    }
}
