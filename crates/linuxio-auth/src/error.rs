//! Auth broker error types.

use linuxio_proto::WireError;
use thiserror::Error;

/// Failures of the login round trip (closed taxonomy on the wire).
#[derive(Debug, Error)]
pub enum AuthError {
    /// The broker socket is missing or refuses connections.
    #[error("auth daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// Password check failed.
    #[error("bad credentials")]
    BadCredentials,

    /// The account does not exist on this host.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Forking the bridge child failed.
    #[error("fork failed: {0}")]
    ForkFailed(String),

    /// The bridge binary could not be executed.
    #[error("bridge exec failed: {0}")]
    BridgeExecFailed(String),

    /// A handshake deadline passed.
    #[error("auth timeout during {0}")]
    Timeout(&'static str),

    /// Malformed record on the auth socket.
    #[error("auth wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error on the auth socket.
    #[error("auth I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// Stable failure token carried in `AuthResponse.error`.
    #[must_use]
    pub fn wire_code(&self) -> &'static str {
        match self {
            AuthError::DaemonUnavailable(_) => "daemon_unavailable",
            AuthError::BadCredentials => "bad_credentials",
            AuthError::UserNotFound(_) => "user_not_found",
            AuthError::ForkFailed(_) => "fork_failed",
            AuthError::BridgeExecFailed(_) => "bridge_exec_failed",
            AuthError::Timeout(_) => "timeout",
            AuthError::Wire(_) | AuthError::Io(_) => "protocol_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(AuthError::BadCredentials.wire_code(), "bad_credentials");
        assert_eq!(
            AuthError::UserNotFound("x".into()).wire_code(),
            "user_not_found"
        );
        assert_eq!(AuthError::Timeout("read").wire_code(), "timeout");
        assert_eq!(
            AuthError::DaemonUnavailable("gone".into()).wire_code(),
            "daemon_unavailable"
        );
    }
}
