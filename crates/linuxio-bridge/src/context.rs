//! Per-stream execution context.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// The session this bridge serves, fixed at process start.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session id from the auth handshake.
    pub session_id: String,
    /// Account name.
    pub user: String,
    /// Numeric user id the bridge runs as.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Whether privileged handlers are allowed.
    pub privileged: bool,
}

/// Context handed to every handler invocation.
///
/// The cancellation token fires when the client aborts the stream, the
/// channel is lost, or the bridge is shutting down. Handlers observing
/// it must release scoped resources promptly and return.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Id of the stream being served.
    pub stream_id: u32,
    /// The session on whose behalf the handler runs.
    pub session: Arc<SessionInfo>,
    /// Cooperative cancellation for this stream.
    pub cancel: CancellationToken,
}

impl StreamContext {
    /// Whether the stream has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
