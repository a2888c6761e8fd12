//! The login round trip on the broker socket.

use std::path::PathBuf;
use std::time::Duration;

use linuxio_proto::auth::{
    AuthRequest, AuthResponse, EnvMode, read_auth_response, write_auth_request,
};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::ClientError;

/// Connect deadline.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Request write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Response read deadline; password verification may be slow.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to sign a user in and address their bridge.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Broker socket path.
    pub socket_path: PathBuf,
    /// Account name.
    pub user: String,
    /// Account password.
    pub password: String,
    /// Session id the new bridge will serve.
    pub session_id: String,
    /// Where the bridge should bind its reconnect socket.
    pub bridge_path: String,
    /// Per-session shared secret for the reconnect handshake.
    pub secret: String,
    /// Deployment mode handed to the bridge.
    pub env_mode: EnvMode,
    /// Verbose bridge logging.
    pub verbose: bool,
    /// Web tier callback base URL.
    pub server_base_url: String,
    /// Web tier TLS certificate (PEM).
    pub server_cert: String,
}

/// Perform the login round trip. On success the returned socket **is**
/// the bridge channel; hand it straight to a multiplexer.
///
/// # Errors
///
/// Returns `DaemonUnavailable` when the broker socket is missing or
/// refusing, `Timeout` when a handshake deadline passes, and `Auth`
/// with the broker's failure token when login is rejected.
pub async fn authenticate(
    options: &AuthOptions,
) -> Result<(AuthResponse, UnixStream), ClientError> {
    let mut stream = timeout(DIAL_TIMEOUT, UnixStream::connect(&options.socket_path))
        .await
        .map_err(|_| ClientError::Timeout("dial"))?
        .map_err(|err| {
            ClientError::DaemonUnavailable(format!(
                "{}: {err}",
                options.socket_path.display()
            ))
        })?;

    let request = AuthRequest {
        env_mode: options.env_mode,
        verbose: options.verbose,
        flags: 0,
        user: options.user.clone(),
        password: options.password.clone(),
        session_id: options.session_id.clone(),
        bridge_path: options.bridge_path.clone(),
        secret: options.secret.clone(),
        server_base_url: options.server_base_url.clone(),
        server_cert: options.server_cert.clone(),
    };

    timeout(WRITE_TIMEOUT, write_auth_request(&mut stream, &request))
        .await
        .map_err(|_| ClientError::Timeout("request write"))??;

    let response = timeout(READ_TIMEOUT, read_auth_response(&mut stream))
        .await
        .map_err(|_| ClientError::Timeout("response read"))??;

    if response.is_ok() {
        tracing::info!(user = %options.user, privileged = response.privileged, "login accepted");
        Ok((response, stream))
    } else {
        Err(ClientError::Auth(response.error))
    }
}
