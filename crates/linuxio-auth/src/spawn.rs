//! Bridge spawning: fork, drop privileges, hand over the client socket.
//!
//! The broker never passes the socket over a second connection. The
//! child is spawned with the connected socket duplicated onto a
//! well-known fd, group/user identity switched to the target account,
//! and the bridge binary exec'd in place.

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use linuxio_proto::EnvMode;
use linuxio_session::SessionUser;

use crate::error::AuthError;
use crate::{ENV_AUTH_SOCKET, ENV_BRIDGE_SECRET, ENV_SERVER_BASE_URL, ENV_SERVER_CERT};

/// The fd number the bridge child finds its client socket on.
pub const BRIDGE_FD: i32 = 3;

/// Everything a bridge child needs to start serving one session.
#[derive(Debug, Clone)]
pub struct BridgeLaunch {
    /// The authenticated account the bridge runs as.
    pub user: SessionUser,
    /// Whether the session is privileged (uid 0 or admin group).
    pub privileged: bool,
    /// Session id the bridge serves.
    pub session_id: String,
    /// Per-session shared secret for the reconnect handshake.
    pub secret: String,
    /// Path where the bridge binds its reconnect socket.
    pub bridge_path: String,
    /// Deployment mode.
    pub env_mode: EnvMode,
    /// Verbose bridge logging.
    pub verbose: bool,
    /// Web tier callback base URL.
    pub server_base_url: String,
    /// Web tier TLS certificate (PEM).
    pub server_cert: String,
}

/// Spawns the per-session bridge with the client socket attached.
///
/// A trait so tests can run an in-process bridge on a duplicate of the
/// same socket instead of forking.
pub trait BridgeSpawner: Send + Sync {
    /// Spawn the bridge for `launch`, giving it `client`.
    ///
    /// The caller keeps its copy of `client` to write the auth response;
    /// it drops that copy right after, leaving the child as the socket's
    /// sole owner.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::ForkFailed` when the process cannot be
    /// created and `AuthError::BridgeExecFailed` when the binary cannot
    /// be executed.
    fn spawn(&self, client: BorrowedFd<'_>, launch: &BridgeLaunch) -> Result<(), AuthError>;
}

/// Production spawner: fork + setgid/setuid + exec of the bridge binary.
pub struct ExecBridgeSpawner {
    binary: PathBuf,
    auth_socket: PathBuf,
}

impl ExecBridgeSpawner {
    /// Spawner exec'ing `binary`, advertising `auth_socket` to the child.
    pub fn new(binary: impl Into<PathBuf>, auth_socket: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            auth_socket: auth_socket.into(),
        }
    }
}

impl BridgeSpawner for ExecBridgeSpawner {
    fn spawn(&self, client: BorrowedFd<'_>, launch: &BridgeLaunch) -> Result<(), AuthError> {
        let raw = client.as_raw_fd();
        let uid = launch.user.uid;
        let gid = launch.user.gid;
        let name = CString::new(launch.user.name.as_str())
            .map_err(|_| AuthError::UserNotFound(launch.user.name.clone()))?;

        let mut command = std::process::Command::new(&self.binary);
        command
            .arg("--session-id")
            .arg(&launch.session_id)
            .arg("--bridge-socket")
            .arg(&launch.bridge_path)
            .arg("--env")
            .arg(match launch.env_mode {
                EnvMode::Production => "production",
                EnvMode::Development => "development",
            })
            .env(ENV_AUTH_SOCKET, &self.auth_socket)
            .env(ENV_BRIDGE_SECRET, &launch.secret)
            .env(ENV_SERVER_BASE_URL, &launch.server_base_url)
            .env(ENV_SERVER_CERT, &launch.server_cert);
        if launch.privileged {
            command.arg("--privileged");
        }
        if launch.verbose {
            command.arg("--verbose");
        }

        // Runs in the child between fork and exec: attach the socket on
        // the well-known fd (dup2 clears close-on-exec), then drop to
        // the target identity, groups first.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(raw, BRIDGE_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::initgroups(name.as_ptr(), gid as libc::gid_t) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(gid as libc::gid_t) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(uid as libc::uid_t) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = tokio::process::Command::from(command)
            .spawn()
            .map_err(classify_spawn_error)?;

        tracing::info!(
            session = %launch.session_id,
            user = %launch.user.name,
            uid,
            pid = child.id(),
            "bridge spawned"
        );

        // Reap the child; its exit is the session's bridge_failure signal
        // as observed by the web tier when the channel drops.
        let session_id = launch.session_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(session = %session_id, %status, "bridge exited");
                }
                Err(err) => {
                    tracing::warn!(session = %session_id, error = %err, "bridge reap failed");
                }
            }
        });

        Ok(())
    }
}

pub(crate) fn classify_spawn_error(err: std::io::Error) -> AuthError {
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::ENOMEM => {
            AuthError::ForkFailed(err.to_string())
        }
        _ => AuthError::BridgeExecFailed(err.to_string()),
    }
}
