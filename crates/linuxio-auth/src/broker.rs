//! The auth broker service: accept, verify, spawn, answer.

use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use linuxio_proto::auth::{
    AuthRequest, AuthResponse, read_auth_request, write_auth_response,
};
use linuxio_session::SessionUser;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

use crate::error::AuthError;
use crate::spawn::{BridgeLaunch, BridgeSpawner};
use crate::verify::{PasswordVerifier, read_motd};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Socket mode; world-connectable by default, auth happens in-band.
    pub socket_mode: u32,
    /// Message-of-the-day file returned on successful login.
    pub motd_path: PathBuf,
    /// Membership in this group grants a privileged session (uid 0
    /// always does).
    pub admin_group: Option<String>,
    /// Deadline for reading the login record off an accepted socket.
    pub request_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(crate::DEFAULT_AUTH_SOCKET),
            socket_mode: 0o666,
            motd_path: PathBuf::from("/etc/motd"),
            admin_group: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// The single privileged listener that authenticates users and spawns
/// their bridges.
#[derive(Clone)]
pub struct AuthBroker {
    config: Arc<BrokerConfig>,
    verifier: Arc<dyn PasswordVerifier>,
    spawner: Arc<dyn BridgeSpawner>,
}

impl AuthBroker {
    /// Assemble a broker.
    pub fn new(
        config: BrokerConfig,
        verifier: Arc<dyn PasswordVerifier>,
        spawner: Arc<dyn BridgeSpawner>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier,
            spawner,
        }
    }

    /// Bind the broker socket, replacing a stale one.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket directory cannot be prepared
    /// or the socket cannot be bound.
    pub fn bind(&self) -> Result<UnixListener, AuthError> {
        let path = &self.config.socket_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(AuthError::Io(err)),
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.config.socket_mode))?;
        tracing::info!(socket = %path.display(), "auth broker listening");
        Ok(listener)
    }

    /// Bind and serve until the task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from binding or accepting.
    pub async fn run(&self) -> Result<(), AuthError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve an already-bound listener.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from accepting; per-connection failures are
    /// answered in-band and logged.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), AuthError> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let broker = self.clone();
            tokio::spawn(async move {
                broker.handle_conn(stream).await;
            });
        }
    }

    async fn handle_conn(&self, mut stream: UnixStream) {
        let request = match timeout(
            self.config.request_timeout,
            read_auth_request(&mut stream),
        )
        .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "malformed auth request");
                respond_error(&mut stream, &AuthError::Wire(err)).await;
                return;
            }
            Err(_) => {
                respond_error(&mut stream, &AuthError::Timeout("request read")).await;
                return;
            }
        };

        match self.authorize(&request).await {
            Ok((launch, privileged)) => {
                // The child inherits the connected socket before we
                // answer; on "ok" the client flips straight to framing.
                if let Err(err) = self.spawner.spawn(stream.as_fd(), &launch) {
                    tracing::error!(user = %request.user, error = %err, "bridge spawn failed");
                    respond_error(&mut stream, &err).await;
                    return;
                }

                let motd = read_motd(&self.config.motd_path);
                let response = AuthResponse::ok(privileged, motd);
                if let Err(err) = write_auth_response(&mut stream, &response).await {
                    tracing::warn!(user = %request.user, error = %err, "auth response write failed");
                }
                // Dropping our copy leaves the child as the socket's
                // sole owner.
            }
            Err(err) => {
                tracing::warn!(user = %request.user, error = %err, "login rejected");
                respond_error(&mut stream, &err).await;
            }
        }
    }

    /// Verify credentials and resolve the account.
    async fn authorize(
        &self,
        request: &AuthRequest,
    ) -> Result<(BridgeLaunch, bool), AuthError> {
        // Password hashing is CPU-bound; keep it off the reactor.
        let verifier = Arc::clone(&self.verifier);
        let user = request.user.clone();
        let password = request.password.clone();
        tokio::task::spawn_blocking(move || verifier.verify(&user, &password))
            .await
            .map_err(|err| AuthError::Io(std::io::Error::other(err)))??;

        let account = nix::unistd::User::from_name(&request.user)
            .map_err(|err| AuthError::Io(std::io::Error::other(err)))?
            .ok_or_else(|| AuthError::UserNotFound(request.user.clone()))?;
        let uid = account.uid.as_raw();
        let gid = account.gid.as_raw();

        let privileged = uid == 0 || self.in_admin_group(&request.user);

        let launch = BridgeLaunch {
            user: SessionUser {
                name: request.user.clone(),
                uid,
                gid,
            },
            privileged,
            session_id: request.session_id.clone(),
            secret: request.secret.clone(),
            bridge_path: request.bridge_path.clone(),
            env_mode: request.env_mode,
            verbose: request.verbose,
            server_base_url: request.server_base_url.clone(),
            server_cert: request.server_cert.clone(),
        };
        Ok((launch, privileged))
    }

    fn in_admin_group(&self, user: &str) -> bool {
        let Some(group_name) = &self.config.admin_group else {
            return false;
        };
        match nix::unistd::Group::from_name(group_name) {
            Ok(Some(group)) => group.mem.iter().any(|member| member == user),
            Ok(None) => {
                tracing::warn!(group = %group_name, "admin group does not exist");
                false
            }
            Err(err) => {
                tracing::warn!(group = %group_name, error = %err, "admin group lookup failed");
                false
            }
        }
    }
}

async fn respond_error(stream: &mut UnixStream, err: &AuthError) {
    let response = AuthResponse::error(err.wire_code());
    if let Err(write_err) = write_auth_response(stream, &response).await {
        tracing::debug!(error = %write_err, "auth error response not delivered");
    }
}
