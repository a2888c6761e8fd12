//! The bridge runtime: adopt the inherited socket, serve channels,
//! drain on shutdown.

use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use linuxio_mux::{Multiplexer, MuxConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::SessionInfo;
use crate::dispatch::Dispatcher;
use crate::error::BridgeError;
use crate::registry::HandlerRegistry;

/// The fd number the auth broker leaves the client socket on.
pub const INHERITED_CLIENT_FD: i32 = 3;

/// Bridge runtime configuration, assembled from argv and environment by
/// the bridge binary.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The session this bridge serves.
    pub session: SessionInfo,
    /// Per-session shared secret guarding the reconnect socket.
    pub secret: String,
    /// Web tier callback base URL, advertised to handlers that push
    /// state back out of band.
    pub server_base_url: String,
    /// Web tier TLS certificate (PEM) for the callback.
    pub server_cert: String,
    /// Reconnect socket path; `None` disables reconnection.
    pub bridge_socket: Option<PathBuf>,
    /// How long in-flight streams may drain after shutdown.
    pub drain_deadline: Duration,
    /// How long to stay alive after the primary channel drops, waiting
    /// for the web tier to reconnect.
    pub reconnect_linger: Duration,
    /// Multiplexer tuning.
    pub mux: MuxConfig,
}

impl BridgeConfig {
    /// Configuration with default deadlines.
    #[must_use]
    pub fn new(session: SessionInfo, secret: impl Into<String>) -> Self {
        Self {
            session,
            secret: secret.into(),
            server_base_url: String::new(),
            server_cert: String::new(),
            bridge_socket: None,
            drain_deadline: Duration::from_secs(5),
            reconnect_linger: Duration::from_secs(10),
            mux: MuxConfig::default(),
        }
    }
}

struct RuntimeInner {
    config: BridgeConfig,
    registry: Arc<HandlerRegistry>,
    session: Arc<SessionInfo>,
    shutdown: CancellationToken,
    channels: watch::Sender<usize>,
}

/// One bridge process: registry, shutdown, and the channels it serves.
#[derive(Clone)]
pub struct BridgeRuntime {
    inner: Arc<RuntimeInner>,
}

impl BridgeRuntime {
    /// Assemble a runtime over a frozen registry.
    #[must_use]
    pub fn new(config: BridgeConfig, registry: HandlerRegistry) -> Self {
        Self::with_shutdown_token(config, registry, CancellationToken::new())
    }

    /// Assemble a runtime sharing an externally created shutdown token,
    /// so handlers registered before the runtime (e.g.
    /// `control.shutdown`) can trigger its drain.
    #[must_use]
    pub fn with_shutdown_token(
        config: BridgeConfig,
        registry: HandlerRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let session = Arc::new(config.session.clone());
        let (channels, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                registry: Arc::new(registry),
                session,
                shutdown,
                channels,
            }),
        }
    }

    /// Token cancelled when the bridge should stop; `control.shutdown`
    /// and signal handlers share it.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Adopt the broker-inherited socket and serve until shutdown.
    ///
    /// When a reconnect socket is configured, the bridge outlives the
    /// primary channel by the configured linger so the web tier can
    /// reattach through it.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InheritedFd` if the fd cannot be adopted
    /// and `BridgeError::Socket` for reconnect socket failures.
    pub async fn serve_inherited(&self) -> Result<(), BridgeError> {
        let stream = adopt_inherited()?;

        let listener_task = match &self.inner.config.bridge_socket {
            Some(path) => {
                let listener = self.bind_reconnect(path)?;
                let runtime = self.clone();
                Some(tokio::spawn(async move {
                    runtime.accept_reconnects(listener).await;
                }))
            }
            None => None,
        };

        let result = self.serve_stream(stream).await;

        if listener_task.is_some() && !self.inner.shutdown.is_cancelled() {
            self.await_reconnect_drain().await;
        }
        if let Some(task) = listener_task {
            task.abort();
        }
        if let Some(path) = &self.inner.config.bridge_socket {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!(session = %self.inner.session.session_id, "bridge exiting");
        result
    }

    /// Serve one channel to completion: dispatch every incoming stream,
    /// then drain in-flight handlers up to the deadline.
    ///
    /// # Errors
    ///
    /// Infallible today; the signature leaves room for channel-level
    /// failures surfacing here.
    pub async fn serve_stream<S>(&self, io: S) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, mut incoming) = Multiplexer::server(io, self.inner.config.mux.clone());
        let sink = mux.sink();
        self.inner.channels.send_modify(|n| *n += 1);

        let tracker = TaskTracker::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.session),
            self.inner.shutdown.clone(),
        );

        loop {
            tokio::select! {
                maybe = incoming.recv() => match maybe {
                    Some(stream) => {
                        tracing::debug!(
                            stream = stream.id,
                            namespace = %stream.open.namespace,
                            command = %stream.open.command,
                            "stream accepted"
                        );
                        tracker.spawn(dispatcher.clone().run(stream, sink.clone()));
                    }
                    None => break,
                },
                () = self.inner.shutdown.cancelled() => break,
            }
        }

        tracker.close();
        if tokio::time::timeout(self.inner.config.drain_deadline, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                deadline_ms = self.inner.config.drain_deadline.as_millis() as u64,
                "drain deadline exceeded, dropping in-flight streams"
            );
        }
        mux.shutdown();
        self.inner.channels.send_modify(|n| *n -= 1);
        Ok(())
    }

    /// Bind the configured reconnect socket and serve it until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` when no reconnect socket is
    /// configured and `BridgeError::Socket` for bind failures.
    pub async fn serve_reconnect_socket(&self) -> Result<(), BridgeError> {
        let path = self
            .inner
            .config
            .bridge_socket
            .clone()
            .ok_or_else(|| BridgeError::Config("no bridge socket configured".to_string()))?;
        let listener = self.bind_reconnect(&path)?;
        self.clone().accept_reconnects(listener).await;
        Ok(())
    }

    fn bind_reconnect(&self, path: &PathBuf) -> Result<UnixListener, BridgeError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(BridgeError::Socket)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(BridgeError::Socket(err)),
        }
        let listener = UnixListener::bind(path).map_err(BridgeError::Socket)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(BridgeError::Socket)?;
        tracing::info!(socket = %path.display(), "reconnect socket bound");
        Ok(listener)
    }

    async fn accept_reconnects(self, listener: UnixListener) {
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let runtime = self.clone();
                        tokio::spawn(async move {
                            runtime.handle_reconnect(stream).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "reconnect accept failed");
                        return;
                    }
                }
            }
        }
    }

    /// A reconnecting client proves possession of the session secret
    /// before the socket becomes a bridge channel.
    async fn handle_reconnect(&self, mut stream: UnixStream) {
        let presented =
            match tokio::time::timeout(Duration::from_secs(5), read_secret(&mut stream)).await {
                Ok(Ok(secret)) => secret,
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "reconnect handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!("reconnect handshake timed out");
                    return;
                }
            };

        if !secrets_match(&presented, self.inner.config.secret.as_bytes()) {
            tracing::warn!("reconnect with wrong secret refused");
            let _ = stream.write_all(&[0]).await;
            return;
        }

        if stream.write_all(&[1]).await.is_err() {
            return;
        }
        tracing::info!(session = %self.inner.session.session_id, "reconnect accepted");
        let _ = self.serve_stream(stream).await;
    }

    /// After the primary channel drops, stay alive while reconnect
    /// channels are active and for one linger window beyond the last.
    async fn await_reconnect_drain(&self) {
        let linger = self.inner.config.reconnect_linger;
        let mut rx = self.inner.channels.subscribe();
        loop {
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            let active = *rx.borrow_and_update();
            if active == 0 {
                match tokio::time::timeout(linger, rx.changed()).await {
                    Err(_) | Ok(Err(_)) => return,
                    Ok(Ok(())) => {}
                }
            } else {
                tokio::select! {
                    () = self.inner.shutdown.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn adopt_inherited() -> Result<UnixStream, BridgeError> {
    // The broker dup2'd the connected client socket onto the well-known
    // fd before exec; we are its sole owner from here on.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(INHERITED_CLIENT_FD) };
    std_stream
        .set_nonblocking(true)
        .map_err(BridgeError::InheritedFd)?;
    UnixStream::from_std(std_stream).map_err(BridgeError::InheritedFd)
}

async fn read_secret(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes).await?;
    let len = usize::from(u16::from_be_bytes(len_bytes));
    if len == 0 || len > 1024 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "secret length out of range",
        ));
    }
    let mut secret = vec![0u8; len];
    stream.read_exact(&mut secret).await?;
    Ok(secret)
}

/// Constant-time comparison; length mismatch still touches every byte.
fn secrets_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
