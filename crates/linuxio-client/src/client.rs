//! Per-session bridge client: call API, demux, reconnect.

use std::sync::Arc;

use linuxio_mux::{
    CloseReason, Multiplexer, MuxConfig, StreamEvent, StreamHandle,
};
use linuxio_proto::{OpenRequest, StreamResult};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::auth::{AuthOptions, DIAL_TIMEOUT, authenticate};
use crate::error::ClientError;

/// The collected outcome of a unidirectional call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Terminal result record.
    pub result: StreamResult,
    /// Progress records, in order.
    pub progress: Vec<Value>,
    /// Concatenated data chunks (downloads).
    pub data: Vec<u8>,
}

struct ClientInner {
    mux: std::sync::RwLock<Arc<Multiplexer>>,
    bridge_path: String,
    secret: String,
    mux_config: MuxConfig,
}

/// The web tier's handle to one session's bridge.
///
/// Cloning is cheap; clones share the channel and its reconnect state.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    /// Sign the user in and wrap the resulting socket as the bridge
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns auth and transport failures per [`authenticate`].
    pub async fn connect(
        options: &AuthOptions,
        mux_config: MuxConfig,
    ) -> Result<(Self, linuxio_proto::AuthResponse), ClientError> {
        let (response, stream) = authenticate(options).await?;
        let mux = Multiplexer::client(stream, mux_config.clone());
        Ok((
            Self {
                inner: Arc::new(ClientInner {
                    mux: std::sync::RwLock::new(Arc::new(mux)),
                    bridge_path: options.bridge_path.clone(),
                    secret: options.secret.clone(),
                    mux_config,
                }),
            },
            response,
        ))
    }

    /// Wrap an already-established channel (tests, embedded setups).
    #[must_use]
    pub fn from_channel(
        mux: Multiplexer,
        bridge_path: impl Into<String>,
        secret: impl Into<String>,
        mux_config: MuxConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                mux: std::sync::RwLock::new(Arc::new(mux)),
                bridge_path: bridge_path.into(),
                secret: secret.into(),
                mux_config,
            }),
        }
    }

    fn current_mux(&self) -> Arc<Multiplexer> {
        Arc::clone(&self.inner.mux.read().expect("mux lock"))
    }

    /// Whether the current channel is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_mux().is_closed()
    }

    /// Tear the channel down.
    pub fn shutdown(&self) {
        self.current_mux().shutdown();
    }

    /// Open a raw stream on the current channel, for bidirectional
    /// operations the caller drives itself (uploads, terminals).
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn open_stream(&self, open: &OpenRequest) -> Result<StreamHandle, ClientError> {
        Ok(self.current_mux().open_stream(open).await?)
    }

    /// Open a PTY terminal stream.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn open_terminal(
        &self,
        shell: Option<String>,
    ) -> Result<StreamHandle, ClientError> {
        let args = shell.into_iter().collect();
        self.open_stream(&OpenRequest::new("terminal", "terminal", "open", args))
            .await
    }

    /// Invoke a unidirectional handler and collect its outcome.
    ///
    /// If the channel closes under the call, the client reconnects
    /// through the session's bridge socket and retries exactly once.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when both the call and its single retry
    /// fail, `NoResult` when a stream ends without a result record, and
    /// transport errors otherwise.
    pub async fn call(
        &self,
        namespace: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<CallOutcome, ClientError> {
        let open = OpenRequest::new("call", namespace, command, args);
        match self.call_once(&open).await {
            Err(err) if err.is_channel_lost() => {
                tracing::debug!(
                    %namespace,
                    %command,
                    "channel lost mid-call, reconnecting once"
                );
                self.reconnect().await?;
                self.call_once(&open).await
            }
            other => other,
        }
    }

    async fn call_once(&self, open: &OpenRequest) -> Result<CallOutcome, ClientError> {
        let mux = self.current_mux();
        let mut handle = mux.open_stream(open).await?;
        handle.close().await?;

        let mut progress = Vec::new();
        let mut data = Vec::new();
        loop {
            match handle.next_event().await {
                Some(StreamEvent::Data(chunk)) => data.extend_from_slice(&chunk),
                Some(StreamEvent::Progress(value)) => progress.push(value),
                Some(StreamEvent::Result(result)) => {
                    return Ok(CallOutcome {
                        result,
                        progress,
                        data,
                    });
                }
                Some(StreamEvent::Resize { .. }) => {}
                Some(StreamEvent::Closed(CloseReason::ChannelLost)) => {
                    return Err(ClientError::ChannelLost);
                }
                Some(StreamEvent::Closed(_)) | None => return Err(ClientError::NoResult),
            }
        }
    }

    /// Re-establish the channel through the session's bridge socket,
    /// proving possession of the shared secret.
    ///
    /// # Errors
    ///
    /// Returns `DaemonUnavailable` when the bridge socket is gone,
    /// `ReconnectRefused` on a secret mismatch, and `Timeout` when the
    /// handshake stalls.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        if self.inner.bridge_path.is_empty() {
            return Err(ClientError::ChannelLost);
        }

        let mut stream = timeout(
            DIAL_TIMEOUT,
            UnixStream::connect(&self.inner.bridge_path),
        )
        .await
        .map_err(|_| ClientError::Timeout("reconnect dial"))?
        .map_err(|err| {
            ClientError::DaemonUnavailable(format!("{}: {err}", self.inner.bridge_path))
        })?;

        let secret = self.inner.secret.as_bytes();
        let mut handshake = Vec::with_capacity(2 + secret.len());
        handshake.extend_from_slice(&(secret.len() as u16).to_be_bytes());
        handshake.extend_from_slice(secret);
        timeout(DIAL_TIMEOUT, stream.write_all(&handshake))
            .await
            .map_err(|_| ClientError::Timeout("reconnect handshake"))??;

        let mut status = [0u8; 1];
        timeout(DIAL_TIMEOUT, stream.read_exact(&mut status))
            .await
            .map_err(|_| ClientError::Timeout("reconnect handshake"))??;
        if status[0] != 1 {
            return Err(ClientError::ReconnectRefused);
        }

        let fresh = Multiplexer::client(stream, self.inner.mux_config.clone());
        let previous = {
            let mut mux = self.inner.mux.write().expect("mux lock");
            std::mem::replace(&mut *mux, Arc::new(fresh))
        };
        previous.shutdown();
        tracing::info!(socket = %self.inner.bridge_path, "bridge channel re-established");
        Ok(())
    }
}

impl linuxio_session::BridgeLink for BridgeClient {
    fn close(&self) {
        self.shutdown();
    }
}
