//! Auth handshake records.
//!
//! The broker socket speaks one binary round trip: the client writes an
//! [`AuthRequest`], the broker answers with an [`AuthResponse`]. Strings
//! are length-prefixed with a big-endian `u16`; the leading four bytes of
//! each record are fixed flags. On `Ok` the same socket becomes the
//! bridge channel, so nothing else is ever framed this way.
//!
//! Requests carry the user's password; the record zeroizes its fields on
//! drop.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WireError;

/// Auth handshake protocol version.
pub const AUTH_PROTOCOL_VERSION: u8 = 1;

/// Sanity cap for a single length-prefixed field.
pub const MAX_AUTH_FIELD: usize = 16 * 1024;

/// Deployment mode the bridge child should assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EnvMode {
    /// Hardened defaults; secure cookies, quiet logs.
    #[default]
    Production = 0,
    /// Developer conveniences enabled.
    Development = 1,
}

impl EnvMode {
    /// Decode from the wire byte; unknown values fall back to production.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Development,
            _ => Self::Production,
        }
    }

    /// Encode to the wire byte.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Login request written by the web tier.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuthRequest {
    /// Deployment mode for the bridge child.
    #[zeroize(skip)]
    pub env_mode: EnvMode,
    /// Verbose logging in the bridge child.
    pub verbose: bool,
    /// Reserved flag bits.
    pub flags: u8,
    /// Target account name.
    pub user: String,
    /// Account password, verified against the host OS.
    pub password: String,
    /// Session id the bridge will serve.
    pub session_id: String,
    /// Path where the bridge binds its reconnect socket.
    pub bridge_path: String,
    /// Per-session shared secret for the reconnect handshake.
    pub secret: String,
    /// Callback base URL of the web tier.
    pub server_base_url: String,
    /// Web tier TLS certificate (PEM) for the callback.
    pub server_cert: String,
}

/// Login outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthStatus {
    /// Credentials accepted; the socket is now the bridge channel.
    Ok = 0,
    /// Login failed; `error` names the failure.
    Error = 1,
}

impl TryFrom<u8> for AuthStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            other => Err(WireError::InvalidStatus(other)),
        }
    }
}

/// Broker's answer to an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Login outcome.
    pub status: AuthStatus,
    /// Whether the session is privileged.
    pub privileged: bool,
    /// Message of the day, shown after sign-in.
    pub motd: String,
    /// Failure description when `status` is `Error`.
    pub error: String,
}

impl AuthResponse {
    /// Successful response.
    #[must_use]
    pub fn ok(privileged: bool, motd: impl Into<String>) -> Self {
        Self {
            status: AuthStatus::Ok,
            privileged,
            motd: motd.into(),
            error: String::new(),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AuthStatus::Error,
            privileged: false,
            motd: String::new(),
            error: message.into(),
        }
    }

    /// Whether login succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == AuthStatus::Ok
    }
}

fn put_str(buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), WireError> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_AUTH_FIELD || bytes.len() > usize::from(u16::MAX) {
        return Err(WireError::FieldTooLong {
            field,
            len: bytes.len(),
            max: MAX_AUTH_FIELD,
        });
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

async fn get_str<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &'static str,
) -> Result<String, WireError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = usize::from(u16::from_be_bytes(len_bytes));
    if len > MAX_AUTH_FIELD {
        return Err(WireError::FieldTooLong {
            field,
            len,
            max: MAX_AUTH_FIELD,
        });
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(field))
}

/// Write an auth request as one buffer.
///
/// # Errors
///
/// Returns `WireError::FieldTooLong` if any string exceeds the cap, or an
/// I/O error from the stream.
pub async fn write_auth_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &AuthRequest,
) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(64);
    buf.push(AUTH_PROTOCOL_VERSION);
    buf.push(request.env_mode.as_byte());
    buf.push(u8::from(request.verbose));
    buf.push(request.flags);
    put_str(&mut buf, "user", &request.user)?;
    put_str(&mut buf, "password", &request.password)?;
    put_str(&mut buf, "session_id", &request.session_id)?;
    put_str(&mut buf, "bridge_path", &request.bridge_path)?;
    put_str(&mut buf, "secret", &request.secret)?;
    put_str(&mut buf, "server_base_url", &request.server_base_url)?;
    put_str(&mut buf, "server_cert", &request.server_cert)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    buf.zeroize();
    Ok(())
}

/// Read an auth request.
///
/// # Errors
///
/// Returns `WireError::UnsupportedVersion` on a version mismatch,
/// `WireError::Truncated` if the stream ends mid-record, and field errors
/// per [`WireError`].
pub async fn read_auth_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<AuthRequest, WireError> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[0] != AUTH_PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(head[0]));
    }

    let user = get_str(reader, "user").await?;
    let password = get_str(reader, "password").await?;
    let session_id = get_str(reader, "session_id").await?;
    let bridge_path = get_str(reader, "bridge_path").await?;
    let secret = get_str(reader, "secret").await?;
    let server_base_url = get_str(reader, "server_base_url").await?;
    let server_cert = get_str(reader, "server_cert").await?;

    Ok(AuthRequest {
        env_mode: EnvMode::from_byte(head[1]),
        verbose: head[2] != 0,
        flags: head[3],
        user,
        password,
        session_id,
        bridge_path,
        secret,
        server_base_url,
        server_cert,
    })
}

/// Write an auth response as one buffer.
///
/// # Errors
///
/// Returns `WireError::FieldTooLong` if a string exceeds the cap, or an
/// I/O error from the stream.
pub async fn write_auth_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &AuthResponse,
) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(16);
    buf.push(AUTH_PROTOCOL_VERSION);
    buf.push(response.status as u8);
    buf.push(u8::from(response.privileged));
    buf.push(0); // Reserved
    put_str(&mut buf, "motd", &response.motd)?;
    put_str(&mut buf, "error", &response.error)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an auth response.
///
/// # Errors
///
/// Returns `WireError::UnsupportedVersion` on a version mismatch,
/// `WireError::InvalidStatus` for an unknown status byte, and field
/// errors per [`WireError`].
pub async fn read_auth_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<AuthResponse, WireError> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[0] != AUTH_PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(head[0]));
    }
    let status = AuthStatus::try_from(head[1])?;
    let privileged = head[2] != 0;
    let motd = get_str(reader, "motd").await?;
    let error = get_str(reader, "error").await?;

    Ok(AuthResponse {
        status,
        privileged,
        motd,
        error,
    })
}
