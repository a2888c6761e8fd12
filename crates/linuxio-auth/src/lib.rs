//! # LinuxIO Auth Broker
//!
//! The single privileged entry point of the system. It listens on a
//! root-owned Unix socket, validates credentials against the host OS,
//! and on success forks a per-session bridge that **inherits the already
//! connected client socket**, so the web tier never opens a second
//! connection to reach its bridge.
//!
//! ## Handshake
//!
//! ```text
//!  web tier                broker                      bridge child
//!     │  AuthRequest  ───▶   │
//!     │                      │ verify password (shadow)
//!     │                      │ resolve uid/gid
//!     │                      │ spawn ──────────────────▶ dup2(client, fd 3)
//!     │                      │                           setgid/setuid, exec
//!     │  ◀─── AuthResponse   │ drop its copy of the fd
//!     │                      │
//!     │  ════ same socket is now the bridge channel ════▶
//! ```
//!
//! Password verification and bridge spawning are traits, so tests run
//! the full broker with an in-memory account list and an in-process
//! bridge.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod error;
pub mod spawn;
pub mod verify;

pub use broker::{AuthBroker, BrokerConfig};
pub use error::AuthError;
pub use spawn::{BRIDGE_FD, BridgeLaunch, BridgeSpawner, ExecBridgeSpawner};
pub use verify::{MemoryVerifier, PasswordVerifier, ShadowVerifier};

use std::path::PathBuf;

/// Default broker socket path.
pub const DEFAULT_AUTH_SOCKET: &str = "/run/linuxio/auth.sock";

/// Environment variable naming the broker socket for clients.
pub const ENV_AUTH_SOCKET: &str = "LINUXIO_AUTH_SOCKET";

/// Environment variable carrying the web tier's callback base URL.
pub const ENV_SERVER_BASE_URL: &str = "LINUXIO_SERVER_BASE_URL";

/// Environment variable carrying the web tier's TLS certificate.
pub const ENV_SERVER_CERT: &str = "LINUXIO_SERVER_CERT";

/// Environment variable carrying the per-session shared secret to the
/// bridge child (kept out of argv).
pub const ENV_BRIDGE_SECRET: &str = "LINUXIO_BRIDGE_SECRET";

/// Per-session bridge socket path: `/run/linuxio/<uid>/linuxio-bridge-<token>.sock`.
#[must_use]
pub fn bridge_socket_path(runtime_dir: &std::path::Path, uid: u32, token: &str) -> PathBuf {
    runtime_dir
        .join(uid.to_string())
        .join(format!("linuxio-bridge-{token}.sock"))
}
