//! Session records and identity material.

use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use rand::rngs::OsRng;

/// Generate an opaque 128-bit session id as 32 lowercase hex chars.
#[must_use]
pub fn generate_session_id() -> String {
    generate_token()
}

/// Generate a 128-bit crypto-random token as 32 lowercase hex chars,
/// used for session ids and per-session bridge socket names.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The account a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    /// Account name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
}

/// Why a session was deleted (closed set, surfaced to delete hooks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Explicit logout by the user.
    Logout,
    /// Idle timeout passed.
    GcIdle,
    /// Absolute lifetime passed.
    GcAbsolute,
    /// Administrative removal, including single-session displacement.
    Manual,
    /// The web tier is shutting down.
    ServerQuit,
    /// The session's bridge process died.
    BridgeFailure,
}

impl DeleteReason {
    /// Stable string form, used in logs and hook payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteReason::Logout => "logout",
            DeleteReason::GcIdle => "gc_idle",
            DeleteReason::GcAbsolute => "gc_absolute",
            DeleteReason::Manual => "manual",
            DeleteReason::ServerQuit => "server_quit",
            DeleteReason::BridgeFailure => "bridge_failure",
        }
    }
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session's connection to its bridge, owned by the session record
/// and closed when the session is deleted.
pub trait BridgeLink: Send + Sync {
    /// Close the connection. Must be idempotent.
    fn close(&self);
}

pub(crate) type Terminator = Arc<dyn Fn(DeleteReason) + Send + Sync>;

/// Decoded snapshot of one authenticated user's presence.
///
/// Snapshots are cheap to clone and safe to hold across awaits; the
/// authoritative record lives in the manager's store, and a deleted
/// session is unreachable there even while snapshots remain.
#[derive(Clone)]
pub struct Session {
    /// Opaque session id (the cookie value).
    pub id: String,
    /// Account the session belongs to.
    pub user: SessionUser,
    /// Whether privileged operations are allowed.
    pub privileged: bool,
    /// Creation time.
    pub created: Instant,
    /// Last request seen.
    pub last_access: Instant,
    /// Last time the idle deadline moved.
    pub last_refresh: Instant,
    /// Idle deadline; always at or before `absolute_until`.
    pub idle_until: Instant,
    /// Hard lifetime deadline.
    pub absolute_until: Instant,
    pub(crate) terminate: Option<Terminator>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.user == other.user
            && self.privileged == other.privileged
            && self.created == other.created
            && self.last_access == other.last_access
            && self.last_refresh == other.last_refresh
            && self.idle_until == other.idle_until
            && self.absolute_until == other.absolute_until
    }
}

impl Session {
    /// Request this session's own deletion, e.g. when its bridge channel
    /// reports failure. No-op on snapshots detached from a manager.
    pub fn terminate(&self, reason: DeleteReason) {
        if let Some(terminate) = &self.terminate {
            terminate(reason);
        }
    }

    /// Whether either deadline has passed at `now`.
    #[must_use]
    pub fn expired_at(&self, now: Instant) -> bool {
        now >= self.idle_until || now >= self.absolute_until
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.name)
            .field("privileged", &self.privileged)
            .field("idle_until", &self.idle_until)
            .field("absolute_until", &self.absolute_until)
            .finish()
    }
}
