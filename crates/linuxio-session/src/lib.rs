//! # LinuxIO Session Manager
//!
//! Owns the full lifecycle of a user session, independent of the
//! transport: creation on login, refresh on activity, idle and absolute
//! expiry, explicit logout, and teardown when the session's bridge dies.
//!
//! Sessions are in-memory only. The store is a concurrent map keyed by
//! an opaque 128-bit hex id; absolute expiry acts as a TTL enforced on
//! every read, and a background sweep collects idle-expired entries.
//!
//! Delete hooks let other subsystems observe teardown. Hooks run
//! concurrently, one task per hook, and a panicking hook is contained so
//! it cannot break session teardown for anyone else.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cookie;
pub mod error;
pub mod manager;
pub mod session;

pub use cookie::{CookieConfig, parse_cookie_header};
pub use error::SessionError;
pub use manager::{SessionConfig, SessionManager};
pub use session::{BridgeLink, DeleteReason, Session, SessionUser, generate_session_id, generate_token};
