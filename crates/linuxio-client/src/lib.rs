//! # LinuxIO Web-Tier Client
//!
//! The web tier's side of the IPC substrate. One [`BridgeClient`] per
//! session: it performs the auth handshake on the broker socket, keeps
//! the same socket as the multiplexed bridge channel, opens a stream
//! per call, and demultiplexes progress and results.
//!
//! If the channel closes out from under a call (the race where the
//! bridge restarted), the client reconnects once through the session's
//! bridge socket, proving possession of the shared secret, and retries
//! the call once. Everything beyond that is the caller's problem, per
//! the retry policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod error;

pub use auth::{AuthOptions, authenticate};
pub use client::{BridgeClient, CallOutcome};
pub use error::ClientError;
