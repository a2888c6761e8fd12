//! # LinuxIO Wire Protocol
//!
//! Wire-level types for the LinuxIO IPC core. Everything that crosses a
//! process boundary is defined here:
//!
//! - **Stream frames**: the length-prefixed unit carried between the web
//!   tier and a per-session bridge ([`frame`], [`codec`])
//! - **Open requests**: the null-delimited handler address inside a
//!   `StreamOpen` payload ([`open`])
//! - **Result and progress records**: the JSON terminal and interim
//!   payloads a handler emits ([`result`])
//! - **Auth records**: the fixed binary login round trip spoken on the
//!   broker socket ([`auth`])
//!
//! The crate is transport-agnostic: frames encode to and from byte
//! buffers, and the async codec works over any `AsyncRead`/`AsyncWrite`
//! pair. Callers serialize writes themselves; the codec is stateless.
//!
//! ## Frame layout
//!
//! ```text
//! ┌────────┬─────────────┬─────────────┬─────────────────┐
//! │ opcode │  stream id  │   length    │     payload     │
//! │ 1 byte │  4 bytes BE │  4 bytes BE │  `length` bytes │
//! └────────┴─────────────┴─────────────┴─────────────────┘
//! ```
//!
//! Every frame is fully framed before the next starts. A partial frame on
//! disconnect is discarded; there is no partial-frame recovery.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod codec;
pub mod error;
pub mod frame;
pub mod open;
pub mod result;

pub use auth::{AuthRequest, AuthResponse, AuthStatus, EnvMode};
pub use codec::{FrameReader, FrameWriter};
pub use error::{FrameError, WireError};
pub use frame::{Opcode, StreamFrame};
pub use open::OpenRequest;
pub use result::{ResultStatus, StreamResult};

/// Protocol version for the stream framing layer.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed frame header size in bytes: opcode, stream id, payload length.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default ceiling for a single frame payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Stream id reserved for session-level control traffic (keep-alives).
pub const CONTROL_STREAM_ID: u32 = 0;
