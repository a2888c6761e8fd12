//! # LinuxIO Stream Multiplexer
//!
//! Lets a single reliable byte channel carry many concurrent logical
//! streams. The web tier holds one [`Multiplexer`] per session as its
//! sole transport to that session's bridge; the bridge holds the server
//! end of the same protocol and receives [`IncomingStream`]s to dispatch.
//!
//! ## Guarantees
//!
//! - **Ordering**: events for one stream are delivered strictly in wire
//!   order; streams never block each other, since every stream has its
//!   own delivery queue and the read loop never holds a per-stream lock
//!   across a consumer callback.
//! - **Flow control**: outbound data on a client stream consumes credit
//!   from a per-stream send window (default 1 MiB). Credit returns via
//!   explicit `StreamAck` frames or via progress records carrying a
//!   cumulative `acked` byte count.
//! - **Terminal events**: a live stream sees exactly one terminal:
//!   either its result record, or a single [`StreamEvent::Closed`] when
//!   it ends without one (peer close, abort, channel loss).
//! - **Failure**: if the channel dies, every live stream is aborted,
//!   pending writes fail, and the multiplexer's status becomes
//!   observable as closed so the caller may reconnect.
//!
//! ## Stream lifecycle
//!
//! ```text
//!             open_stream        first-in / result
//!   [none] ─────────────▶ Opening ───────────────▶ Open
//!                            │                      │
//!                            │                      │ close() / peer close
//!                            ▼                      ▼
//!                         Aborted ◀── abort ── HalfClosed ──▶ Closed
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod mux;
pub mod stream;

pub use error::MuxError;
pub use mux::{FrameSink, IncomingStream, Multiplexer, MuxConfig, MuxStatus};
pub use stream::{CloseReason, StreamEvent, StreamHandle, StreamState};

/// Default per-stream send window in bytes.
pub const DEFAULT_SEND_WINDOW: usize = 1024 * 1024;

/// Default maximum data chunk carried by one frame when splitting writes.
pub const DEFAULT_WRITE_CHUNK: usize = 256 * 1024;
