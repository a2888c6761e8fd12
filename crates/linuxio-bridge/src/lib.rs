//! # LinuxIO Per-Session Bridge
//!
//! The privileged child process that serves exactly one authenticated
//! user. It adopts the client socket inherited from the auth broker,
//! runs the multiplexer's read loop over it, and dispatches every
//! incoming stream open to a handler registered under a
//! `(namespace, command)` address.
//!
//! ```text
//!   inherited fd ──▶ Multiplexer (server) ──▶ Dispatcher ──▶ Handler
//!                                                │              │
//!                                                │   Emitter ◀──┘
//!                                                ▼
//!                                    data / progress / result / close
//! ```
//!
//! Handlers are unidirectional (arguments and an emitter) or
//! bidirectional (additionally an input queue and resize events, for
//! uploads and PTY terminals). The dispatcher guarantees exactly one
//! terminal frame per stream (a result or an error) followed by a
//! close, and contains handler panics so they surface as an internal
//! error instead of crossing the frame boundary.
//!
//! System-bus work goes through [`bus::BusManager`], which serializes
//! calls behind a process-wide mutex, applies per-class deadlines, and
//! retries exactly once when the connection reports closed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod context;
pub mod dispatch;
pub mod emitter;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod runtime;

pub use bus::{BusCall, BusError, BusManager, BusTransport, CallClass};
pub use context::{SessionInfo, StreamContext};
pub use dispatch::Dispatcher;
pub use emitter::Emitter;
pub use error::{BridgeError, HandlerError};
pub use registry::{
    BidirectionalHandler, Handler, HandlerRegistry, InputQueue, RegistryBuilder, ResizeEvents,
};
pub use runtime::{BridgeConfig, BridgeRuntime, INHERITED_CLIENT_FD};
