//! Handler registry: `(namespace, command)` to handler, with capability
//! detection at registration so dispatch never reflects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::context::StreamContext;
use crate::emitter::Emitter;
use crate::error::HandlerError;

/// Inbound data chunks for a bidirectional handler. Ends when the
/// client half-closes the stream.
pub type InputQueue = mpsc::UnboundedReceiver<Vec<u8>>;

/// Terminal geometry events `(cols, rows)` for a bidirectional handler.
pub type ResizeEvents = mpsc::UnboundedReceiver<(u16, u16)>;

/// A unidirectional operation: arguments in, emitted frames out.
///
/// The handler must emit its own result before returning `Ok`; the
/// dispatcher sends the close frame. Returning an error produces the
/// stream's error frame instead.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute the operation.
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError>;
}

/// A bidirectional operation: additionally consumes inbound data and,
/// for terminals, resize events.
#[async_trait]
pub trait BidirectionalHandler: Send + Sync {
    /// Execute the operation.
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
        input: InputQueue,
        resize: ResizeEvents,
    ) -> Result<(), HandlerError>;
}

/// A registered handler with its capability recorded.
#[derive(Clone)]
pub enum HandlerKind {
    /// Arguments and emitter only.
    Unidirectional(Arc<dyn Handler>),
    /// Also receives the input queue and resize events.
    Bidirectional(Arc<dyn BidirectionalHandler>),
}

/// One registry entry.
#[derive(Clone)]
pub struct Registration {
    /// The handler and its capability.
    pub kind: HandlerKind,
    /// Reject unprivileged sessions with a 403.
    pub privileged_only: bool,
}

impl Registration {
    /// Whether the handler consumes inbound data.
    #[must_use]
    pub fn is_bidirectional(&self) -> bool {
        matches!(self.kind, HandlerKind::Bidirectional(_))
    }
}

/// Mutable registry, additive at startup. Duplicate registration is
/// idempotent with last-wins semantics.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<(String, String), Registration>,
}

impl RegistryBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unidirectional handler.
    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        command: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.insert(
            namespace.into(),
            command.into(),
            Registration {
                kind: HandlerKind::Unidirectional(handler),
                privileged_only: false,
            },
        )
    }

    /// Register a unidirectional handler restricted to privileged
    /// sessions.
    pub fn register_privileged(
        &mut self,
        namespace: impl Into<String>,
        command: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.insert(
            namespace.into(),
            command.into(),
            Registration {
                kind: HandlerKind::Unidirectional(handler),
                privileged_only: true,
            },
        )
    }

    /// Register a bidirectional handler.
    pub fn register_bidirectional(
        &mut self,
        namespace: impl Into<String>,
        command: impl Into<String>,
        handler: Arc<dyn BidirectionalHandler>,
    ) -> &mut Self {
        self.insert(
            namespace.into(),
            command.into(),
            Registration {
                kind: HandlerKind::Bidirectional(handler),
                privileged_only: false,
            },
        )
    }

    fn insert(&mut self, namespace: String, command: String, entry: Registration) -> &mut Self {
        if self
            .entries
            .insert((namespace.clone(), command.clone()), entry)
            .is_some()
        {
            tracing::debug!(%namespace, %command, "handler re-registered, last wins");
        }
        self
    }

    /// Freeze the registry. No registration happens after this; the
    /// frozen registry is lock-free on the dispatch path.
    #[must_use]
    pub fn freeze(self) -> HandlerRegistry {
        HandlerRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable handler registry, read-only after startup.
pub struct HandlerRegistry {
    entries: HashMap<(String, String), Registration>,
}

impl HandlerRegistry {
    /// Look up a handler.
    #[must_use]
    pub fn lookup(&self, namespace: &str, command: &str) -> Option<&Registration> {
        self.entries
            .get(&(namespace.to_string(), command.to_string()))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
