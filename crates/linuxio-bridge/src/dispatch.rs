//! Stream dispatch: route an accepted stream to its handler and adapt
//! the handler's lifecycle to the wire contract.

use std::sync::Arc;

use linuxio_mux::{CloseReason, FrameSink, IncomingStream, StreamEvent};
use linuxio_proto::result::code;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::{SessionInfo, StreamContext};
use crate::emitter::Emitter;
use crate::registry::{HandlerKind, HandlerRegistry};

/// Routes incoming streams to registered handlers.
///
/// Cheap to clone; one dispatcher serves every stream of a channel.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    session: Arc<SessionInfo>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Dispatcher over a frozen registry.
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        session: Arc<SessionInfo>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            session,
            shutdown,
        }
    }

    /// Serve one stream to completion: look up the handler, pump inbound
    /// frames, invoke, and emit the terminal frames.
    ///
    /// Exactly one terminal frame precedes the close frame on every
    /// path, including handler panics, which are contained here and
    /// surfaced as an internal error.
    pub async fn run(self, stream: IncomingStream, sink: FrameSink) {
        let id = stream.id;
        let open = stream.open;
        let mut events = stream.events;
        let stream_cancel = stream.cancel;

        let emitter = Arc::new(Emitter::new(sink.clone(), id));

        let Some(registration) = self.registry.lookup(&open.namespace, &open.command).cloned()
        else {
            let message = format!("unknown handler {}.{}", open.namespace, open.command);
            tracing::debug!(stream = id, %message);
            let _ = emitter.error(&message, code::NOT_FOUND).await;
            let _ = emitter.close().await;
            sink.release(id);
            return;
        };

        if registration.privileged_only && !self.session.privileged {
            tracing::warn!(
                stream = id,
                namespace = %open.namespace,
                command = %open.command,
                user = %self.session.user,
                "privileged handler refused"
            );
            let _ = emitter.error("privileged session required", code::FORBIDDEN).await;
            let _ = emitter.close().await;
            sink.release(id);
            return;
        }

        // The handler's token fires on client abort, channel loss, or
        // bridge shutdown, whichever comes first.
        let ctx_cancel = CancellationToken::new();
        let watcher = {
            let ctx_cancel = ctx_cancel.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown.cancelled() => ctx_cancel.cancel(),
                    () = stream_cancel.cancelled() => ctx_cancel.cancel(),
                    () = ctx_cancel.cancelled() => {}
                }
            })
        };

        // Pump inbound events into the handler-facing queues. A peer
        // half-close ends the input queue; an abort cancels the handler.
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let bidirectional = registration.is_bidirectional();
        let pump_cancel = ctx_cancel.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Data(chunk) => {
                        if bidirectional && input_tx.send(chunk).is_err() {
                            break;
                        }
                    }
                    StreamEvent::Resize { cols, rows } => {
                        let _ = resize_tx.send((cols, rows));
                    }
                    StreamEvent::Closed(CloseReason::PeerClosed) => break,
                    StreamEvent::Closed(_) => {
                        pump_cancel.cancel();
                        break;
                    }
                    StreamEvent::Progress(_) | StreamEvent::Result(_) => {}
                }
            }
        });

        let ctx = StreamContext {
            stream_id: id,
            session: Arc::clone(&self.session),
            cancel: ctx_cancel.clone(),
        };
        let args = open.args;
        let handler_emitter = Arc::clone(&emitter);
        // The handler runs in its own task so a panic is isolated from
        // the dispatch path.
        let invocation = tokio::spawn(async move {
            match registration.kind {
                HandlerKind::Unidirectional(handler) => {
                    handler.execute(&ctx, &args, &handler_emitter).await
                }
                HandlerKind::Bidirectional(handler) => {
                    handler
                        .execute(&ctx, &args, &handler_emitter, input_rx, resize_rx)
                        .await
                }
            }
        });

        match invocation.await {
            Ok(Ok(())) => {
                if !emitter.terminal_sent() {
                    let _ = emitter.result_empty().await;
                }
                let _ = emitter.close().await;
            }
            Ok(Err(err)) => {
                tracing::debug!(stream = id, code = err.code, message = %err.message, "handler failed");
                let _ = emitter.error(&err.message, err.code).await;
                let _ = emitter.close().await;
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    tracing::error!(stream = id, "handler panicked");
                }
                let _ = emitter.error("internal error", code::INTERNAL).await;
                let _ = emitter.close().await;
            }
        }

        ctx_cancel.cancel();
        pump.abort();
        watcher.abort();
        sink.release(id);
    }
}
