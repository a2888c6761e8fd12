//! Logical stream state, events, and the opener-side handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use linuxio_proto::{StreamFrame, StreamResult};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::MuxError;
use crate::mux::MuxInner;

/// Lifecycle state of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open frame sent, nothing heard back yet.
    Opening,
    /// Both directions live.
    Open,
    /// Locally half-closed; inbound may still drain to a result.
    HalfClosed,
    /// Fully closed.
    Closed,
    /// Cancelled, locally or by the peer, or lost with the channel.
    Aborted,
}

impl StreamState {
    /// Whether the stream can still carry outbound data.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, StreamState::Opening | StreamState::Open)
    }

    /// Whether the stream has reached a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Aborted)
    }
}

/// Why a stream ended without a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer half-closed the stream.
    PeerClosed,
    /// The peer aborted the stream.
    Aborted,
    /// The underlying channel died.
    ChannelLost,
}

/// An event delivered to a stream's consumer, in wire order.
#[derive(Debug)]
pub enum StreamEvent {
    /// Opaque data chunk; may be empty.
    Data(Vec<u8>),
    /// Handler-defined progress record.
    Progress(Value),
    /// Terminal result record.
    Result(StreamResult),
    /// Terminal geometry change (bridge side of PTY streams).
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// The stream ended without a result.
    Closed(CloseReason),
}

/// Per-stream outgoing flow-control window.
///
/// Credit is byte-granular. The window fails closed: once the stream is
/// aborted or the channel is lost, blocked writers wake with an error.
pub(crate) struct SendWindow {
    permits: Semaphore,
}

impl SendWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            permits: Semaphore::new(capacity),
        }
    }

    /// Consume `n` bytes of credit, waiting for the peer if necessary.
    ///
    /// Fails when the window has been failed via [`SendWindow::fail`].
    pub(crate) async fn consume(&self, n: usize) -> Result<(), ()> {
        let n = u32::try_from(n).map_err(|_| ())?;
        match self.permits.acquire_many(n).await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(()),
        }
    }

    /// Return `n` bytes of credit to the writer.
    pub(crate) fn credit(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Wake every blocked writer with an error; the stream is done.
    pub(crate) fn fail(&self) {
        self.permits.close();
    }
}

/// Shared per-stream bookkeeping between the table and the handle.
pub(crate) struct StreamShared {
    pub(crate) state: Mutex<StreamState>,
    pub(crate) window: SendWindow,
    pub(crate) acked_total: AtomicU64,
}

impl StreamShared {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(StreamState::Opening),
            window: SendWindow::new(window),
            acked_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state.lock().expect("stream state lock")
    }

    pub(crate) fn set_state(&self, next: StreamState) {
        *self.state.lock().expect("stream state lock") = next;
    }

    /// Transition `Opening -> Open` on the first inbound frame.
    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock().expect("stream state lock");
        if *state == StreamState::Opening {
            *state = StreamState::Open;
        }
    }

    /// Record a cumulative acked byte count, crediting the delta.
    pub(crate) fn credit_cumulative(&self, acked: u64) {
        let prev = self.acked_total.swap(acked, Ordering::AcqRel);
        if acked > prev {
            let delta = usize::try_from(acked - prev).unwrap_or(usize::MAX);
            self.window.credit(delta);
        }
    }
}

/// Opener-side handle to a logical stream.
///
/// The handle owns the stream until [`close`](StreamHandle::close) or
/// [`abort`](StreamHandle::abort); events arrive through
/// [`next_event`](StreamHandle::next_event) in wire order. The handle
/// holds the multiplexer only weakly, through the id it was opened with.
pub struct StreamHandle {
    pub(crate) id: u32,
    pub(crate) mux: Weak<MuxInner>,
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) events: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
    pub(crate) write_chunk: usize,
}

impl StreamHandle {
    /// The stream id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Receive the next event, or `None` once the stream is finished and
    /// drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Send a data chunk, consuming send-window credit.
    ///
    /// Blocks (asynchronously) while the window is exhausted, until the
    /// peer acknowledges bytes. An empty chunk is sent as a zero-length
    /// frame without consuming credit.
    ///
    /// # Errors
    ///
    /// Returns `WriteAfterClose` past half-close, `Aborted` if the stream
    /// was cancelled while waiting, and `ChannelLost` if the channel died.
    pub async fn write(&self, chunk: &[u8]) -> Result<(), MuxError> {
        self.check_writable()?;
        let inner = self.mux.upgrade().ok_or(MuxError::ChannelLost)?;

        if chunk.is_empty() {
            return inner.send_frame(&StreamFrame::data(self.id, chunk)).await;
        }

        for piece in chunk.chunks(self.write_chunk.max(1)) {
            if self.shared.window.consume(piece.len()).await.is_err() {
                return Err(self.terminal_error());
            }
            inner.send_frame(&StreamFrame::data(self.id, piece)).await?;
        }
        Ok(())
    }

    /// Half-close the stream. Outbound writes fail afterwards; inbound
    /// frames still drain up to the result. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` if the stream was already cancelled, or a
    /// channel error from the close frame.
    pub async fn close(&self) -> Result<(), MuxError> {
        {
            let mut state = self.shared.state.lock().expect("stream state lock");
            match *state {
                StreamState::Opening | StreamState::Open => *state = StreamState::HalfClosed,
                StreamState::HalfClosed | StreamState::Closed => return Ok(()),
                StreamState::Aborted => return Err(MuxError::Aborted(self.id)),
            }
        }
        let inner = self.mux.upgrade().ok_or(MuxError::ChannelLost)?;
        inner.send_frame(&StreamFrame::close(self.id)).await
    }

    /// Abort the stream. The peer must cease work promptly; pending
    /// writes on this handle fail immediately.
    pub async fn abort(&self) {
        let already_terminal = {
            let mut state = self.shared.state.lock().expect("stream state lock");
            let terminal = state.is_terminal();
            *state = StreamState::Aborted;
            terminal
        };
        self.shared.window.fail();
        if already_terminal {
            return;
        }
        if let Some(inner) = self.mux.upgrade() {
            inner.remove_stream(self.id);
            if let Err(err) = inner.send_frame(&StreamFrame::abort(self.id)).await {
                tracing::debug!(stream = self.id, error = %err, "abort frame not sent");
            }
        }
    }

    /// Send a terminal resize for a PTY stream.
    ///
    /// # Errors
    ///
    /// Returns `WriteAfterClose` past half-close or a channel error.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), MuxError> {
        self.check_writable()?;
        let inner = self.mux.upgrade().ok_or(MuxError::ChannelLost)?;
        inner
            .send_frame(&StreamFrame::resize(self.id, cols, rows))
            .await
    }

    fn check_writable(&self) -> Result<(), MuxError> {
        match self.shared.state() {
            state if state.is_writable() => Ok(()),
            StreamState::Aborted => Err(MuxError::Aborted(self.id)),
            _ => Err(MuxError::WriteAfterClose(self.id)),
        }
    }

    fn terminal_error(&self) -> MuxError {
        match self.shared.state() {
            StreamState::Aborted => MuxError::Aborted(self.id),
            _ => MuxError::ChannelLost,
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("state", &self.shared.state())
            .finish()
    }
}
