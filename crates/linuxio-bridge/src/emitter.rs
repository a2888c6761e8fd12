//! The façade through which a handler talks back onto its stream.

use std::sync::atomic::{AtomicBool, Ordering};

use linuxio_mux::{FrameSink, MuxError};
use linuxio_proto::{Opcode, StreamFrame, StreamResult};
use serde_json::Value;

/// Emits data, progress, and the single terminal frame for one stream.
///
/// The write-once discipline lives here: the first `result` or `error`
/// wins, later terminal emissions are logged and dropped, so exactly
/// one terminal frame reaches the peer before the close frame.
pub struct Emitter {
    sink: FrameSink,
    stream_id: u32,
    terminal_sent: AtomicBool,
}

impl Emitter {
    /// Emitter for one stream.
    #[must_use]
    pub fn new(sink: FrameSink, stream_id: u32) -> Self {
        Self {
            sink,
            stream_id,
            terminal_sent: AtomicBool::new(false),
        }
    }

    /// The stream this emitter serves.
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Whether a terminal frame has been emitted.
    #[must_use]
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }

    /// Send an opaque data chunk.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn data(&self, chunk: &[u8]) -> Result<(), MuxError> {
        self.sink.send(&StreamFrame::data(self.stream_id, chunk)).await
    }

    /// Send a progress record.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn progress(&self, value: &Value) -> Result<(), MuxError> {
        let payload = serde_json::to_vec(value).unwrap_or_default();
        self.sink
            .send(&StreamFrame::new(
                Opcode::StreamProgress,
                self.stream_id,
                payload,
            ))
            .await
    }

    /// Send an explicit flow-control credit.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn ack(&self, bytes: u32) -> Result<(), MuxError> {
        self.sink.send(&StreamFrame::ack(self.stream_id, bytes)).await
    }

    /// Send the successful terminal result.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn result(&self, data: Value) -> Result<(), MuxError> {
        self.terminal(StreamResult::ok(data)).await
    }

    /// Send a successful terminal result with no payload.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn result_empty(&self) -> Result<(), MuxError> {
        self.terminal(StreamResult::ok_empty()).await
    }

    /// Send the failing terminal result.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn error(&self, message: &str, code: u16) -> Result<(), MuxError> {
        self.terminal(StreamResult::error(message, code)).await
    }

    /// Send the close frame. The dispatcher calls this once the handler
    /// has returned; handlers do not close their own stream.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` when the channel is gone.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.sink.send(&StreamFrame::close(self.stream_id)).await
    }

    async fn terminal(&self, result: StreamResult) -> Result<(), MuxError> {
        if self.terminal_sent.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                stream = self.stream_id,
                "second terminal frame suppressed"
            );
            return Ok(());
        }
        self.sink
            .send(&StreamFrame::new(
                Opcode::StreamResult,
                self.stream_id,
                result.encode(),
            ))
            .await
    }
}
