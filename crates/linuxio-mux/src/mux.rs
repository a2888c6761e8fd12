//! The multiplexer proper: stream table, write serialization, read loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dashmap::DashMap;
use linuxio_proto::{
    CONTROL_STREAM_ID, DEFAULT_MAX_PAYLOAD, FrameReader, FrameWriter, Opcode, OpenRequest,
    StreamFrame, StreamResult, result::code,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;
use crate::stream::{CloseReason, StreamEvent, StreamHandle, StreamShared, StreamState};
use crate::{DEFAULT_SEND_WINDOW, DEFAULT_WRITE_CHUNK};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Multiplexer tuning knobs.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Ceiling for a single frame payload.
    pub max_frame_payload: usize,
    /// Per-stream outgoing window in bytes.
    pub send_window: usize,
    /// Maximum data chunk per frame when splitting large writes.
    pub write_chunk: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            send_window: DEFAULT_SEND_WINDOW,
            write_chunk: DEFAULT_WRITE_CHUNK,
        }
    }
}

/// Observable channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxStatus {
    /// The channel is carrying frames.
    Open,
    /// The channel is gone; the owner may attempt reconnection.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxRole {
    Client,
    Server,
}

/// A stream opened by the peer, handed to the dispatcher.
#[derive(Debug)]
pub struct IncomingStream {
    /// Stream id assigned by the opener.
    pub id: u32,
    /// Parsed open request: type, handler address, arguments.
    pub open: OpenRequest,
    /// Inbound events for this stream, in wire order.
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    /// Cancelled when the opener aborts or the channel dies.
    pub cancel: CancellationToken,
}

struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
    shared: Arc<StreamShared>,
    cancel: CancellationToken,
    result_seen: AtomicBool,
}

pub(crate) struct MuxInner {
    writer: tokio::sync::Mutex<FrameWriter<BoxedWrite>>,
    streams: DashMap<u32, StreamSlot>,
    next_id: AtomicU32,
    status_tx: watch::Sender<MuxStatus>,
    incoming: std::sync::Mutex<Option<mpsc::UnboundedSender<IncomingStream>>>,
    role: MuxRole,
    config: MuxConfig,
}

impl MuxInner {
    /// Serialize one frame onto the channel. A write failure poisons the
    /// channel and aborts every live stream.
    pub(crate) async fn send_frame(&self, frame: &StreamFrame) -> Result<(), MuxError> {
        if *self.status_tx.borrow() == MuxStatus::Closed {
            return Err(MuxError::ChannelLost);
        }
        let mut writer = self.writer.lock().await;
        match writer.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                drop(writer);
                self.fail("write failure");
                Err(MuxError::Frame(err))
            }
        }
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        self.streams.remove(&id);
    }

    fn allocate_id(&self) -> Result<u32, MuxError> {
        // Wrap-around is permitted; skip 0 and any id still live.
        for _ in 0..(1u64 << 20) {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == CONTROL_STREAM_ID {
                continue;
            }
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(MuxError::StreamsExhausted)
    }

    /// Tear the channel down once: abort every live stream, fire each
    /// stream's single terminal close, and flip the status to closed.
    fn fail(&self, reason: &str) {
        let flipped = self.status_tx.send_if_modified(|status| {
            if *status == MuxStatus::Open {
                *status = MuxStatus::Closed;
                true
            } else {
                false
            }
        });
        if !flipped {
            return;
        }
        tracing::warn!(reason, "channel lost, aborting live streams");

        if let Ok(mut incoming) = self.incoming.lock() {
            incoming.take();
        }

        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.streams.remove(&id) {
                slot.shared.set_state(StreamState::Aborted);
                slot.shared.window.fail();
                slot.cancel.cancel();
                if !slot.result_seen.load(Ordering::Acquire) {
                    let _ = slot.events.send(StreamEvent::Closed(CloseReason::ChannelLost));
                }
            }
        }
    }
}

/// Write access to the channel for the bridge's emitters, plus slot
/// release once a stream reaches its terminal close.
#[derive(Clone)]
pub struct FrameSink {
    inner: std::sync::Weak<MuxInner>,
}

impl FrameSink {
    /// Send a frame, serialized with all other writers on the channel.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` if the channel is gone.
    pub async fn send(&self, frame: &StreamFrame) -> Result<(), MuxError> {
        let inner = self.inner.upgrade().ok_or(MuxError::ChannelLost)?;
        inner.send_frame(frame).await
    }

    /// Drop the table entry for a finished stream so its id can be
    /// reused after a full round trip.
    pub fn release(&self, stream_id: u32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_stream(stream_id);
        }
    }

    /// Whether the channel is already gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => *inner.status_tx.borrow() == MuxStatus::Closed,
            None => true,
        }
    }
}

/// Logical streams over one reliable byte channel.
///
/// Construct with [`Multiplexer::client`] on the web tier or
/// [`Multiplexer::server`] in the bridge. Dropping the multiplexer tears
/// the channel down.
pub struct Multiplexer {
    inner: Arc<MuxInner>,
    read_task: tokio::task::JoinHandle<()>,
}

impl Multiplexer {
    /// Client role: opens streams, never accepts them.
    pub fn client<S>(io: S, config: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, _incoming) = Self::start(io, config, MuxRole::Client);
        mux
    }

    /// Server role: additionally yields peer-opened streams for dispatch.
    pub fn server<S>(io: S, config: MuxConfig) -> (Self, mpsc::UnboundedReceiver<IncomingStream>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, incoming) = Self::start(io, config, MuxRole::Server);
        (mux, incoming.expect("server role has incoming channel"))
    }

    fn start<S>(
        io: S,
        config: MuxConfig,
        role: MuxRole,
    ) -> (Self, Option<mpsc::UnboundedReceiver<IncomingStream>>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FrameReader::with_max_payload(
            Box::new(read_half) as BoxedRead,
            config.max_frame_payload,
        );
        let writer = FrameWriter::new(Box::new(write_half) as BoxedWrite);

        let (incoming_tx, incoming_rx) = match role {
            MuxRole::Server => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            MuxRole::Client => (None, None),
        };
        let (status_tx, _) = watch::channel(MuxStatus::Open);

        let inner = Arc::new(MuxInner {
            writer: tokio::sync::Mutex::new(writer),
            streams: DashMap::new(),
            next_id: AtomicU32::new(1),
            status_tx,
            incoming: std::sync::Mutex::new(incoming_tx),
            role,
            config,
        });

        let read_task = tokio::spawn(read_loop(Arc::clone(&inner), reader));

        (Self { inner, read_task }, incoming_rx)
    }

    /// Open a fresh logical stream.
    ///
    /// The returned handle starts in [`StreamState::Opening`]; the first
    /// inbound frame moves it to `Open`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` if the channel is gone and
    /// `StreamsExhausted` when every id is live.
    pub async fn open_stream(&self, open: &OpenRequest) -> Result<StreamHandle, MuxError> {
        let id = self.inner.allocate_id()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(self.inner.config.send_window));

        self.inner.streams.insert(
            id,
            StreamSlot {
                events: events_tx,
                shared: Arc::clone(&shared),
                cancel: CancellationToken::new(),
                result_seen: AtomicBool::new(false),
            },
        );

        let frame = StreamFrame::new(Opcode::StreamOpen, id, open.encode());
        if let Err(err) = self.inner.send_frame(&frame).await {
            self.inner.remove_stream(id);
            return Err(err);
        }

        Ok(StreamHandle {
            id,
            mux: Arc::downgrade(&self.inner),
            shared,
            events: events_rx,
            write_chunk: self.inner.config.write_chunk,
        })
    }

    /// Write access for emitters on this channel.
    #[must_use]
    pub fn sink(&self) -> FrameSink {
        FrameSink {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current channel status.
    #[must_use]
    pub fn status(&self) -> MuxStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch the channel status for loss.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<MuxStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Whether the channel is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == MuxStatus::Closed
    }

    /// Number of live streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    /// Send a keep-alive on the control stream.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLost` if the channel is gone.
    pub async fn send_keepalive(&self) -> Result<(), MuxError> {
        self.inner.send_frame(&StreamFrame::keepalive()).await
    }

    /// Tear the channel down locally, aborting every live stream.
    pub fn shutdown(&self) {
        self.inner.fail("local shutdown");
        self.read_task.abort();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.inner.fail("multiplexer dropped");
        self.read_task.abort();
    }
}

async fn read_loop(inner: Arc<MuxInner>, mut reader: FrameReader<BoxedRead>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => handle_frame(&inner, frame),
            Ok(None) => {
                inner.fail("peer closed channel");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "frame read failed");
                inner.fail("read failure");
                return;
            }
        }
    }
}

fn handle_frame(inner: &Arc<MuxInner>, frame: StreamFrame) {
    if frame.stream_id == CONTROL_STREAM_ID {
        handle_control(inner, &frame);
        return;
    }

    match frame.opcode {
        Opcode::StreamOpen => handle_open(inner, frame),
        Opcode::StreamData => {
            if let Some(slot) = inner.streams.get(&frame.stream_id) {
                slot.shared.mark_open();
                let _ = slot.events.send(StreamEvent::Data(frame.payload));
            }
        }
        Opcode::StreamProgress => {
            let Some(slot) = inner.streams.get(&frame.stream_id) else {
                return;
            };
            match serde_json::from_slice::<serde_json::Value>(&frame.payload) {
                Ok(progress) => {
                    slot.shared.mark_open();
                    if let Some(acked) = linuxio_proto::result::progress_acked(&progress) {
                        slot.shared.credit_cumulative(acked);
                    }
                    let _ = slot.events.send(StreamEvent::Progress(progress));
                }
                Err(err) => {
                    tracing::debug!(stream = frame.stream_id, error = %err, "dropping malformed progress");
                }
            }
        }
        Opcode::StreamResult => {
            let Some(slot) = inner.streams.get(&frame.stream_id) else {
                return;
            };
            match StreamResult::decode(&frame.payload) {
                Ok(result) => {
                    slot.shared.mark_open();
                    slot.result_seen.store(true, Ordering::Release);
                    let _ = slot.events.send(StreamEvent::Result(result));
                }
                Err(err) => {
                    tracing::debug!(stream = frame.stream_id, error = %err, "dropping malformed result");
                }
            }
        }
        Opcode::StreamClose => {
            if let Some((_, slot)) = inner.streams.remove(&frame.stream_id) {
                if slot.shared.state() != StreamState::Aborted {
                    slot.shared.set_state(StreamState::Closed);
                }
                slot.shared.window.fail();
                if !slot.result_seen.load(Ordering::Acquire) {
                    let _ = slot.events.send(StreamEvent::Closed(CloseReason::PeerClosed));
                }
            }
        }
        Opcode::StreamAbort => {
            if let Some((_, slot)) = inner.streams.remove(&frame.stream_id) {
                slot.shared.set_state(StreamState::Aborted);
                slot.shared.window.fail();
                slot.cancel.cancel();
                if !slot.result_seen.load(Ordering::Acquire) {
                    let _ = slot.events.send(StreamEvent::Closed(CloseReason::Aborted));
                }
            }
        }
        Opcode::StreamResize => {
            let Some(slot) = inner.streams.get(&frame.stream_id) else {
                return;
            };
            match frame.decode_resize() {
                Ok((cols, rows)) => {
                    let _ = slot.events.send(StreamEvent::Resize { cols, rows });
                }
                Err(err) => {
                    tracing::debug!(stream = frame.stream_id, error = %err, "dropping malformed resize");
                }
            }
        }
        Opcode::StreamAck => match frame.decode_ack() {
            Ok(bytes) => {
                if let Some(slot) = inner.streams.get(&frame.stream_id) {
                    slot.shared.window.credit(bytes as usize);
                }
            }
            Err(err) => {
                tracing::debug!(stream = frame.stream_id, error = %err, "dropping malformed ack");
            }
        },
    }
}

fn handle_control(inner: &Arc<MuxInner>, frame: &StreamFrame) {
    // Only keep-alives ride the control stream today.
    if frame.opcode == Opcode::StreamData && inner.role == MuxRole::Server {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let _ = inner.send_frame(&StreamFrame::keepalive()).await;
        });
    }
}

fn handle_open(inner: &Arc<MuxInner>, frame: StreamFrame) {
    let id = frame.stream_id;

    let incoming_tx = match inner.incoming.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    let Some(incoming_tx) = incoming_tx else {
        // Client role never accepts streams.
        reply_detached(inner, StreamFrame::abort(id));
        return;
    };

    if inner.streams.contains_key(&id) {
        tracing::warn!(stream = id, "duplicate stream open, aborting");
        reply_detached(inner, StreamFrame::abort(id));
        return;
    }

    let open = match OpenRequest::parse(&frame.payload) {
        Ok(open) => open,
        Err(err) => {
            tracing::debug!(stream = id, error = %err, "malformed stream open");
            let result = StreamResult::error("malformed stream open", code::BAD_REQUEST);
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let frame = StreamFrame::new(Opcode::StreamResult, id, result.encode());
                if inner.send_frame(&frame).await.is_ok() {
                    let _ = inner.send_frame(&StreamFrame::close(id)).await;
                }
            });
            return;
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(StreamShared::new(inner.config.send_window));
    shared.set_state(StreamState::Open);
    let cancel = CancellationToken::new();

    inner.streams.insert(
        id,
        StreamSlot {
            events: events_tx,
            shared,
            cancel: cancel.clone(),
            result_seen: AtomicBool::new(false),
        },
    );

    if incoming_tx
        .send(IncomingStream {
            id,
            open,
            events: events_rx,
            cancel,
        })
        .is_err()
    {
        inner.remove_stream(id);
        reply_detached(inner, StreamFrame::abort(id));
    }
}

/// Send a frame from the read loop without blocking it on the writer.
fn reply_detached(inner: &Arc<MuxInner>, frame: StreamFrame) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let _ = inner.send_frame(&frame).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn pair() -> (Multiplexer, Multiplexer, mpsc::UnboundedReceiver<IncomingStream>) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let client = Multiplexer::client(client_io, MuxConfig::default());
        let (server, incoming) = Multiplexer::server(server_io, MuxConfig::default());
        (client, server, incoming)
    }

    fn open_request() -> OpenRequest {
        OpenRequest::new("call", "control", "ping", vec![])
    }

    #[tokio::test]
    async fn test_open_reaches_server_with_address() {
        let (client, _server, mut incoming) = pair();

        let handle = client
            .open_stream(&OpenRequest::new(
                "call",
                "fb",
                "upload",
                vec!["/tmp/x".into(), "10".into()],
            ))
            .await
            .unwrap();
        assert_eq!(handle.state(), StreamState::Opening);

        let stream = incoming.recv().await.unwrap();
        assert_eq!(stream.id, handle.id());
        assert_eq!(stream.open.namespace, "fb");
        assert_eq!(stream.open.command, "upload");
        assert_eq!(stream.open.args, vec!["/tmp/x", "10"]);
    }

    #[tokio::test]
    async fn test_data_result_close_in_order() {
        let (client, server, mut incoming) = pair();

        let mut handle = client.open_stream(&open_request()).await.unwrap();
        let stream = incoming.recv().await.unwrap();

        let sink = server.sink();
        sink.send(&StreamFrame::data(stream.id, b"chunk-1")).await.unwrap();
        sink.send(&StreamFrame::data(stream.id, b"")).await.unwrap();
        let result = StreamResult::ok(json!({"done": true}));
        sink.send(&StreamFrame::new(
            Opcode::StreamResult,
            stream.id,
            result.encode(),
        ))
        .await
        .unwrap();
        sink.send(&StreamFrame::close(stream.id)).await.unwrap();

        match handle.next_event().await.unwrap() {
            StreamEvent::Data(chunk) => assert_eq!(chunk, b"chunk-1"),
            other => panic!("expected data, got {other:?}"),
        }
        // Zero-length chunk is delivered, not dropped.
        match handle.next_event().await.unwrap() {
            StreamEvent::Data(chunk) => assert!(chunk.is_empty()),
            other => panic!("expected empty data, got {other:?}"),
        }
        match handle.next_event().await.unwrap() {
            StreamEvent::Result(got) => assert_eq!(got, result),
            other => panic!("expected result, got {other:?}"),
        }
        // Result already terminated the stream; close only ends the queue.
        assert!(handle.next_event().await.is_none());
        assert_eq!(handle.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_close_without_result_delivers_peer_closed() {
        let (client, server, mut incoming) = pair();

        let mut handle = client.open_stream(&open_request()).await.unwrap();
        let stream = incoming.recv().await.unwrap();
        server.sink().send(&StreamFrame::close(stream.id)).await.unwrap();

        match handle.next_event().await.unwrap() {
            StreamEvent::Closed(CloseReason::PeerClosed) => {}
            other => panic!("expected peer close, got {other:?}"),
        }
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_client_abort_cancels_server_stream() {
        let (client, _server, mut incoming) = pair();

        let handle = client.open_stream(&open_request()).await.unwrap();
        let mut stream = incoming.recv().await.unwrap();

        handle.abort().await;
        assert_eq!(handle.state(), StreamState::Aborted);

        stream.cancel.cancelled().await;
        match stream.events.recv().await.unwrap() {
            StreamEvent::Closed(CloseReason::Aborted) => {}
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_blocks_until_ack_credit() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let config = MuxConfig {
            send_window: 8,
            write_chunk: 4,
            ..MuxConfig::default()
        };
        let client = Multiplexer::client(client_io, config.clone());
        let (server, mut incoming) = Multiplexer::server(server_io, config);

        let handle = client.open_stream(&open_request()).await.unwrap();
        let stream = incoming.recv().await.unwrap();

        handle.write(&[0xAA; 8]).await.unwrap();

        // Window exhausted: the next write must block.
        let blocked =
            tokio::time::timeout(Duration::from_millis(30), handle.write(&[0xBB; 4])).await;
        assert!(blocked.is_err());

        server.sink().send(&StreamFrame::ack(stream.id, 8)).await.unwrap();
        tokio::time::timeout(Duration::from_millis(500), handle.write(&[0xCC; 4]))
            .await
            .expect("write unblocks after credit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_progress_acked_extends_window() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let config = MuxConfig {
            send_window: 8,
            write_chunk: 8,
            ..MuxConfig::default()
        };
        let client = Multiplexer::client(client_io, config.clone());
        let (server, mut incoming) = Multiplexer::server(server_io, config);

        let mut handle = client.open_stream(&open_request()).await.unwrap();
        let stream = incoming.recv().await.unwrap();
        handle.write(&[0x11; 8]).await.unwrap();

        let progress = json!({"acked": 8, "written": 8});
        server
            .sink()
            .send(&StreamFrame::new(
                Opcode::StreamProgress,
                stream.id,
                serde_json::to_vec(&progress).unwrap(),
            ))
            .await
            .unwrap();

        // Progress is delivered and its ack releases the writer.
        match handle.next_event().await.unwrap() {
            StreamEvent::Progress(value) => assert_eq!(value["acked"], 8),
            other => panic!("expected progress, got {other:?}"),
        }
        tokio::time::timeout(Duration::from_millis(500), handle.write(&[0x22; 8]))
            .await
            .expect("write unblocks after progress ack")
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (client, _server, mut incoming) = pair();
        let handle = client.open_stream(&open_request()).await.unwrap();
        let _stream = incoming.recv().await.unwrap();

        handle.close().await.unwrap();
        assert_eq!(handle.state(), StreamState::HalfClosed);
        assert!(matches!(
            handle.write(b"late").await,
            Err(MuxError::WriteAfterClose(_))
        ));

        // close is idempotent.
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_loss_aborts_all_streams() {
        let (client, server, mut incoming) = pair();

        let mut first = client.open_stream(&open_request()).await.unwrap();
        let mut second = client.open_stream(&open_request()).await.unwrap();
        let _s1 = incoming.recv().await.unwrap();
        let _s2 = incoming.recv().await.unwrap();

        let mut status = client.subscribe_status();
        drop(server);

        for handle in [&mut first, &mut second] {
            match handle.next_event().await.unwrap() {
                StreamEvent::Closed(CloseReason::ChannelLost) => {}
                other => panic!("expected channel lost, got {other:?}"),
            }
            assert_eq!(handle.state(), StreamState::Aborted);
        }

        status.wait_for(|s| *s == MuxStatus::Closed).await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream(&open_request()).await,
            Err(MuxError::ChannelLost)
        ));
    }

    #[tokio::test]
    async fn test_stream_ids_unique_and_nonzero() {
        let (client, _server, mut incoming) = pair();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let handle = client.open_stream(&open_request()).await.unwrap();
            assert_ne!(handle.id(), CONTROL_STREAM_ID);
            assert!(seen.insert(handle.id()));
            let _ = incoming.recv().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_released_slot_drops_late_frames() {
        let (client, server, mut incoming) = pair();

        let mut handle = client.open_stream(&open_request()).await.unwrap();
        let stream = incoming.recv().await.unwrap();
        let sink = server.sink();

        sink.send(&StreamFrame::close(stream.id)).await.unwrap();
        assert!(matches!(
            handle.next_event().await.unwrap(),
            StreamEvent::Closed(CloseReason::PeerClosed)
        ));

        // Frames for the retired id are dropped without effect.
        sink.send(&StreamFrame::data(stream.id, b"late")).await.unwrap();
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_keepalive_echoed_by_server() {
        let (client, _server, _incoming) = pair();
        client.send_keepalive().await.unwrap();
        // The echo lands on the client's control stream and is absorbed.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_slow_stream_does_not_stall_others() {
        let (client, server, mut incoming) = pair();

        let mut slow = client.open_stream(&open_request()).await.unwrap();
        let mut fast_handles = Vec::new();
        for _ in 0..9 {
            fast_handles.push(client.open_stream(&open_request()).await.unwrap());
        }

        let slow_stream = incoming.recv().await.unwrap();
        let mut fast_streams = Vec::new();
        for _ in 0..9 {
            fast_streams.push(incoming.recv().await.unwrap());
        }

        let sink = server.sink();
        // The slow stream gets a pile of data nobody consumes yet.
        for _ in 0..64 {
            sink.send(&StreamFrame::data(slow_stream.id, &[0u8; 4096]))
                .await
                .unwrap();
        }
        // Every other stream completes promptly regardless.
        for stream in &fast_streams {
            let result = StreamResult::ok(json!({"n": stream.id}));
            sink.send(&StreamFrame::new(
                Opcode::StreamResult,
                stream.id,
                result.encode(),
            ))
            .await
            .unwrap();
            sink.send(&StreamFrame::close(stream.id)).await.unwrap();
        }

        for handle in &mut fast_handles {
            let event = tokio::time::timeout(Duration::from_secs(1), handle.next_event())
                .await
                .expect("fast stream not stalled")
                .unwrap();
            assert!(matches!(event, StreamEvent::Result(_)));
        }

        // The slow stream's data is still there, in order.
        match slow.next_event().await.unwrap() {
            StreamEvent::Data(chunk) => assert_eq!(chunk.len(), 4096),
            other => panic!("expected data, got {other:?}"),
        }
    }
}
