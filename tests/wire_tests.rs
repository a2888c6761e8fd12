// Wire-level tests: drive a bridge runtime with raw frames and assert
// the exact terminal frames the protocol promises.

use std::time::Duration;

use linuxio_integration_tests::{fill_random_dir, full_runtime, runtime_with_mux, spawn_runtime};
use linuxio_mux::MuxConfig;
use linuxio_proto::{
    CONTROL_STREAM_ID, FrameReader, FrameWriter, Opcode, OpenRequest, StreamFrame, StreamResult,
};
use tokio::io::ReadHalf;

type Reader = FrameReader<ReadHalf<tokio::io::DuplexStream>>;

fn raw_channel(
    io: tokio::io::DuplexStream,
) -> (Reader, FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>) {
    let (read_half, write_half) = tokio::io::split(io);
    (FrameReader::new(read_half), FrameWriter::new(write_half))
}

fn open_frame(stream_id: u32, stream_type: &str, ns: &str, cmd: &str, args: &[&str]) -> StreamFrame {
    let open = OpenRequest::new(
        stream_type,
        ns,
        cmd,
        args.iter().map(|s| (*s).to_string()).collect(),
    );
    StreamFrame::new(Opcode::StreamOpen, stream_id, open.encode())
}

/// Read frames for `stream_id` until its result record, skipping
/// progress and data.
async fn read_result(reader: &mut Reader, stream_id: u32) -> StreamResult {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), reader.read_frame())
            .await
            .expect("bridge made no progress")
            .expect("channel failed")
            .expect("channel closed before result");
        if frame.stream_id != stream_id {
            continue;
        }
        match frame.opcode {
            Opcode::StreamResult => return StreamResult::decode(&frame.payload).unwrap(),
            Opcode::StreamClose => panic!("close before result"),
            _ => {}
        }
    }
}

// ============================================================================
// Scenario: upload size enforcement
// ============================================================================

#[tokio::test]
async fn test_upload_size_enforcement_on_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("x");

    let runtime = full_runtime(false);
    let (mut reader, mut writer) = raw_channel(spawn_runtime(&runtime));

    writer
        .write_frame(&open_frame(
            7,
            "fb-upload",
            "fb",
            "upload",
            &[&target.to_string_lossy(), "10"],
        ))
        .await
        .unwrap();
    writer
        .write_frame(&StreamFrame::data(7, b"012345678")) // 9 of 10 bytes
        .await
        .unwrap();
    writer.write_frame(&StreamFrame::close(7)).await.unwrap();

    let result = read_result(&mut reader, 7).await;
    assert_eq!(result.code, Some(400));
    assert_eq!(result.error.unwrap(), "size mismatch: expected 10, got 9");

    // The close frame follows the terminal frame.
    let frame = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(frame.opcode, Opcode::StreamClose);
    assert_eq!(frame.stream_id, 7);

    assert!(!target.exists());
}

// ============================================================================
// Scenario: archive abort
// ============================================================================

#[tokio::test]
async fn test_archive_abort_on_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir(&src).unwrap();
    // Enough incompressible data that gzip is still running when the
    // abort lands.
    fill_random_dir(&src, 6, 8 * 1024 * 1024);
    let dest = dir.path().join("out.tar.gz");

    let runtime = full_runtime(false);
    let (mut reader, mut writer) = raw_channel(spawn_runtime(&runtime));

    writer
        .write_frame(&open_frame(
            9,
            "fb-compress",
            "fb",
            "compress",
            &["targz", &dest.to_string_lossy(), &src.to_string_lossy()],
        ))
        .await
        .unwrap();

    // Wait for the first progress record showing actual output, then
    // abort mid-archive.
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), reader.read_frame())
            .await
            .expect("no progress from compress")
            .unwrap()
            .expect("channel closed early");
        if frame.stream_id != 9 {
            continue;
        }
        match frame.opcode {
            Opcode::StreamProgress => {
                let progress: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
                if progress["bytes"].as_u64().unwrap_or(0) > 0 {
                    break;
                }
            }
            Opcode::StreamResult => {
                panic!("archive finished before the abort could land");
            }
            _ => {}
        }
    }
    writer.write_frame(&StreamFrame::abort(9)).await.unwrap();

    let result = read_result(&mut reader, 9).await;
    assert_eq!(result.code, Some(499));
    assert!(!dest.exists(), "partial archive must be removed");
}

// ============================================================================
// Control stream and framing edges
// ============================================================================

#[tokio::test]
async fn test_keepalive_echo_on_control_stream() {
    let runtime = full_runtime(false);
    let (mut reader, mut writer) = raw_channel(spawn_runtime(&runtime));

    writer.write_frame(&StreamFrame::keepalive()).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), reader.read_frame())
        .await
        .expect("no keepalive echo")
        .unwrap()
        .unwrap();
    assert_eq!(frame.stream_id, CONTROL_STREAM_ID);
    assert_eq!(frame.opcode, Opcode::StreamData);
    assert!(frame.payload.is_empty());
}

#[tokio::test]
async fn test_oversize_frame_kills_channel() {
    let runtime = runtime_with_mux(
        false,
        MuxConfig {
            max_frame_payload: 1024,
            ..MuxConfig::default()
        },
    );
    let (mut reader, mut writer) = raw_channel(spawn_runtime(&runtime));

    writer
        .write_frame(&StreamFrame::data(3, &vec![0u8; 4096]))
        .await
        .unwrap();

    // The bridge treats the oversize frame as fatal to the channel.
    let end = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match reader.read_frame().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "channel stayed open after oversize frame");
}

#[tokio::test]
async fn test_malformed_open_answered_with_400() {
    let runtime = full_runtime(false);
    let (mut reader, mut writer) = raw_channel(spawn_runtime(&runtime));

    // Not a null-delimited open payload.
    writer
        .write_frame(&StreamFrame::new(Opcode::StreamOpen, 5, vec![0xFF, 0xFE]))
        .await
        .unwrap();

    let result = read_result(&mut reader, 5).await;
    assert_eq!(result.code, Some(400));

    let frame = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(frame.opcode, Opcode::StreamClose);
}

#[tokio::test]
async fn test_zero_length_data_reaches_handler() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("empty-chunks.bin");

    let runtime = full_runtime(false);
    let (mut reader, mut writer) = raw_channel(spawn_runtime(&runtime));

    writer
        .write_frame(&open_frame(
            11,
            "fb-upload",
            "fb",
            "upload",
            &[&target.to_string_lossy(), "4"],
        ))
        .await
        .unwrap();
    // Zero-length chunks are valid and contribute nothing to the total.
    writer.write_frame(&StreamFrame::data(11, b"")).await.unwrap();
    writer.write_frame(&StreamFrame::data(11, b"abcd")).await.unwrap();
    writer.write_frame(&StreamFrame::data(11, b"")).await.unwrap();
    writer.write_frame(&StreamFrame::close(11)).await.unwrap();

    let result = read_result(&mut reader, 11).await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(std::fs::read(&target).unwrap(), b"abcd");
}
