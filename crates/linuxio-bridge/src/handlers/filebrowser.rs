//! File transfer and archive operations (`fb` namespace).
//!
//! Uploads are flow-controlled: the handler acknowledges received bytes
//! through progress records every 512 KiB, which the client's send
//! window treats as credit. Downloads have no window constraint and
//! report progress at 2 MiB intervals. All partial outputs are removed
//! on every failure path, including client aborts.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::context::StreamContext;
use crate::emitter::Emitter;
use crate::error::HandlerError;
use crate::registry::{
    BidirectionalHandler, Handler, InputQueue, RegistryBuilder, ResizeEvents,
};

/// Upload ack cadence; doubles as the client's flow-control credit.
const UPLOAD_ACK_INTERVAL: u64 = 512 * 1024;

/// Download progress cadence; the receiver has no window constraint.
const DOWNLOAD_PROGRESS_INTERVAL: u64 = 2 * 1024 * 1024;

/// Download read chunk.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Ceiling for inline reads; larger files go through `download`.
const INLINE_READ_CEILING: u64 = 4 * 1024 * 1024;

/// Register the `fb` namespace.
pub fn install(builder: &mut RegistryBuilder) {
    builder.register_bidirectional("fb", "upload", Arc::new(Upload));
    builder.register("fb", "download", Arc::new(Download));
    builder.register("fb", "compress", Arc::new(Compress));
    builder.register("fb", "read", Arc::new(ReadFile));
    builder.register_bidirectional("fb", "write", Arc::new(WriteFile));
    builder.register("fb", "stat", Arc::new(Stat));
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, HandlerError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| HandlerError::bad_request(format!("missing argument: {name}")))
}

fn temp_path(path: &str, stream_id: u32) -> String {
    format!("{path}.part-{stream_id}")
}

fn size_mismatch(expected: u64, got: u64) -> HandlerError {
    HandlerError::bad_request(format!("size mismatch: expected {expected}, got {got}"))
}

/// `fb.upload <path> <size>`: receive exactly `size` bytes into `path`.
struct Upload;

#[async_trait]
impl BidirectionalHandler for Upload {
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
        mut input: InputQueue,
        _resize: ResizeEvents,
    ) -> Result<(), HandlerError> {
        let path = arg(args, 0, "path")?.to_string();
        let expected: u64 = arg(args, 1, "size")?
            .parse()
            .map_err(|_| HandlerError::bad_request("invalid size"))?;

        let temp = temp_path(&path, ctx.stream_id);
        let mut file = fs::File::create(&temp).await.map_err(HandlerError::from)?;
        let mut written: u64 = 0;
        let mut last_acked: u64 = 0;

        let outcome: Result<(), HandlerError> = loop {
            tokio::select! {
                () = ctx.cancelled() => break Err(HandlerError::aborted()),
                chunk = input.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(err) = file.write_all(&chunk).await {
                            break Err(err.into());
                        }
                        written += chunk.len() as u64;
                        if written > expected {
                            break Err(size_mismatch(expected, written));
                        }
                        if written - last_acked >= UPLOAD_ACK_INTERVAL {
                            last_acked = written;
                            let _ = emit
                                .progress(&json!({ "acked": written, "written": written }))
                                .await;
                        }
                    }
                    // Half-close from the client marks the end of the upload.
                    None => break Ok(()),
                },
            }
        };

        if let Err(err) = outcome {
            drop(file);
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        if let Err(err) = file.flush().await {
            drop(file);
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        drop(file);

        if written != expected {
            let _ = fs::remove_file(&temp).await;
            return Err(size_mismatch(expected, written));
        }
        if let Err(err) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }

        let _ = emit.progress(&json!({ "acked": written })).await;
        emit.result(json!({ "path": path, "size": written })).await?;
        Ok(())
    }
}

/// `fb.download <path>`: stream a file to the client.
struct Download;

#[async_trait]
impl Handler for Download {
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        let path = arg(args, 0, "path")?;

        let mut file = fs::File::open(path).await.map_err(HandlerError::from)?;
        let total = file.metadata().await.map_err(HandlerError::from)?.len();

        let mut sent: u64 = 0;
        let mut last_progress: u64 = 0;
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            if ctx.is_cancelled() {
                return Err(HandlerError::aborted());
            }
            let n = file.read(&mut buf).await.map_err(HandlerError::from)?;
            if n == 0 {
                break;
            }
            emit.data(&buf[..n]).await?;
            sent += n as u64;
            if sent - last_progress >= DOWNLOAD_PROGRESS_INTERVAL {
                last_progress = sent;
                let _ = emit.progress(&json!({ "sent": sent, "total": total })).await;
            }
        }

        emit.result(json!({ "path": path, "size": sent })).await?;
        Ok(())
    }
}

/// `fb.compress <format> <dest> <src>…`: archive via the system tool.
struct Compress;

#[async_trait]
impl Handler for Compress {
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        let format = arg(args, 0, "format")?;
        let dest = arg(args, 1, "dest")?.to_string();
        let sources = &args[2..];
        if sources.is_empty() {
            return Err(HandlerError::bad_request("missing argument: sources"));
        }

        let (tool, mut tool_args) = match format {
            "zip" => ("zip", vec!["-r".to_string(), "-q".to_string(), dest.clone()]),
            "targz" | "tar.gz" => ("tar", vec!["-czf".to_string(), dest.clone()]),
            other => {
                return Err(HandlerError::bad_request(format!(
                    "unsupported archive format: {other}"
                )));
            }
        };
        tool_args.extend(sources.iter().cloned());

        let mut child = tokio::process::Command::new(tool)
            .args(&tool_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    HandlerError::internal(format!("archive tool not installed: {tool}"))
                } else {
                    HandlerError::internal("archive tool failed to start")
                }
            })?;

        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) if status.success() => {
                            let bytes = fs::metadata(&dest)
                                .await
                                .map(|meta| meta.len())
                                .unwrap_or(0);
                            emit.result(json!({ "path": dest, "bytes": bytes })).await?;
                            Ok(())
                        }
                        Ok(_) => {
                            let _ = fs::remove_file(&dest).await;
                            Err(HandlerError::internal("archive tool failed"))
                        }
                        Err(err) => {
                            let _ = fs::remove_file(&dest).await;
                            Err(err.into())
                        }
                    };
                }
                () = ctx.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let _ = fs::remove_file(&dest).await;
                    return Err(HandlerError::aborted());
                }
                _ = ticker.tick() => {
                    let bytes = fs::metadata(&dest)
                        .await
                        .map(|meta| meta.len())
                        .unwrap_or(0);
                    let _ = emit.progress(&json!({ "bytes": bytes })).await;
                }
            }
        }
    }
}

/// `fb.read <path>`: inline read of a small file.
struct ReadFile;

#[async_trait]
impl Handler for ReadFile {
    async fn execute(
        &self,
        _ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        let path = arg(args, 0, "path")?;

        let meta = fs::metadata(path).await.map_err(HandlerError::from)?;
        if meta.len() > INLINE_READ_CEILING {
            return Err(HandlerError::bad_request("file too large for inline read"));
        }

        let bytes = fs::read(path).await.map_err(HandlerError::from)?;
        emit.result(json!({
            "path": path,
            "size": bytes.len(),
            "content": base64::engine::general_purpose::STANDARD.encode(&bytes),
        }))
        .await?;
        Ok(())
    }
}

/// `fb.write <path>`: replace a file with the streamed input.
struct WriteFile;

#[async_trait]
impl BidirectionalHandler for WriteFile {
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
        mut input: InputQueue,
        _resize: ResizeEvents,
    ) -> Result<(), HandlerError> {
        let path = arg(args, 0, "path")?.to_string();
        let temp = temp_path(&path, ctx.stream_id);

        let mut file = fs::File::create(&temp).await.map_err(HandlerError::from)?;
        let mut written: u64 = 0;

        let outcome: Result<(), HandlerError> = loop {
            tokio::select! {
                () = ctx.cancelled() => break Err(HandlerError::aborted()),
                chunk = input.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(err) = file.write_all(&chunk).await {
                            break Err(err.into());
                        }
                        written += chunk.len() as u64;
                    }
                    None => break Ok(()),
                },
            }
        };

        if let Err(err) = outcome {
            drop(file);
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        if let Err(err) = file.flush().await {
            drop(file);
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        drop(file);
        if let Err(err) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }

        emit.result(json!({ "path": path, "size": written })).await?;
        Ok(())
    }
}

/// `fb.stat <path>`: file metadata.
struct Stat;

#[async_trait]
impl Handler for Stat {
    async fn execute(
        &self,
        _ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        use std::os::unix::fs::PermissionsExt;

        let path = arg(args, 0, "path")?;
        let meta = fs::metadata(path).await.map_err(HandlerError::from)?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        emit.result(json!({
            "path": path,
            "size": meta.len(),
            "is_dir": meta.is_dir(),
            "mode": meta.permissions().mode() & 0o7777,
            "modified": modified,
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionInfo;
    use crate::runtime::{BridgeConfig, BridgeRuntime};
    use linuxio_mux::{Multiplexer, MuxConfig, StreamEvent};
    use linuxio_proto::OpenRequest;

    fn fb_runtime() -> BridgeRuntime {
        let session = SessionInfo {
            session_id: "cd".repeat(16),
            user: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            privileged: false,
        };
        let mut builder = RegistryBuilder::new();
        install(&mut builder);
        BridgeRuntime::new(BridgeConfig::new(session, "secret"), builder.freeze())
    }

    fn fb_client() -> (Multiplexer, BridgeRuntime) {
        let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
        let runtime = fb_runtime();
        {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve_stream(server_io).await });
        }
        (Multiplexer::client(client_io, MuxConfig::default()), runtime)
    }

    async fn wait_result(
        handle: &mut linuxio_mux::StreamHandle,
    ) -> linuxio_proto::StreamResult {
        loop {
            match handle.next_event().await.expect("stream ended early") {
                StreamEvent::Result(result) => return result,
                StreamEvent::Closed(reason) => panic!("closed without result: {reason:?}"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_upload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("uploaded.bin");
        let (client, _runtime) = fb_client();

        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-upload",
                "fb",
                "upload",
                vec![target.to_string_lossy().into_owned(), "10".to_string()],
            ))
            .await
            .unwrap();

        handle.write(b"01234").await.unwrap();
        handle.write(b"56789").await.unwrap();
        handle.close().await.unwrap();

        let result = wait_result(&mut handle).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(result.data.unwrap()["size"], 10);
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_upload_size_mismatch_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("short.bin");
        let (client, _runtime) = fb_client();

        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-upload",
                "fb",
                "upload",
                vec![target.to_string_lossy().into_owned(), "10".to_string()],
            ))
            .await
            .unwrap();

        handle.write(b"012345678").await.unwrap(); // 9 of 10 bytes
        handle.close().await.unwrap();

        let result = wait_result(&mut handle).await;
        assert_eq!(result.code, Some(400));
        assert_eq!(
            result.error.unwrap(),
            "size mismatch: expected 10, got 9"
        );
        assert!(!target.exists());
        assert!(!dir.path().join("short.bin.part-1").exists());
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_size_argument() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x.bin");
        let (client, _runtime) = fb_client();

        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-upload",
                "fb",
                "upload",
                vec![target.to_string_lossy().into_owned(), "ten".to_string()],
            ))
            .await
            .unwrap();
        handle.close().await.unwrap();

        let result = wait_result(&mut handle).await;
        assert_eq!(result.code, Some(400));
        assert_eq!(result.error.unwrap(), "invalid size");
    }

    #[tokio::test]
    async fn test_download_streams_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.bin");
        let payload = vec![0x5Au8; 3 * 1024 * 1024];
        std::fs::write(&source, &payload).unwrap();

        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-download",
                "fb",
                "download",
                vec![source.to_string_lossy().into_owned()],
            ))
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut progress_seen = false;
        let result = loop {
            match handle.next_event().await.unwrap() {
                StreamEvent::Data(chunk) => received.extend_from_slice(&chunk),
                StreamEvent::Progress(value) => {
                    progress_seen = true;
                    assert_eq!(value["total"], payload.len());
                }
                StreamEvent::Result(result) => break result,
                other => panic!("unexpected event: {other:?}"),
            }
        };

        assert!(result.is_ok());
        assert!(progress_seen, "expected a 2 MiB progress record");
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_download_missing_file_404() {
        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-download",
                "fb",
                "download",
                vec!["/nonexistent/file".to_string()],
            ))
            .await
            .unwrap();

        let result = wait_result(&mut handle).await;
        assert_eq!(result.code, Some(404));
        assert_eq!(result.error.unwrap(), "file not found");
    }

    #[tokio::test]
    async fn test_read_inlines_base64() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hello.txt");
        std::fs::write(&source, b"hello, bridge").unwrap();

        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "call",
                "fb",
                "read",
                vec![source.to_string_lossy().into_owned()],
            ))
            .await
            .unwrap();

        let result = wait_result(&mut handle).await;
        let data = result.data.unwrap();
        let content = base64::engine::general_purpose::STANDARD
            .decode(data["content"].as_str().unwrap())
            .unwrap();
        assert_eq!(content, b"hello, bridge");
    }

    #[tokio::test]
    async fn test_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("config.toml");
        std::fs::write(&target, b"old contents").unwrap();

        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-write",
                "fb",
                "write",
                vec![target.to_string_lossy().into_owned()],
            ))
            .await
            .unwrap();
        handle.write(b"fresh contents").await.unwrap();
        handle.close().await.unwrap();

        let result = wait_result(&mut handle).await;
        assert!(result.is_ok());
        assert_eq!(std::fs::read(&target).unwrap(), b"fresh contents");
    }

    #[tokio::test]
    async fn test_stat() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stat-me");
        std::fs::write(&target, b"12345").unwrap();

        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "call",
                "fb",
                "stat",
                vec![target.to_string_lossy().into_owned()],
            ))
            .await
            .unwrap();

        let result = wait_result(&mut handle).await;
        let data = result.data.unwrap();
        assert_eq!(data["size"], 5);
        assert_eq!(data["is_dir"], false);
        assert!(data["modified"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_compress_unsupported_format() {
        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-compress",
                "fb",
                "compress",
                vec![
                    "rar".to_string(),
                    "/tmp/out.rar".to_string(),
                    "/etc/hostname".to_string(),
                ],
            ))
            .await
            .unwrap();

        let result = wait_result(&mut handle).await;
        assert_eq!(result.code, Some(400));
        assert!(result.error.unwrap().contains("unsupported archive format"));
    }

    #[tokio::test]
    async fn test_compress_targz() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.join("b.txt"), b"beta").unwrap();
        let dest = dir.path().join("out.tar.gz");

        let (client, _runtime) = fb_client();
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "fb-compress",
                "fb",
                "compress",
                vec![
                    "targz".to_string(),
                    dest.to_string_lossy().into_owned(),
                    src.to_string_lossy().into_owned(),
                ],
            ))
            .await
            .unwrap();

        let result = wait_result(&mut handle).await;
        assert!(result.is_ok(), "{result:?}");
        assert!(dest.exists());
        assert!(result.data.unwrap()["bytes"].as_u64().unwrap() > 0);
    }
}
