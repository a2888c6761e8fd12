//! Interactive PTY terminal (`terminal` namespace).
//!
//! A bidirectional stream: inbound data is keystrokes, outbound data is
//! terminal output, resize frames track the browser-side viewport. On
//! cancellation the shell gets SIGHUP, then SIGKILL after a grace
//! period.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde_json::json;
use tokio::sync::mpsc;

use crate::context::StreamContext;
use crate::emitter::Emitter;
use crate::error::HandlerError;
use crate::registry::{BidirectionalHandler, InputQueue, RegistryBuilder, ResizeEvents};

/// How long a HUP'd shell gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Register the `terminal` namespace.
pub fn install(builder: &mut RegistryBuilder) {
    builder.register_bidirectional("terminal", "open", Arc::new(Terminal));
}

/// `terminal.open [shell]`: host a shell on a fresh PTY.
struct Terminal;

#[async_trait]
impl BidirectionalHandler for Terminal {
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
        mut input: InputQueue,
        mut resize: ResizeEvents,
    ) -> Result<(), HandlerError> {
        let shell = args
            .first()
            .filter(|s| !s.is_empty())
            .cloned()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string());

        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                tracing::error!(error = %err, "pty open failed");
                HandlerError::internal("pty open failed")
            })?;

        let mut command = CommandBuilder::new(&shell);
        command.env("TERM", "xterm-256color");
        let mut child = pair.slave.spawn_command(command).map_err(|err| {
            tracing::error!(%shell, error = %err, "shell spawn failed");
            HandlerError::internal("shell spawn failed")
        })?;
        drop(pair.slave);

        let master = pair.master;
        let mut reader = master
            .try_clone_reader()
            .map_err(|_| HandlerError::internal("pty reader unavailable"))?;
        let mut writer = master
            .take_writer()
            .map_err(|_| HandlerError::internal("pty writer unavailable"))?;

        let pid = child.process_id();
        let mut killer = child.clone_killer();
        tracing::info!(session = %ctx.session.session_id, %shell, pid, "terminal opened");

        // PTY output drains on a blocking thread; frames go out from the
        // async side so emission stays ordered with the result.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Keystrokes feed a dedicated blocking writer thread.
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::task::spawn_blocking(move || {
            while let Some(chunk) = write_rx.blocking_recv() {
                if writer.write_all(&chunk).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let mut child_wait = tokio::task::spawn_blocking(move || child.wait());

        let mut write_tx = Some(write_tx);
        let mut output_open = true;
        let mut input_open = true;
        let mut resize_open = true;

        let status = loop {
            tokio::select! {
                exited = &mut child_wait => break exited,
                maybe = out_rx.recv(), if output_open => match maybe {
                    Some(chunk) => {
                        if emit.data(&chunk).await.is_err() {
                            terminate(pid, &mut killer, &mut child_wait).await;
                            return Err(HandlerError::internal("channel lost"));
                        }
                    }
                    None => output_open = false,
                },
                maybe = input.recv(), if input_open => match maybe {
                    Some(chunk) => {
                        if let Some(tx) = &write_tx {
                            let _ = tx.send(chunk);
                        }
                    }
                    None => {
                        // Client half-closed: no more keystrokes.
                        input_open = false;
                        write_tx = None;
                    }
                },
                maybe = resize.recv(), if resize_open => match maybe {
                    Some((cols, rows)) => {
                        let _ = master.resize(PtySize {
                            rows,
                            cols,
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                    }
                    None => resize_open = false,
                },
                () = ctx.cancelled() => {
                    terminate(pid, &mut killer, &mut child_wait).await;
                    return Err(HandlerError::aborted());
                }
            }
        };

        // The shell exited; flush output it already produced.
        while output_open {
            match tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await {
                Ok(Some(chunk)) => {
                    let _ = emit.data(&chunk).await;
                }
                Ok(None) | Err(_) => break,
            }
        }
        reader_task.abort();
        writer_task.abort();

        let exit_code = match status {
            Ok(Ok(status)) => Some(status.exit_code()),
            Ok(Err(_)) | Err(_) => None,
        };
        tracing::info!(session = %ctx.session.session_id, ?exit_code, "terminal closed");
        emit.result(json!({ "exit_code": exit_code })).await?;
        Ok(())
    }
}

/// SIGHUP, a grace period, then SIGKILL; reaps the child either way.
async fn terminate(
    pid: Option<u32>,
    killer: &mut Box<dyn portable_pty::ChildKiller + Send + Sync>,
    child_wait: &mut tokio::task::JoinHandle<std::io::Result<portable_pty::ExitStatus>>,
) {
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
    }
    if tokio::time::timeout(KILL_GRACE, &mut *child_wait).await.is_err() {
        let _ = killer.kill();
        let _ = child_wait.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionInfo;
    use crate::runtime::{BridgeConfig, BridgeRuntime};
    use linuxio_mux::{Multiplexer, MuxConfig, StreamEvent};
    use linuxio_proto::OpenRequest;

    fn terminal_runtime() -> BridgeRuntime {
        let session = SessionInfo {
            session_id: "ef".repeat(16),
            user: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            privileged: false,
        };
        let mut builder = RegistryBuilder::new();
        install(&mut builder);
        BridgeRuntime::new(BridgeConfig::new(session, "secret"), builder.freeze())
    }

    #[tokio::test]
    async fn test_shell_roundtrip_and_exit() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let runtime = terminal_runtime();
        {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve_stream(server_io).await });
        }

        let client = Multiplexer::client(client_io, MuxConfig::default());
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "terminal",
                "terminal",
                "open",
                vec!["/bin/sh".to_string()],
            ))
            .await
            .unwrap();

        handle.resize(120, 40).await.unwrap();
        handle.write(b"echo pty-marker-$((40 + 2))\n").await.unwrap();
        handle.write(b"exit\n").await.unwrap();

        let mut output = Vec::new();
        let result = loop {
            let event = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
                .await
                .expect("terminal stream made no progress")
                .expect("stream ended without result");
            match event {
                StreamEvent::Data(chunk) => output.extend_from_slice(&chunk),
                StreamEvent::Result(result) => break result,
                other => panic!("unexpected event: {other:?}"),
            }
        };

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("pty-marker-42"), "output: {text}");
        assert!(result.is_ok());
        assert_eq!(result.data.unwrap()["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_abort_kills_shell() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let runtime = terminal_runtime();
        {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve_stream(server_io).await });
        }

        let client = Multiplexer::client(client_io, MuxConfig::default());
        let mut handle = client
            .open_stream(&OpenRequest::new(
                "terminal",
                "terminal",
                "open",
                vec!["/bin/sh".to_string()],
            ))
            .await
            .unwrap();

        // Wait for the shell to come up, then cancel it mid-session.
        handle.write(b"echo ready\n").await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), handle.next_event())
                .await
                .expect("no shell output")
                .expect("stream ended early")
            {
                StreamEvent::Data(chunk) => {
                    if String::from_utf8_lossy(&chunk).contains("ready") {
                        break;
                    }
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        handle.abort().await;
        // The handle is aborted locally; the bridge reaps the shell with
        // HUP/KILL and the stream is gone.
        assert_eq!(handle.state(), linuxio_mux::StreamState::Aborted);
    }
}
