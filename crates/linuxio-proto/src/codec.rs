//! Async frame reader and writer.
//!
//! The reader enforces the payload ceiling before consuming the payload,
//! so an oversize frame poisons only the channel, never the process. The
//! writer writes header and payload as one buffer; a short write means
//! the channel is broken and must be discarded.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::frame::{Opcode, StreamFrame};
use crate::{DEFAULT_MAX_PAYLOAD, FRAME_HEADER_SIZE};

/// Reads complete frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream with the default payload ceiling.
    pub fn new(inner: R) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    /// Wrap a stream with an explicit payload ceiling.
    pub fn with_max_payload(inner: R, max_payload: usize) -> Self {
        Self { inner, max_payload }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Truncated` if the stream ends mid-frame,
    /// `FrameError::Oversize` if the declared payload exceeds the ceiling
    /// (the payload is not consumed), and `FrameError::InvalidOpcode` for
    /// an unknown opcode byte.
    pub async fn read_frame(&mut self) -> Result<Option<StreamFrame>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // A zero-byte read at the first header byte is a clean close.
        let n = self.inner.read(&mut header[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.inner
            .read_exact(&mut header[1..])
            .await
            .map_err(eof_as_truncated)?;

        let opcode = Opcode::try_from(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if len > self.max_payload {
            return Err(FrameError::Oversize {
                len,
                max: self.max_payload,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(eof_as_truncated)?;

        Ok(Some(StreamFrame {
            opcode,
            stream_id,
            payload,
        }))
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes complete frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame, header then payload, and flush.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::ShortWrite` if the stream closes mid-frame;
    /// the channel must then be treated as broken.
    pub async fn write_frame(&mut self, frame: &StreamFrame) -> Result<(), FrameError> {
        let buf = frame.encode();
        self.inner.write_all(&buf).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::WriteZero {
                FrameError::ShortWrite
            } else {
                FrameError::Io(err)
            }
        })?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn eof_as_truncated(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_codec_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let sent = StreamFrame::data(3, b"payload bytes");
        writer.write_frame(&sent).await.unwrap();

        let got = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_frame_is_truncated() {
        let (mut client, server) = tokio::io::duplex(64);
        let encoded = StreamFrame::data(1, b"abcdef").encode();
        client.write_all(&encoded[..encoded.len() - 3]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_oversize_rejected_without_consuming() {
        let (mut client, server) = tokio::io::duplex(256);
        let frame = StreamFrame::data(1, &[0xAB; 64]);
        client.write_all(&frame.encode()).await.unwrap();

        let mut reader = FrameReader::with_max_payload(server, 16);
        match reader.read_frame().await {
            Err(FrameError::Oversize { len, max }) => {
                assert_eq!(len, 64);
                assert_eq!(max, 16);
            }
            other => panic!("expected oversize, got {other:?}"),
        }

        // The payload is still unread on the wire.
        let mut inner = reader.into_inner();
        let mut rest = vec![0u8; 64];
        inner.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0xAB; 64]);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let frames = vec![
            StreamFrame::data(1, b"first"),
            StreamFrame::data(2, b""),
            StreamFrame::close(1),
        ];
        for frame in &frames {
            writer.write_frame(frame).await.unwrap();
        }

        for expected in &frames {
            let got = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(&got, expected);
        }
    }
}
