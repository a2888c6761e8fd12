//! Multiplexer error types.

use linuxio_proto::FrameError;
use thiserror::Error;

/// Errors surfaced by the multiplexer and its stream handles.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The underlying channel is gone; every stream on it is aborted.
    #[error("channel lost")]
    ChannelLost,

    /// Write attempted on a stream past half-close.
    #[error("write on closed stream {0}")]
    WriteAfterClose(u32),

    /// The stream was aborted while an operation was in flight.
    #[error("stream {0} aborted")]
    Aborted(u32),

    /// No free stream id; every 32-bit id is live.
    #[error("stream ids exhausted")]
    StreamsExhausted,

    /// Framing failure on the channel.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl MuxError {
    /// Whether the error means the whole channel is unusable.
    #[must_use]
    pub fn is_channel_lost(&self) -> bool {
        match self {
            MuxError::ChannelLost => true,
            MuxError::Frame(err) => !matches!(err, FrameError::MalformedPayload(_)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_lost_classification() {
        assert!(MuxError::ChannelLost.is_channel_lost());
        assert!(MuxError::Frame(FrameError::Truncated).is_channel_lost());
        assert!(MuxError::Frame(FrameError::ShortWrite).is_channel_lost());
        assert!(!MuxError::Frame(FrameError::MalformedPayload("resize")).is_channel_lost());
        assert!(!MuxError::WriteAfterClose(3).is_channel_lost());
        assert!(!MuxError::Aborted(3).is_channel_lost());
    }
}
