//! Error types for the LinuxIO wire protocol.

use thiserror::Error;

/// Stream framing errors.
///
/// Transport-level failures (`Truncated`, `ShortWrite`, `Io`) are fatal to
/// the channel that produced them. Everything else is a protocol violation
/// by the peer.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Unknown opcode byte.
    #[error("invalid opcode: 0x{0:02X}")]
    InvalidOpcode(u8),

    /// Declared payload length exceeds the configured ceiling. The payload
    /// is not consumed; the channel must be closed.
    #[error("frame payload of {len} bytes exceeds ceiling of {max}")]
    Oversize {
        /// Declared payload length.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// The channel ended mid-frame.
    #[error("truncated frame on channel")]
    Truncated,

    /// The underlying stream accepted fewer bytes than a full frame.
    #[error("short write on channel")]
    ShortWrite,

    /// A frame payload did not decode as its opcode requires.
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Auth record codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Peer spoke a different auth protocol version.
    #[error("unsupported auth protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A length-prefixed string exceeds the sanity cap.
    #[error("auth field `{field}` of {len} bytes exceeds cap of {max}")]
    FieldTooLong {
        /// Record field name.
        field: &'static str,
        /// Declared length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("auth field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// Unknown status byte in an auth response.
    #[error("invalid auth status byte: {0}")]
    InvalidStatus(u8),

    /// The channel ended mid-record.
    #[error("truncated auth record")]
    Truncated,

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(err)
        }
    }
}
