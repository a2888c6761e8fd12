//! Stream frame encoding and decoding.
//!
//! All multi-byte fields are big-endian (network byte order). A frame is
//! a 9-byte header followed by an opcode-specific payload; the codec in
//! [`crate::codec`] handles reading and writing complete frames over a
//! byte stream.

use crate::FRAME_HEADER_SIZE;
use crate::error::FrameError;

/// Frame opcodes (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// New logical stream; payload is a null-delimited open request.
    StreamOpen = 0x01,
    /// Opaque data chunk. Zero-length payloads are valid keep-alives.
    StreamData = 0x02,
    /// Half-close from the sender.
    StreamClose = 0x03,
    /// Immediate cancellation; the receiver must cease work promptly.
    StreamAbort = 0x04,
    /// Terminal JSON result record, bridge to client.
    StreamResult = 0x05,
    /// Interim JSON progress record, bridge to client.
    StreamProgress = 0x06,
    /// Terminal geometry change; payload is `cols(BE16) rows(BE16)`.
    StreamResize = 0x07,
    /// Flow-control credit; payload is bytes acknowledged as BE32.
    StreamAck = 0x08,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::StreamOpen),
            0x02 => Ok(Self::StreamData),
            0x03 => Ok(Self::StreamClose),
            0x04 => Ok(Self::StreamAbort),
            0x05 => Ok(Self::StreamResult),
            0x06 => Ok(Self::StreamProgress),
            0x07 => Ok(Self::StreamResize),
            0x08 => Ok(Self::StreamAck),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Frame opcode.
    pub opcode: Opcode,
    /// Logical stream id; 0 is reserved for control traffic.
    pub stream_id: u32,
    /// Opcode-specific payload.
    pub payload: Vec<u8>,
}

impl StreamFrame {
    /// Create a frame from its parts.
    #[must_use]
    pub fn new(opcode: Opcode, stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            stream_id,
            payload,
        }
    }

    /// Data chunk frame.
    #[must_use]
    pub fn data(stream_id: u32, chunk: &[u8]) -> Self {
        Self::new(Opcode::StreamData, stream_id, chunk.to_vec())
    }

    /// Half-close frame.
    #[must_use]
    pub fn close(stream_id: u32) -> Self {
        Self::new(Opcode::StreamClose, stream_id, Vec::new())
    }

    /// Abort frame.
    #[must_use]
    pub fn abort(stream_id: u32) -> Self {
        Self::new(Opcode::StreamAbort, stream_id, Vec::new())
    }

    /// Resize frame carrying terminal geometry.
    #[must_use]
    pub fn resize(stream_id: u32, cols: u16, rows: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&cols.to_be_bytes());
        payload.extend_from_slice(&rows.to_be_bytes());
        Self::new(Opcode::StreamResize, stream_id, payload)
    }

    /// Flow-control credit frame.
    #[must_use]
    pub fn ack(stream_id: u32, bytes: u32) -> Self {
        Self::new(Opcode::StreamAck, stream_id, bytes.to_be_bytes().to_vec())
    }

    /// Empty data frame on the control stream, used as a keep-alive.
    #[must_use]
    pub fn keepalive() -> Self {
        Self::new(Opcode::StreamData, crate::CONTROL_STREAM_ID, Vec::new())
    }

    /// Decode the geometry of a resize frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::MalformedPayload` if the payload is not
    /// exactly four bytes.
    pub fn decode_resize(&self) -> Result<(u16, u16), FrameError> {
        if self.payload.len() != 4 {
            return Err(FrameError::MalformedPayload("resize"));
        }
        let cols = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let rows = u16::from_be_bytes([self.payload[2], self.payload[3]]);
        Ok((cols, rows))
    }

    /// Decode the byte count of an ack frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::MalformedPayload` if the payload is not
    /// exactly four bytes.
    pub fn decode_ack(&self) -> Result<u32, FrameError> {
        if self.payload.len() != 4 {
            return Err(FrameError::MalformedPayload("ack"));
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Encode the frame into a fresh buffer, header then payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from the front of `data`, returning it together
    /// with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Truncated` if `data` holds less than a full
    /// header plus declared payload, and `FrameError::InvalidOpcode` for
    /// an unknown opcode byte.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        let opcode = Opcode::try_from(data[0])?;
        let stream_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        if data.len() < FRAME_HEADER_SIZE + len {
            return Err(FrameError::Truncated);
        }
        let payload = data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        Ok((
            Self {
                opcode,
                stream_id,
                payload,
            },
            FRAME_HEADER_SIZE + len,
        ))
    }
}
