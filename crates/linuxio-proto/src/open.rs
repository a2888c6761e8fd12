//! Stream-open payloads.
//!
//! The payload of a `StreamOpen` frame is a null-delimited sequence:
//! stream type, handler namespace, command, then arguments. NUL cannot
//! appear inside a field, which is acceptable for handler addresses and
//! shell-style arguments.

use crate::error::FrameError;

/// Parsed `StreamOpen` payload: the address of a handler plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Stream type label, e.g. `"call"`, `"fb-upload"`, `"terminal"`.
    pub stream_type: String,
    /// Handler namespace.
    pub namespace: String,
    /// Handler command within the namespace.
    pub command: String,
    /// Positional arguments.
    pub args: Vec<String>,
}

impl OpenRequest {
    /// Build an open request.
    #[must_use]
    pub fn new(
        stream_type: impl Into<String>,
        namespace: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            stream_type: stream_type.into(),
            namespace: namespace.into(),
            command: command.into(),
            args,
        }
    }

    /// Encode as a null-delimited byte sequence.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut fields: Vec<&str> = Vec::with_capacity(3 + self.args.len());
        fields.push(&self.stream_type);
        fields.push(&self.namespace);
        fields.push(&self.command);
        for arg in &self.args {
            fields.push(arg);
        }
        fields.join("\0").into_bytes()
    }

    /// Parse a `StreamOpen` payload.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::MalformedPayload` when the payload is not
    /// UTF-8, has fewer than three fields, or has an empty namespace or
    /// command.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| FrameError::MalformedPayload("stream open"))?;
        let mut fields = text.split('\0');

        let stream_type = fields
            .next()
            .ok_or(FrameError::MalformedPayload("stream open"))?;
        let namespace = fields
            .next()
            .ok_or(FrameError::MalformedPayload("stream open"))?;
        let command = fields
            .next()
            .ok_or(FrameError::MalformedPayload("stream open"))?;
        if namespace.is_empty() || command.is_empty() {
            return Err(FrameError::MalformedPayload("stream open"));
        }

        Ok(Self {
            stream_type: stream_type.to_string(),
            namespace: namespace.to_string(),
            command: command.to_string(),
            args: fields.map(str::to_string).collect(),
        })
    }
}
