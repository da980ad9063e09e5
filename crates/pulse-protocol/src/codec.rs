//! Codecs for encoding and decoding Pulse frames.
//!
//! The socket does not care how frames look on the wire; it hands every
//! outbound frame to a [`Serializer`] and every inbound message back to it.
//! JSON text is the default. MessagePack is available for binary transports.

use bytes::Bytes;
use thiserror::Error;

use crate::frames::Frame;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The message kind is not understood by this serializer.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// A message as it travels over a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// A text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl RawMessage {
    /// Size of the message in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RawMessage::Text(text) => text.len(),
            RawMessage::Binary(data) => data.len(),
        }
    }

    /// Whether the message is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the message as bytes regardless of kind.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawMessage::Text(text) => text.as_bytes(),
            RawMessage::Binary(data) => data,
        }
    }
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        RawMessage::Text(text)
    }
}

impl From<&str> for RawMessage {
    fn from(text: &str) -> Self {
        RawMessage::Text(text.to_string())
    }
}

impl From<Bytes> for RawMessage {
    fn from(data: Bytes) -> Self {
        RawMessage::Binary(data)
    }
}

/// Pluggable frame encoding.
pub trait Serializer: Send + Sync {
    /// Encode a frame for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded or is too large.
    fn encode(&self, frame: &Frame) -> Result<RawMessage, ProtocolError>;

    /// Decode a frame received from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not a valid frame.
    fn decode(&self, message: &RawMessage) -> Result<Frame, ProtocolError>;

    /// Serializer name, for logging.
    fn name(&self) -> &'static str;
}

/// JSON text encoding. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, frame: &Frame) -> Result<RawMessage, ProtocolError> {
        let text = serde_json::to_string(frame)?;
        check_size(text.len())?;
        Ok(RawMessage::Text(text))
    }

    fn decode(&self, message: &RawMessage) -> Result<Frame, ProtocolError> {
        check_size(message.len())?;
        Ok(serde_json::from_slice(message.as_bytes())?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// MessagePack encoding with named fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn encode(&self, frame: &Frame) -> Result<RawMessage, ProtocolError> {
        let payload = rmp_serde::to_vec_named(frame)?;
        check_size(payload.len())?;
        Ok(RawMessage::Binary(Bytes::from(payload)))
    }

    fn decode(&self, message: &RawMessage) -> Result<Frame, ProtocolError> {
        match message {
            RawMessage::Binary(data) => {
                check_size(data.len())?;
                Ok(rmp_serde::from_slice(data)?)
            }
            RawMessage::Text(_) => Err(ProtocolError::Invalid(
                "text message on a msgpack socket".into(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}

/// Encode a frame with the default serializer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<RawMessage, ProtocolError> {
    JsonSerializer.encode(frame)
}

/// Decode a frame with the default serializer.
///
/// # Errors
///
/// Returns an error if the data is not a valid frame.
pub fn decode(message: &RawMessage) -> Result<Frame, ProtocolError> {
    JsonSerializer.decode(message)
}
