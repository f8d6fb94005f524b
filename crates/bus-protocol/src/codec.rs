//! Codec for encoding and decoding bus messages.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.
//! Framing starts on the first byte after the authentication handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::Message;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a message to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded message
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode_into(message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    MessageCodec::new().encode_into(message, buf)
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let message = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(message)
}

/// Try to decode a message from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(message))` if a complete message was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    MessageCodec::new().decode_from(buf)
}

/// Codec for streaming message encoding/decoding with a configurable size limit.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a new codec instance with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a codec that rejects frames above `max_frame_size` bytes.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Get the frame limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode a message into an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is too large or encoding fails.
    pub fn encode_into(&self, message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = rmp_serde::to_vec_named(message)?;

        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }

    /// Try to decode a message from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        // Reject before the body arrives so a bogus prefix can't make us buffer it
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_size = LENGTH_PREFIX_SIZE + length;
        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length);
        let message = rmp_serde::from_slice(&payload)?;

        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Arg;

    fn sample() -> Message {
        Message::method_call("com.example.Foo", "/com/example/Foo", "Ping")
            .with_serial(9)
            .with_sender(":3")
            .with_arg("hello")
            .with_arg(42u32)
            .with_arg(vec![1u8, 2, 3])
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let message = sample();
        let encoded = encode(&message).unwrap();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.args[2], Arg::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&sample()).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let codec = MessageCodec::with_max_frame_size(16);
        match codec.encode(&sample()) {
            Err(ProtocolError::FrameTooLarge { max, .. }) => assert_eq!(max, 16),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_prefix_rejected_before_body() {
        let codec = MessageCodec::with_max_frame_size(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(4096);

        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 4096, .. })
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let first = sample();
        let second = Message::signal("/a", "org.example.Iface", "Changed").with_serial(10);

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        // Feed one byte short of everything: only the first message is ready
        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(decode_from(&mut partial).unwrap(), Some(first));
        assert_eq!(decode_from(&mut partial).unwrap(), None);

        partial.unsplit(buf);
        assert_eq!(decode_from(&mut partial).unwrap(), Some(second));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_malformed_body() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1]);

        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::Decode(_))
        ));
    }
}
