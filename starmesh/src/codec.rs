//! Pluggable frame serialization.
//!
//! Raw links move opaque byte buffers. The [`FrameCodec`] trait turns a
//! [`Frame`] into bytes and back, so deployments can trade the default
//! human-readable [`JsonCodec`] for something denser without touching the
//! channel logic.
//!
//! # Example
//!
//! ```rust
//! use starmesh::codec::{FrameCodec, JsonCodec};
//! use starmesh::types::{CorrelationId, Frame, Package, Tag};
//!
//! let codec = JsonCodec;
//! let frame = Frame::request(CorrelationId::new(1), Package::bare(Tag::Promote));
//!
//! let bytes = codec.encode(&frame).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), frame);
//! ```

use std::fmt;

use thiserror::Error;

use crate::types::Frame;

/// Error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A frame could not be turned into bytes.
    #[error("Frame encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Inbound bytes are not a valid frame.
    #[error("Frame decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Frame serialization format used by network-backed channels.
///
/// Loopback channels never serialize; they hand the frame straight back.
pub trait FrameCodec: fmt::Debug + 'static {
    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the buffer is not a valid frame.
    fn decode(&self, buf: &[u8]) -> Result<Frame, CodecError>;
}

/// JSON codec using serde_json. The default.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(frame).map_err(CodecError::Encode)
    }

    fn decode(&self, buf: &[u8]) -> Result<Frame, CodecError> {
        serde_json::from_slice(buf).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrelationId, Package, Tag};
    use serde_json::json;

    #[test]
    fn test_json_codec_tagged_frame() {
        let codec = JsonCodec;
        let frame = Frame::request(
            CorrelationId::new(42),
            Package::new(Tag::Dispatch, json!({"type": "SET_FOO", "value": 123})),
        );

        let bytes = codec.encode(&frame).expect("encode should succeed");
        let decoded = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_json_codec_bare_ack_layout() {
        let codec = JsonCodec;
        let bytes = codec
            .encode(&Frame::ack(CorrelationId::new(5), None))
            .expect("encode should succeed");
        assert_eq!(&bytes, br#"{"id":5}"#);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec;
        let result = codec.decode(b"not valid json {");

        let err = result.unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().starts_with("Frame decode failed"));
    }

    #[test]
    fn test_codec_error_keeps_source() {
        use std::error::Error as _;

        let inner = serde_json::from_str::<Frame>("[]").unwrap_err();
        let message = inner.to_string();
        let err = CodecError::Encode(inner);
        assert!(err.to_string().starts_with("Frame encode failed"));
        assert_eq!(err.source().map(|e| e.to_string()), Some(message));
    }
}
