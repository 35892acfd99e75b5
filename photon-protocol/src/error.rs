//! Error types for the photon offload protocol.

use thiserror::Error;

/// Protocol-level errors raised while framing or decoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid magic bytes in the multipart envelope.
    #[error("Invalid magic bytes: expected 'PHMP', got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Envelope declares more parts than allowed.
    #[error("Too many parts: {0} (max: {1})")]
    TooManyParts(u32, u32),

    /// Envelope is larger than the configured limit.
    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(u64, u64),

    /// A message carried a leading tag we do not understand.
    #[error("Unknown tag: {0:?}")]
    UnknownTag(String),

    /// Reply tag was recognized but is not the one the request expects.
    #[error("Unexpected tag: expected {expected}, got {actual}")]
    UnexpectedTag {
        expected: &'static str,
        actual: String,
    },

    /// Reply belongs to a different event than the outstanding request.
    #[error("Event id mismatch: expected {expected}, got {actual}")]
    EventMismatch { expected: u32, actual: u32 },

    /// Wrong number of frames for the message's tag.
    #[error("Wrong frame count for {tag}: expected {expected}, got {actual}")]
    FrameCount {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A flat array frame does not hold the expected number of elements.
    #[error("Frame {index} has {actual} bytes, expected {expected}")]
    FrameLength {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// Message is empty or truncated.
    #[error("Incomplete message: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Failed to decode message payload.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),
}

impl ProtocolError {
    /// Returns true for replies that are well-formed but belong to another
    /// request (stale event id or a reply tag for a different request).
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            ProtocolError::EventMismatch { .. } | ProtocolError::UnexpectedTag { .. }
        )
    }
}

/// Client-side errors that can occur while talking to the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection was closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Writing a request failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// No reply arrived within the poll timeout.
    #[error("Request timed out")]
    Timeout,

    /// Every attempt of an exchange failed.
    #[error("Retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted { attempts: u32 },

    /// Reply was structurally wrong for a recognized tag.
    #[error("Malformed reply: {0}")]
    Malformed(#[from] ProtocolError),
}
