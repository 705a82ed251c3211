//! Wire-level error types.

use crate::value::ValueKind;
use thiserror::Error;

/// Errors raised by the primitive codecs when converting between bytes and
/// typed values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("{codec}: expected {expected} bytes, got {actual}")]
    Width {
        codec: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{codec}: cannot encode a {found} value")]
    Type {
        codec: &'static str,
        found: ValueKind,
    },

    #[error("{codec}: value {value} does not fit in {width} bytes")]
    OutOfRange {
        codec: &'static str,
        value: String,
        width: usize,
    },

    #[error("invalid BCD byte: {0:#04x}")]
    InvalidBcd(u8),

    #[error("invalid instrument clock: {0}")]
    InvalidClock(String),

    #[error("text is not ASCII")]
    NotAscii,
}

/// Errors raised while extracting a sample from a matched frame.
///
/// A sample error is scoped to one frame. The stream keeps going.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("unknown particle type: {0}")]
    UnknownParticle(String),

    #[error("{particle}: frame is {actual} bytes, layout needs {expected}")]
    LengthMismatch {
        particle: String,
        expected: usize,
        actual: usize,
    },

    #[error("{particle}: sync bytes {actual} do not match {expected}")]
    SyncMismatch {
        particle: String,
        expected: String,
        actual: String,
    },

    #[error("{particle}: size word {actual} does not match {expected}")]
    SizeMismatch {
        particle: String,
        expected: u16,
        actual: u16,
    },

    #[error("{particle}: checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        particle: String,
        expected: u16,
        actual: u16,
    },

    #[error("{particle}: field '{field}': {source}")]
    Field {
        particle: String,
        field: String,
        source: CodecError,
    },
}

/// Errors in the command/response exchange with the instrument.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("instrument rejected '{command}' (NACK)")]
    Nack { command: String },

    #[error("unexpected response to '{command}': {detail}")]
    UnexpectedResponse { command: String, detail: String },

    #[error("{block} checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        block: String,
        expected: u16,
        actual: u16,
    },

    #[error("invalid frame signature '{name}': {reason}")]
    InvalidSignature { name: String, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ProtocolError {
    /// Returns whether the exchange that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProtocolError::InvalidSignature { .. })
    }
}
