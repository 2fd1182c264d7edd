//! Codec-specific error types.

use thiserror::Error;

/// Errors raised while encoding or parsing chunked records.
///
/// Only the encode path surfaces these to callers. The reassembly side treats
/// every decode failure as a dropped record and resets its accumulator instead
/// of propagating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A metadata string exceeds the length-prefix range.
    #[error("Metadata field '{field}' is {actual} bytes, limit {max}")]
    MetadataTooLong {
        /// Which field overflowed.
        field: &'static str,
        /// Actual byte length.
        actual: usize,
        /// Maximum representable length.
        max: usize,
    },

    /// Fixed-field overhead leaves no room for payload bytes.
    #[error("Record capacity {capacity} exhausted by {overhead} bytes of overhead")]
    CapacityExhausted {
        /// Configured record capacity.
        capacity: usize,
        /// Overhead for the given metadata.
        overhead: usize,
    },

    /// The payload needs more chunks than the counter field can express.
    #[error("Payload of {payload_len} bytes needs {required} chunks, limit {max}")]
    TooManyChunks {
        /// Payload length being fragmented.
        payload_len: usize,
        /// Chunks required at the effective capacity.
        required: usize,
        /// Maximum expressible chunk count.
        max: u32,
    },

    /// A timestamp falls outside the representable wire range.
    #[error("Timestamp out of wire range: {message}")]
    TimeOutOfRange {
        /// Failure detail.
        message: String,
    },

    /// The record buffer is shorter than its declared contents.
    #[error("Truncated record: need {required} bytes, have {actual}")]
    Truncated {
        /// Bytes required to finish parsing.
        required: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown record kind discriminant.
    #[error("Unknown record kind: {kind:#04x}")]
    UnknownKind {
        /// The unrecognized discriminant.
        kind: u8,
    },

    /// A record's kind and chunk header disagree.
    #[error("Record kind {kind:#04x} is incompatible with chunked={chunked}")]
    KindMismatch {
        /// The record kind discriminant.
        kind: u8,
        /// Whether a chunk header was present.
        chunked: bool,
    },

    /// A metadata field held invalid UTF-8.
    #[error("Metadata field '{field}' is not valid UTF-8")]
    InvalidUtf8 {
        /// Which field failed to decode.
        field: &'static str,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
