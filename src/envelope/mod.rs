//! Chunked binary envelope protocol.
//!
//! Logical events can exceed the fixed size limit of the underlying physical
//! records, so this module fragments oversized payloads into size-capped
//! [`ChunkedRecord`]s and reassembles them back into one [`Envelope`]. Data
//! and manifest traffic travel on independent channels, each with its own
//! package-id counter and accumulator.
//!
//! Encoding is fallible (the caller controls metadata and capacity); decoding
//! is deliberately not. Trace logs are expected to be occasionally dirty, so
//! the reader drops malformed or discontinuous input and keeps going.
//!
//! ```rust
//! use chronomux::envelope::{Envelope, EnvelopeReader, EnvelopeWriter};
//! use bytes::Bytes;
//! use chrono::Utc;
//!
//! # fn main() -> Result<(), chronomux::envelope::CodecError> {
//! let writer = EnvelopeWriter::data(57 * 1024);
//! let event = Envelope::new(Utc::now(), "bond", "session-0", "Tick.v1", Bytes::from_static(b"payload"));
//! let records = writer.encode(&event)?;
//!
//! let mut reader = EnvelopeReader::data();
//! let mut emitted = None;
//! for record in &records {
//!     emitted = emitted.or(reader.read(record));
//! }
//! assert_eq!(emitted.unwrap().payload, event.payload);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod record;

pub use codec::{EnvelopeReader, EnvelopeWriter, ReaderStats};
pub use error::{CodecError, CodecResult};
pub use record::{ChunkHeader, ChunkedRecord, Envelope, EnvelopeChannel, RecordKind, CHUNK_HEADER_LEN};

/// Default per-record payload capacity, matching the record size limit of
/// the trace sessions this engine typically replays.
pub const DEFAULT_RECORD_CAPACITY: usize = 57 * 1024;
