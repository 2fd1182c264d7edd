//! Physical record structure and wire operations for the chunked envelope
//! protocol.

use crate::envelope::{CodecError, CodecResult};
use crate::types::Timestamp;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::TimeZone;
use chrono::Utc;

/// Per-chunk header length: package id + chunk count + chunk index.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Length prefix size for each metadata string.
const STRING_PREFIX_LEN: usize = 2;

/// Kind discriminant + two timestamps + payload length field.
const FIXED_FIELDS_LEN: usize = 1 + 8 + 8 + 4;

/// Logical channel a record travels on.
///
/// Data and manifest traffic are fragmented and reassembled independently:
/// each channel has its own package-id counter and its own accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeChannel {
    /// Event payload traffic.
    Data,
    /// Schema manifest traffic (string payloads).
    Manifest,
}

/// Wire discriminant identifying a record's channel and fragmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Unfragmented data record.
    Complete = 0x01,
    /// One piece of a fragmented data payload.
    Chunk = 0x02,
    /// Unfragmented manifest record.
    ManifestComplete = 0x03,
    /// One piece of a fragmented manifest payload.
    ManifestChunk = 0x04,
}

impl RecordKind {
    /// Convert from the wire discriminant.
    ///
    /// # Errors
    /// Returns an error for an unknown discriminant value.
    pub const fn from_u8(value: u8) -> CodecResult<Self> {
        match value {
            0x01 => Ok(Self::Complete),
            0x02 => Ok(Self::Chunk),
            0x03 => Ok(Self::ManifestComplete),
            0x04 => Ok(Self::ManifestChunk),
            other => Err(CodecError::UnknownKind { kind: other }),
        }
    }

    /// Convert to the wire discriminant.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether records of this kind carry a chunk header.
    #[must_use]
    pub const fn is_chunked(self) -> bool {
        matches!(self, Self::Chunk | Self::ManifestChunk)
    }

    /// The logical channel this kind belongs to.
    #[must_use]
    pub const fn channel(self) -> EnvelopeChannel {
        match self {
            Self::Complete | Self::Chunk => EnvelopeChannel::Data,
            Self::ManifestComplete | Self::ManifestChunk => EnvelopeChannel::Manifest,
        }
    }

    /// The unfragmented kind for a channel.
    #[must_use]
    pub const fn complete_for(channel: EnvelopeChannel) -> Self {
        match channel {
            EnvelopeChannel::Data => Self::Complete,
            EnvelopeChannel::Manifest => Self::ManifestComplete,
        }
    }

    /// The fragmented kind for a channel.
    #[must_use]
    pub const fn chunk_for(channel: EnvelopeChannel) -> Self {
        match channel {
            EnvelopeChannel::Data => Self::Chunk,
            EnvelopeChannel::Manifest => Self::ManifestChunk,
        }
    }
}

/// Fragmentation header carried by chunked records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Counter identifying one chunked-transmission sequence within a channel.
    pub package_id: u32,
    /// Total chunks in the sequence.
    pub chunk_count: u32,
    /// Zero-based position of this chunk.
    pub chunk_index: u32,
}

/// A fully reassembled logical event.
///
/// Materialized exactly once per complete chunk sequence, or once for an
/// unfragmented record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Time at which the event logically occurred.
    pub occurrence_time: Timestamp,
    /// Time at which the event was received by the session.
    pub receive_time: Timestamp,
    /// Protocol under which the payload was serialized.
    pub protocol: String,
    /// Provider that produced the event.
    pub source: String,
    /// Schema identifier of the payload.
    pub type_id: String,
    /// Reassembled payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope with identical occurrence and receive times.
    #[must_use]
    pub fn new(
        occurrence_time: Timestamp,
        protocol: impl Into<String>,
        source: impl Into<String>,
        type_id: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            occurrence_time,
            receive_time: occurrence_time,
            protocol: protocol.into(),
            source: source.into(),
            type_id: type_id.into(),
            payload,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// A size-capped physical record as written to or read from the session.
///
/// Wire layout (big-endian):
///
/// ```text
/// [kind:u8]
/// [occurrence_time:i64][receive_time:i64]
/// [protocol: u16 len + utf8][source: u16 len + utf8][type_id: u16 len + utf8]
/// [package_id:u32][chunk_count:u32][chunk_index:u32]   -- chunked kinds only
/// [payload_len:u32][payload bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedRecord {
    /// Channel/fragmentation discriminant.
    pub kind: RecordKind,
    /// Occurrence time of the logical event.
    pub occurrence_time: Timestamp,
    /// Receive time of the logical event.
    pub receive_time: Timestamp,
    /// Protocol metadata, repeated on every chunk.
    pub protocol: String,
    /// Source metadata, repeated on every chunk.
    pub source: String,
    /// Schema identifier, repeated on every chunk.
    pub type_id: String,
    /// Fragmentation header; present iff `kind.is_chunked()`.
    pub chunk: Option<ChunkHeader>,
    /// Payload bytes of this physical record.
    pub payload: Bytes,
}

impl ChunkedRecord {
    /// Fixed-field overhead for the given metadata strings.
    ///
    /// This is what the writer subtracts from the record capacity before
    /// deciding whether and how to fragment.
    #[must_use]
    pub fn overhead(protocol: &str, source: &str, type_id: &str, chunked: bool) -> usize {
        let strings = STRING_PREFIX_LEN * 3 + protocol.len() + source.len() + type_id.len();
        FIXED_FIELDS_LEN + strings + if chunked { CHUNK_HEADER_LEN } else { 0 }
    }

    /// Total encoded size of this record.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::overhead(&self.protocol, &self.source, &self.type_id, self.chunk.is_some())
            + self.payload.len()
    }

    /// Serialize the record to wire bytes.
    ///
    /// # Errors
    /// Returns an error when a metadata string overflows its length prefix, a
    /// timestamp is outside the wire range, or the kind and chunk header
    /// disagree.
    pub fn encode(&self) -> CodecResult<Bytes> {
        if self.kind.is_chunked() != self.chunk.is_some() {
            return Err(CodecError::KindMismatch {
                kind: self.kind.as_u8(),
                chunked: self.chunk.is_some(),
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind.as_u8());
        buf.put_i64(wire_nanos(self.occurrence_time)?);
        buf.put_i64(wire_nanos(self.receive_time)?);
        put_string(&mut buf, "protocol", &self.protocol)?;
        put_string(&mut buf, "source", &self.source)?;
        put_string(&mut buf, "type_id", &self.type_id)?;

        if let Some(header) = self.chunk {
            buf.put_u32(header.package_id);
            buf.put_u32(header.chunk_count);
            buf.put_u32(header.chunk_index);
        }

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a record from wire bytes.
    ///
    /// # Errors
    /// Returns an error for truncated buffers, unknown kinds, or invalid UTF-8
    /// in the metadata fields.
    pub fn decode(data: &Bytes) -> CodecResult<Self> {
        let mut buf = data.clone();

        ensure(&buf, 1)?;
        let kind = RecordKind::from_u8(buf.get_u8())?;

        ensure(&buf, 16)?;
        let occurrence_time = from_wire_nanos(buf.get_i64());
        let receive_time = from_wire_nanos(buf.get_i64());

        let protocol = get_string(&mut buf, "protocol")?;
        let source = get_string(&mut buf, "source")?;
        let type_id = get_string(&mut buf, "type_id")?;

        let chunk = if kind.is_chunked() {
            ensure(&buf, CHUNK_HEADER_LEN)?;
            Some(ChunkHeader {
                package_id: buf.get_u32(),
                chunk_count: buf.get_u32(),
                chunk_index: buf.get_u32(),
            })
        } else {
            None
        };

        ensure(&buf, 4)?;
        let payload_len = buf.get_u32() as usize;
        ensure(&buf, payload_len)?;
        let payload = buf.slice(..payload_len);

        Ok(Self {
            kind,
            occurrence_time,
            receive_time,
            protocol,
            source,
            type_id,
            chunk,
            payload,
        })
    }
}

fn ensure(buf: &Bytes, required: usize) -> CodecResult<()> {
    if buf.remaining() < required {
        Err(CodecError::Truncated { required, actual: buf.remaining() })
    } else {
        Ok(())
    }
}

fn put_string(buf: &mut BytesMut, field: &'static str, value: &str) -> CodecResult<()> {
    let len = value.len();
    let prefix = u16::try_from(len)
        .map_err(|_| CodecError::MetadataTooLong { field, actual: len, max: u16::MAX as usize })?;
    buf.put_u16(prefix);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes, field: &'static str) -> CodecResult<String> {
    ensure(buf, STRING_PREFIX_LEN)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.slice(..len);
    buf.advance(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}

fn wire_nanos(ts: Timestamp) -> CodecResult<i64> {
    ts.timestamp_nanos_opt().ok_or_else(|| CodecError::TimeOutOfRange {
        message: format!("{ts} is not representable as i64 nanoseconds"),
    })
}

fn from_wire_nanos(nanos: i64) -> Timestamp {
    Utc.timestamp_nanos(nanos)
}
