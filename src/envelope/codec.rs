//! Fragmentation and reassembly of logical envelopes across size-capped
//! physical records.

use crate::envelope::record::{ChunkHeader, ChunkedRecord, EnvelopeChannel, RecordKind};
use crate::envelope::{CodecError, CodecResult, Envelope};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::warn;

/// Splits logical envelopes into physical records no larger than a fixed
/// capacity.
///
/// One writer exists per logical channel. The package-id counter is guarded by
/// a per-channel lock so concurrent writers on the same channel never emit
/// colliding sequences; the counter wraps at `u32::MAX`.
#[derive(Debug)]
pub struct EnvelopeWriter {
    channel: EnvelopeChannel,
    capacity: usize,
    package_counter: Mutex<u32>,
}

impl EnvelopeWriter {
    /// Create a writer for the given channel and record capacity.
    #[must_use]
    pub const fn new(channel: EnvelopeChannel, capacity: usize) -> Self {
        Self { channel, capacity, package_counter: Mutex::new(0) }
    }

    /// Create a data-channel writer.
    #[must_use]
    pub const fn data(capacity: usize) -> Self {
        Self::new(EnvelopeChannel::Data, capacity)
    }

    /// Create a manifest-channel writer.
    #[must_use]
    pub const fn manifest(capacity: usize) -> Self {
        Self::new(EnvelopeChannel::Manifest, capacity)
    }

    /// Seed the package-id counter, e.g. when resuming an interrupted stream.
    #[must_use]
    pub fn with_initial_package(self, package_id: u32) -> Self {
        *self.package_counter.lock() = package_id;
        self
    }

    /// The record capacity this writer fragments against.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encode one envelope into one or more physical records.
    ///
    /// The payload is emitted as a single unfragmented record when it fits
    /// within the capacity after subtracting the fixed-field overhead for the
    /// envelope's metadata strings. Otherwise the capacity is further reduced
    /// by the per-chunk header and the payload is split into equal-size
    /// pieces, all carrying the same freshly drawn package id.
    ///
    /// # Errors
    /// Returns an error when the metadata overhead alone exhausts the
    /// capacity, a metadata string overflows its length prefix, or the chunk
    /// count overflows its wire field.
    pub fn encode(&self, envelope: &Envelope) -> CodecResult<Vec<ChunkedRecord>> {
        let plain_overhead =
            ChunkedRecord::overhead(&envelope.protocol, &envelope.source, &envelope.type_id, false);
        let payload_len = envelope.payload.len();

        if plain_overhead + payload_len <= self.capacity {
            return Ok(vec![self.record(envelope, RecordKind::complete_for(self.channel), None, envelope.payload.clone())]);
        }

        let chunk_overhead =
            ChunkedRecord::overhead(&envelope.protocol, &envelope.source, &envelope.type_id, true);
        if chunk_overhead >= self.capacity {
            return Err(CodecError::CapacityExhausted {
                capacity: self.capacity,
                overhead: chunk_overhead,
            });
        }

        let chunk_capacity = self.capacity - chunk_overhead;
        let required = payload_len.div_ceil(chunk_capacity);
        let chunk_count = u32::try_from(required).map_err(|_| CodecError::TooManyChunks {
            payload_len,
            required,
            max: u32::MAX,
        })?;

        // Equal-size pieces; the last one takes the remainder.
        let piece_len = payload_len.div_ceil(required);
        let package_id = self.next_package_id();
        let kind = RecordKind::chunk_for(self.channel);

        let mut records = Vec::with_capacity(required);
        for chunk_index in 0..chunk_count {
            let start = chunk_index as usize * piece_len;
            let end = (start + piece_len).min(payload_len);
            let header = ChunkHeader { package_id, chunk_count, chunk_index };
            records.push(self.record(envelope, kind, Some(header), envelope.payload.slice(start..end)));
        }
        Ok(records)
    }

    fn record(
        &self,
        envelope: &Envelope,
        kind: RecordKind,
        chunk: Option<ChunkHeader>,
        payload: Bytes,
    ) -> ChunkedRecord {
        ChunkedRecord {
            kind,
            occurrence_time: envelope.occurrence_time,
            receive_time: envelope.receive_time,
            protocol: envelope.protocol.clone(),
            source: envelope.source.clone(),
            type_id: envelope.type_id.clone(),
            chunk,
            payload,
        }
    }

    fn next_package_id(&self) -> u32 {
        let mut counter = self.package_counter.lock();
        *counter = counter.wrapping_add(1);
        *counter
    }
}

/// Reassembly statistics, useful when deciding how dirty a log is.
#[derive(Debug, Default, Clone)]
pub struct ReaderStats {
    /// Envelopes emitted (complete records plus finished sequences).
    pub envelopes_emitted: u64,
    /// Records dropped as malformed or mis-routed.
    pub records_dropped: u64,
    /// Partial chunk sequences discarded on a discontinuity.
    pub sequences_discarded: u64,
}

/// Buffered state for the chunk sequence currently in flight.
#[derive(Debug, Default)]
struct ChunkAccumulator {
    active: bool,
    package_id: u32,
    chunks: Vec<Bytes>,
}

impl ChunkAccumulator {
    fn reset(&mut self) {
        self.active = false;
        self.package_id = 0;
        self.chunks.clear();
    }
}

/// Reassembles physical records back into logical envelopes.
///
/// One reader exists per logical channel, driven by a single accumulator.
/// Reads never fail outward: trace logs are expected to be occasionally
/// dirty, so malformed or discontinuous input clears the accumulator and is
/// dropped with a `warn`.
#[derive(Debug)]
pub struct EnvelopeReader {
    channel: EnvelopeChannel,
    accumulator: ChunkAccumulator,
    stats: ReaderStats,
}

impl EnvelopeReader {
    /// Create a reader for the given channel.
    #[must_use]
    pub fn new(channel: EnvelopeChannel) -> Self {
        Self { channel, accumulator: ChunkAccumulator::default(), stats: ReaderStats::default() }
    }

    /// Create a data-channel reader.
    #[must_use]
    pub fn data() -> Self {
        Self::new(EnvelopeChannel::Data)
    }

    /// Create a manifest-channel reader.
    #[must_use]
    pub fn manifest() -> Self {
        Self::new(EnvelopeChannel::Manifest)
    }

    /// Reassembly statistics so far.
    #[must_use]
    pub const fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Parse wire bytes and feed the record to [`read`](Self::read).
    ///
    /// A buffer that fails to parse clears the accumulator and is dropped.
    pub fn read_bytes(&mut self, data: &Bytes) -> Option<Envelope> {
        match ChunkedRecord::decode(data) {
            Ok(record) => self.read(&record),
            Err(error) => {
                warn!(channel = ?self.channel, %error, "dropping unparseable record");
                self.discard_partial();
                self.stats.records_dropped += 1;
                None
            },
        }
    }

    /// Feed one physical record; returns an envelope when one completes.
    ///
    /// An unfragmented record emits immediately. A chunk extends the current
    /// sequence when its package id and position line up with the buffered
    /// state; any discontinuity discards the buffered sequence, and only a
    /// chunk at index 0 can start a new one. A record whose header is
    /// malformed (`chunk_count <= chunk_index`) is dropped.
    pub fn read(&mut self, record: &ChunkedRecord) -> Option<Envelope> {
        if record.kind.channel() != self.channel {
            warn!(
                channel = ?self.channel,
                record_kind = ?record.kind,
                "dropping record routed to the wrong channel"
            );
            self.discard_partial();
            self.stats.records_dropped += 1;
            return None;
        }

        let Some(header) = record.chunk else {
            self.discard_partial();
            return Some(self.emit(record, record.payload.clone()));
        };

        if header.chunk_count == 0 || header.chunk_count <= header.chunk_index {
            warn!(
                channel = ?self.channel,
                chunk_count = header.chunk_count,
                chunk_index = header.chunk_index,
                "dropping malformed chunk header"
            );
            self.discard_partial();
            self.stats.records_dropped += 1;
            return None;
        }

        if header.chunk_count == 1 {
            self.discard_partial();
            return Some(self.emit(record, record.payload.clone()));
        }

        let continues = self.accumulator.active
            && self.accumulator.package_id == header.package_id
            && self.accumulator.chunks.len() == header.chunk_index as usize;

        if !continues {
            self.discard_partial();
            if header.chunk_index != 0 {
                // A sequence whose start was never seen cannot be completed;
                // buffering it would only ever emit corrupt payloads.
                warn!(
                    channel = ?self.channel,
                    package_id = header.package_id,
                    chunk_index = header.chunk_index,
                    "dropping mid-sequence chunk with no buffered start"
                );
                self.stats.records_dropped += 1;
                return None;
            }
            self.accumulator.active = true;
            self.accumulator.package_id = header.package_id;
        }

        self.accumulator.chunks.push(record.payload.clone());

        if header.chunk_index == header.chunk_count - 1 {
            let total: usize = self.accumulator.chunks.iter().map(Bytes::len).sum();
            let mut assembled = BytesMut::with_capacity(total);
            for piece in &self.accumulator.chunks {
                assembled.extend_from_slice(piece);
            }
            self.accumulator.reset();
            return Some(self.emit(record, assembled.freeze()));
        }
        None
    }

    fn emit(&mut self, record: &ChunkedRecord, payload: Bytes) -> Envelope {
        self.stats.envelopes_emitted += 1;
        Envelope {
            occurrence_time: record.occurrence_time,
            receive_time: record.receive_time,
            protocol: record.protocol.clone(),
            source: record.source.clone(),
            type_id: record.type_id.clone(),
            payload,
        }
    }

    fn discard_partial(&mut self) {
        if self.accumulator.active {
            self.stats.sequences_discarded += 1;
        }
        self.accumulator.reset();
    }
}
