//! Input streams: one raw source, one deserializer chain, one pull queue.

use crate::deserialize::{CompositeDeserializer, EventRegistration};
use crate::envelope::{Envelope, EnvelopeReader};
use crate::error::{Error, Result};
use crate::types::{RawRecord, ReplayItem};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// What a producer thread pushes into its queue.
#[derive(Debug)]
pub(crate) enum PumpMessage {
    /// A deserialized, timestamped event.
    Item(ReplayItem),
    /// The producer faulted; no further items will follow.
    Failed(Error),
}

/// Contract for external record providers.
///
/// A source is driven on a dedicated producer thread: [`run`](RawSource::run)
/// pushes records into `sink` at whatever pace the underlying transport
/// dictates and returns on exhaustion. When `sink` returns `false` the
/// playback is shutting down and `run` must return promptly.
pub trait RawSource: Send {
    /// The record shape this source yields.
    type Record: Send;

    /// Human-readable source name, used in diagnostics and error context.
    fn name(&self) -> &str;

    /// Drive the source to exhaustion.
    ///
    /// # Errors
    /// Returns an error for producer-side faults, which terminate the whole
    /// playback.
    fn run(self: Box<Self>, sink: &mut dyn FnMut(Self::Record) -> bool) -> Result<()>;
}

/// An in-memory source yielding preloaded records, in order.
pub struct VecSource<R> {
    name: String,
    records: Vec<R>,
}

impl<R> VecSource<R> {
    /// Create a source over the given records.
    pub fn new(name: impl Into<String>, records: Vec<R>) -> Self {
        Self { name: name.into(), records }
    }
}

impl<R: Send> RawSource for VecSource<R> {
    type Record = R;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, sink: &mut dyn FnMut(R) -> bool) -> Result<()> {
        for record in self.records {
            if !sink(record) {
                break;
            }
        }
        Ok(())
    }
}

/// Adapter turning a source of wire-encoded physical records into a source of
/// reassembled [`Envelope`]s.
///
/// Records that fail to parse, and chunk sequences broken by a discontinuity,
/// are dropped by the reader; the stream continues.
pub struct EnvelopeSource<S> {
    inner: S,
    reader: EnvelopeReader,
}

impl<S> EnvelopeSource<S>
where
    S: RawSource<Record = RawRecord>,
{
    /// Wrap a raw source, reassembling on the data channel.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self { inner, reader: EnvelopeReader::data() }
    }

    /// Wrap a raw source with an explicit reader (e.g. the manifest channel).
    #[must_use]
    pub fn with_reader(inner: S, reader: EnvelopeReader) -> Self {
        Self { inner, reader }
    }
}

impl<S> RawSource for EnvelopeSource<S>
where
    S: RawSource<Record = RawRecord>,
{
    type Record = Envelope;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(self: Box<Self>, sink: &mut dyn FnMut(Envelope) -> bool) -> Result<()> {
        let this = *self;
        let mut reader = this.reader;
        Box::new(this.inner).run(&mut |record: RawRecord| {
            match reader.read_bytes(&record.payload) {
                Some(envelope) => sink(envelope),
                None => true,
            }
        })
    }
}

/// Object-safe handle over one configured input, erasing its record type.
pub(crate) trait InputLauncher: Send {
    fn name(&self) -> &str;

    /// Propagate a declaration of interest; `false` when this input cannot
    /// produce the type (or has already been launched).
    fn add_known_type(&mut self, registration: &EventRegistration) -> bool;

    /// Spawn the producer thread feeding `sender`.
    fn launch(
        &mut self,
        sender: Sender<PumpMessage>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>>;
}

/// A configured input: source plus deserializer, awaiting launch.
pub(crate) struct TypedInput<S: RawSource> {
    name: String,
    source: Option<Box<S>>,
    deserializer: Option<CompositeDeserializer<S::Record>>,
}

impl<S: RawSource> TypedInput<S> {
    pub(crate) fn new(source: S, deserializer: CompositeDeserializer<S::Record>) -> Self {
        Self {
            name: source.name().to_string(),
            source: Some(Box::new(source)),
            deserializer: Some(deserializer),
        }
    }
}

impl<S> InputLauncher for TypedInput<S>
where
    S: RawSource + 'static,
    S::Record: 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn add_known_type(&mut self, registration: &EventRegistration) -> bool {
        match self.deserializer.as_mut() {
            Some(deserializer) => deserializer.add_known_type(registration),
            None => false,
        }
    }

    fn launch(
        &mut self,
        sender: Sender<PumpMessage>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let (Some(source), Some(mut deserializer)) = (self.source.take(), self.deserializer.take())
        else {
            return Err(Error::Internal { message: format!("input '{}' launched twice", self.name) });
        };
        let name = self.name.clone();
        let thread_name = name.clone();

        std::thread::Builder::new()
            .name(format!("chronomux-input-{name}"))
            .spawn(move || {
                debug!(input = %thread_name, "producer started");
                let result = source.run(&mut |record| {
                    if shutdown.load(Ordering::Relaxed) {
                        return false;
                    }
                    match deserializer.deserialize(&record) {
                        // A closed queue means the pump is gone; stop pulling.
                        Some(item) => sender.send(PumpMessage::Item(item)).is_ok(),
                        None => true,
                    }
                });
                match result {
                    Ok(()) => debug!(input = %thread_name, "producer exhausted"),
                    Err(error) => {
                        warn!(input = %thread_name, %error, "producer failed");
                        let failure = match error {
                            Error::Source { .. } => error,
                            other => Error::source(thread_name.as_str(), other.to_string()),
                        };
                        let _ = sender.send(PumpMessage::Failed(failure));
                    },
                }
            })
            .map_err(|e| Error::resource(format!("cannot spawn producer for '{name}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserialize::{EnvelopeEvent, IdentityTypeMap, PartitionedTypeMap, TypeKey};
    use crate::envelope::EnvelopeWriter;
    use crate::types::{ReplayEvent, SourceId, Timestamp, Timestamped};
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note(String);
    impl ReplayEvent for Note {}
    impl EnvelopeEvent for Note {
        fn type_key() -> TypeKey {
            TypeKey::schema("Note.v1")
        }

        fn decode(payload: &Bytes) -> Result<Self> {
            String::from_utf8(payload.to_vec())
                .map(Self)
                .map_err(|_| Error::Deserialize { type_name: "Note", message: "not utf8".into() })
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn drain<S: RawSource + 'static>(source: S) -> Vec<S::Record> {
        let mut out = Vec::new();
        Box::new(source).run(&mut |record| {
            out.push(record);
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn vec_source_yields_in_order_and_honors_stop() {
        let source = VecSource::new("mem", vec![1, 2, 3, 4]);
        let mut taken = Vec::new();
        Box::new(source)
            .run(&mut |record| {
                taken.push(record);
                taken.len() < 2
            })
            .unwrap();
        assert_eq!(taken, vec![1, 2]);
    }

    #[test]
    fn envelope_source_reassembles_fragmented_payloads() {
        let writer = EnvelopeWriter::data(256);
        let payload: Bytes = vec![9u8; 700].into();
        let envelope = Envelope::new(ts(5), "bond", "mem", "Note.v1", payload.clone());
        let records: Vec<RawRecord> = writer
            .encode(&envelope)
            .unwrap()
            .iter()
            .map(|record| RawRecord {
                timestamp: ts(5),
                source_id: SourceId::from("mem"),
                kind: record.kind.as_u8().into(),
                payload: record.encode().unwrap(),
                correlation_id: None,
            })
            .collect();
        assert!(records.len() > 1);

        let envelopes = drain(EnvelopeSource::new(VecSource::new("mem", records)));
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].payload, payload);
    }

    #[test]
    fn launched_input_feeds_its_queue() {
        let items = vec![
            Timestamped::new(Note("a".into()), ts(1)),
            Timestamped::new(Note("b".into()), ts(2)),
        ];
        let deserializer =
            CompositeDeserializer::new().with_map(IdentityTypeMap::<Note>::new());
        let mut input = TypedInput::new(VecSource::new("mem", items), deserializer);
        assert!(input.add_known_type(&EventRegistration::passthrough::<Note>()));

        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = input.launch(sender, Arc::new(AtomicBool::new(false))).unwrap();
        handle.join().unwrap();

        let collected: Vec<_> = receiver.try_iter().collect();
        assert_eq!(collected.len(), 2);
        assert!(matches!(&collected[0], PumpMessage::Item(item) if item.timestamp == ts(1)));
    }

    #[test]
    fn second_launch_is_an_internal_error() {
        let deserializer: CompositeDeserializer<Envelope> =
            CompositeDeserializer::new().with_map(PartitionedTypeMap::by_schema_id());
        let source = EnvelopeSource::new(VecSource::new("mem", Vec::new()));
        let mut input = TypedInput::new(source, deserializer);

        let (sender, _receiver) = crossbeam_channel::unbounded();
        let flag = Arc::new(AtomicBool::new(false));
        input.launch(sender.clone(), Arc::clone(&flag)).unwrap().join().unwrap();
        assert!(input.launch(sender, flag).is_err());
    }

    #[test]
    fn failing_source_reports_through_the_queue() {
        struct Broken;
        impl RawSource for Broken {
            type Record = Timestamped<Note>;

            fn name(&self) -> &str {
                "broken"
            }

            fn run(
                self: Box<Self>,
                _sink: &mut dyn FnMut(Self::Record) -> bool,
            ) -> Result<()> {
                Err(Error::resource("file vanished"))
            }
        }

        let mut input = TypedInput::new(
            Broken,
            CompositeDeserializer::new().with_map(IdentityTypeMap::<Note>::new()),
        );
        let (sender, receiver) = crossbeam_channel::unbounded();
        input.launch(sender, Arc::new(AtomicBool::new(false))).unwrap().join().unwrap();

        let messages: Vec<_> = receiver.try_iter().collect();
        assert_eq!(messages.len(), 1);
        assert!(
            matches!(&messages[0], PumpMessage::Failed(Error::Source { source_name, .. }) if source_name == "broken")
        );
    }
}
