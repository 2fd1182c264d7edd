//! End-to-end playback scenarios across the whole pipeline.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use chronomux::prelude::*;
use chronomux::{
    EnvelopeSource, EnvelopeWriter, IdentityTypeMap, PartitionedTypeMap, Playback, RawRecord,
    SourceId, VecSource,
};
use parking_lot::Mutex;
use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn ts(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
struct Msg(&'static str);
impl ReplayEvent for Msg {}
impl SubscribableEvent for Msg {
    fn registration() -> EventRegistration {
        EventRegistration::passthrough::<Self>()
    }
}

fn msg_source(name: &str, items: &[(&'static str, i64)]) -> VecSource<Timestamped<Msg>> {
    VecSource::new(
        name,
        items.iter().map(|&(label, secs)| Timestamped::new(Msg(label), ts(secs))).collect(),
    )
}

fn msg_chain() -> CompositeDeserializer<Timestamped<Msg>> {
    CompositeDeserializer::new().with_map(IdentityTypeMap::<Msg>::new())
}

#[test]
fn two_sources_merge_into_global_time_order() {
    init_tracing();
    let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
    playback.add_input(msg_source("a", &[("a1", 1), ("a2", 3)]), msg_chain()).unwrap();
    playback.add_input(msg_source("b", &[("b1", 2), ("b2", 4)]), msg_chain()).unwrap();
    let mut stream = playback.observe::<Msg>().unwrap();

    playback.run().unwrap();

    let mut merged = Vec::new();
    while let Some(event) = stream.blocking_next_event() {
        merged.push((event.value.0, event.timestamp));
    }
    assert_eq!(
        merged,
        vec![("a1", ts(1)), ("b1", ts(2)), ("a2", ts(3)), ("b2", ts(4))]
    );
    assert_eq!(playback.elapsed(), Duration::from_secs(3));
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Blob {
    bytes: Vec<u8>,
}
impl ReplayEvent for Blob {}
impl EnvelopeEvent for Blob {
    fn type_key() -> TypeKey {
        TypeKey::schema("Blob.v1")
    }

    fn decode(payload: &Bytes) -> chronomux::Result<Self> {
        Ok(Self { bytes: payload.to_vec() })
    }
}
impl SubscribableEvent for Blob {
    fn registration() -> EventRegistration {
        EventRegistration::enveloped::<Self>()
    }
}

#[test]
fn oversized_payload_survives_fragmentation_end_to_end() {
    init_tracing();
    const CAPACITY: usize = 57_000;
    const PAYLOAD_LEN: usize = 200_000;

    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 239) as u8).collect();
    let envelope =
        Envelope::new(ts(50), "bond", "trace-session", "Blob.v1", payload.clone().into());

    let writer = EnvelopeWriter::data(CAPACITY);
    let records = writer.encode(&envelope).unwrap();
    assert!(records.len() > 1, "200k payload with a 57k cap must fragment");

    let correlation = Uuid::new_v4();
    let raw: Vec<RawRecord> = records
        .iter()
        .map(|record| RawRecord {
            timestamp: ts(50),
            source_id: SourceId::from("trace-session"),
            kind: u32::from(record.kind.as_u8()),
            payload: record.encode().unwrap(),
            correlation_id: Some(correlation),
        })
        .collect();

    let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
    playback
        .add_input(
            EnvelopeSource::new(VecSource::new("trace-session", raw)),
            CompositeDeserializer::new().with_map(PartitionedTypeMap::by_schema_id()),
        )
        .unwrap();
    let mut stream = playback.observe::<Blob>().unwrap();

    playback.run().unwrap();

    let blob = stream.blocking_next_event().unwrap();
    assert_eq!(blob.timestamp, ts(50));
    assert_eq!(blob.value.bytes, payload);
    assert!(stream.blocking_next_event().is_none());
}

#[derive(Debug, Clone, PartialEq)]
struct BaseAlert(&'static str);
impl ReplayEvent for BaseAlert {}
impl SubscribableEvent for BaseAlert {
    fn registration() -> EventRegistration {
        EventRegistration::passthrough::<Self>()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DiskAlert(&'static str);
impl ReplayEvent for DiskAlert {
    fn parent_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<BaseAlert>())
    }
}
impl SubscribableEvent for DiskAlert {
    fn registration() -> EventRegistration {
        EventRegistration::passthrough::<Self>()
    }
}

#[test]
fn base_subscription_sees_exact_and_declared_children() {
    let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
    playback
        .add_input(
            VecSource::new(
                "alerts-base",
                vec![Timestamped::new(BaseAlert("generic"), ts(1))],
            ),
            CompositeDeserializer::new().with_map(IdentityTypeMap::<BaseAlert>::new()),
        )
        .unwrap();
    playback
        .add_input(
            VecSource::new("alerts-disk", vec![Timestamped::new(DiskAlert("disk full"), ts(2))]),
            CompositeDeserializer::new().with_map(IdentityTypeMap::<DiskAlert>::new()),
        )
        .unwrap();

    let mut base_stream = playback.observe::<BaseAlert>().unwrap();
    // The disk alert only flows if someone declared interest in it.
    let _disk_stream = playback.observe::<DiskAlert>().unwrap();

    playback.run().unwrap();

    let mut seen = Vec::new();
    while let Some(signal) = base_stream.blocking_recv() {
        match signal {
            StreamSignal::Event(item) => seen.push(item.value.type_name()),
            StreamSignal::Completed => break,
            other => panic!("unexpected signal: {other:?}"),
        }
    }
    assert_eq!(seen.len(), 2);
    assert!(seen[0].ends_with("BaseAlert"));
    assert!(seen[1].ends_with("DiskAlert"));
}

#[test]
fn scheduled_callbacks_fire_on_virtual_time() {
    let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
    playback
        .add_input(msg_source("a", &[("t10", 10), ("t40", 40), ("t90", 90)]), msg_chain())
        .unwrap();
    let _stream = playback.observe::<Msg>().unwrap();

    let fired: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let scheduler = playback.scheduler();

    // Scheduled before the clock is anchored: re-based on the first event at
    // t=10, so due at t=40 and t=15 respectively.
    scheduler.schedule_after(Duration::from_secs(30), {
        let fired = Arc::clone(&fired);
        move || fired.lock().push("plus-30")
    });
    scheduler.schedule_after(Duration::from_secs(5), {
        let fired = Arc::clone(&fired);
        move || fired.lock().push("plus-5")
    });

    playback.run().unwrap();

    assert_eq!(*fired.lock(), vec!["plus-5", "plus-30"]);
    assert_eq!(playback.elapsed(), Duration::from_secs(80));
}

struct TornSource;
impl RawSource for TornSource {
    type Record = Timestamped<Msg>;

    fn name(&self) -> &str {
        "torn"
    }

    fn run(self: Box<Self>, sink: &mut dyn FnMut(Self::Record) -> bool) -> chronomux::Result<()> {
        sink(Timestamped::new(Msg("before-fault"), ts(1)));
        Err(Error::source("torn", "session reader died"))
    }
}

#[test]
fn source_failure_surfaces_from_run_without_retracting_deliveries() {
    let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
    playback.add_input(TornSource, msg_chain()).unwrap();
    let mut stream = playback.observe::<Msg>().unwrap();

    let outcome = playback.run();
    assert!(matches!(outcome, Err(Error::Source { .. })));

    // The event delivered before the fault stays delivered.
    assert!(matches!(
        stream.blocking_recv(),
        Some(StreamSignal::Event(item)) if item.value.is::<Msg>()
    ));
    assert!(matches!(stream.blocking_recv(), Some(StreamSignal::Failed(_))));
    assert!(stream.blocking_recv().is_none());
}

#[test]
fn late_subscription_misses_earlier_events() {
    // Two playbacks over the same records: the second subscribes only after
    // the first full run, proving nothing is replayed across subscriptions
    // within a run either.
    let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
    playback.add_input(msg_source("a", &[("one", 1), ("two", 2)]), msg_chain()).unwrap();

    // No observe() before run: events of Msg are produced by nobody-declared
    // inputs and dropped at the deserializer, costing nothing downstream.
    playback.run().unwrap();

    let mut late = playback.observe::<Msg>().unwrap();
    assert!(matches!(late.blocking_recv(), Some(StreamSignal::Completed)));
}
