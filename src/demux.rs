//! Per-type demultiplexing of the merged event sequence.
//!
//! The demultiplexor keeps a registry of lazily-created broadcast channels
//! keyed by concrete runtime type. Every incoming item is delivered to the
//! channel for its exact type, if one exists, and additionally to the channel
//! for its single declared base type: one level of fallback, never a full
//! inheritance walk. Completion and error signals are propagated to every
//! currently-open channel.
//!
//! Channels are broadcast: many subscribers may listen at once, and a
//! subscriber that attaches late receives nothing retroactively. A subscriber
//! that falls behind the bounded ring observes a [`StreamSignal::Lagged`] gap
//! rather than exerting backpressure on the pump.

use crate::error::Error;
use crate::types::{ReplayEvent, ReplayItem, Timestamped};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// A signal delivered on a per-type output channel.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    /// One merged event routed to this channel.
    Event(ReplayItem),
    /// The merged sequence ended normally; no further events will arrive.
    Completed,
    /// The merged sequence ended with a producer-side fault.
    Failed(Arc<Error>),
    /// This subscriber fell behind and missed the given number of signals.
    Lagged(u64),
}

/// Delivery counters for the demultiplexor.
#[derive(Debug, Default)]
pub struct DemuxStats {
    /// Items delivered to at least one channel.
    routed: AtomicU64,
    /// Items that matched no open channel.
    unrouted: AtomicU64,
}

impl DemuxStats {
    /// Items delivered to at least one channel.
    #[must_use]
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Items that matched no open channel.
    #[must_use]
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }
}

/// Fans the merged, typed sequence out to per-runtime-type channels.
pub struct Demultiplexor {
    channels: DashMap<TypeId, broadcast::Sender<StreamSignal>>,
    capacity: usize,
    terminal: RwLock<Option<StreamSignal>>,
    stats: DemuxStats,
}

impl Demultiplexor {
    /// Create a demultiplexor whose channels buffer `capacity` signals.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            terminal: RwLock::new(None),
            stats: DemuxStats::default(),
        }
    }

    /// Subscribe to events whose exact runtime type, or single declared base
    /// type, is `T`.
    ///
    /// The channel is created on first subscription; events routed before
    /// that are not replayed.
    #[must_use]
    pub fn subscribe<T: ReplayEvent>(&self) -> EventStream<T> {
        let receiver = {
            let sender = self
                .channels
                .entry(TypeId::of::<T>())
                .or_insert_with(|| broadcast::channel(self.capacity).0);
            sender.subscribe()
        };
        // Snapshot after creating the receiver: a terminal signal broadcast
        // before the receiver existed can only be seen through the snapshot.
        let pending_terminal = self.terminal.read().clone();
        EventStream {
            receiver,
            pending_terminal,
            finished: false,
            _marker: PhantomData,
        }
    }

    /// Route one merged item.
    pub fn publish(&self, item: &ReplayItem) {
        let exact = item.value.event_type();
        let mut delivered = self.send_to(exact, || StreamSignal::Event(item.clone()));

        if let Some(parent) = item.value.parent_type() {
            if parent != exact {
                delivered |= self.send_to(parent, || StreamSignal::Event(item.clone()));
            }
        }

        if delivered {
            self.stats.routed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Signal normal completion to every open channel.
    pub fn complete(&self) {
        self.finish(StreamSignal::Completed);
    }

    /// Signal a fatal fault to every open channel.
    pub fn fail(&self, error: Arc<Error>) {
        self.finish(StreamSignal::Failed(error));
    }

    /// Number of per-type channels created so far.
    ///
    /// Channels are never torn down while the demultiplexor lives; that is a
    /// documented property of the design, not an oversight.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Delivery counters.
    #[must_use]
    pub const fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    fn finish(&self, signal: StreamSignal) {
        {
            let mut terminal = self.terminal.write();
            if terminal.is_none() {
                *terminal = Some(signal.clone());
            }
        }
        debug!(channels = self.channels.len(), "propagating terminal signal");
        for entry in &self.channels {
            let _ = entry.value().send(signal.clone());
        }
    }

    fn send_to(&self, type_id: TypeId, signal: impl FnOnce() -> StreamSignal) -> bool {
        match self.channels.get(&type_id) {
            Some(sender) => {
                let _ = sender.send(signal());
                true
            },
            None => false,
        }
    }
}

impl std::fmt::Debug for Demultiplexor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demultiplexor")
            .field("open_channels", &self.channels.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A subscription to one type's output channel.
///
/// Yields type-erased [`StreamSignal`]s: events routed here through the
/// base-type fallback keep their concrete type, so downcasting to `T` is
/// expected to fail for them. [`next_event`](EventStream::next_event) /
/// [`blocking_next_event`](EventStream::blocking_next_event) skip those and
/// yield only exact `T` instances.
pub struct EventStream<T> {
    receiver: broadcast::Receiver<StreamSignal>,
    pending_terminal: Option<StreamSignal>,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ReplayEvent> EventStream<T> {
    /// Receive the next signal; `None` once a terminal signal was delivered.
    pub async fn recv(&mut self) -> Option<StreamSignal> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(signal) => Some(self.observe(signal)),
            Err(broadcast::error::TryRecvError::Empty) => {
                if let Some(terminal) = self.pending_terminal.take() {
                    self.finished = true;
                    return Some(terminal);
                }
                match self.receiver.recv().await {
                    Ok(signal) => Some(self.observe(signal)),
                    Err(broadcast::error::RecvError::Closed) => Some(self.closed()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        Some(StreamSignal::Lagged(missed))
                    },
                }
            },
            Err(broadcast::error::TryRecvError::Closed) => Some(self.closed()),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(StreamSignal::Lagged(missed))
            },
        }
    }

    /// Blocking variant of [`recv`](Self::recv), for plain consumer threads.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<StreamSignal> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(signal) => Some(self.observe(signal)),
            Err(broadcast::error::TryRecvError::Empty) => {
                if let Some(terminal) = self.pending_terminal.take() {
                    self.finished = true;
                    return Some(terminal);
                }
                match self.receiver.blocking_recv() {
                    Ok(signal) => Some(self.observe(signal)),
                    Err(broadcast::error::RecvError::Closed) => Some(self.closed()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        Some(StreamSignal::Lagged(missed))
                    },
                }
            },
            Err(broadcast::error::TryRecvError::Closed) => Some(self.closed()),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(StreamSignal::Lagged(missed))
            },
        }
    }

    /// Receive the next event whose exact type is `T`, skipping fallback
    /// deliveries and lag gaps. `None` once the stream terminates.
    pub async fn next_event(&mut self) -> Option<Timestamped<Arc<T>>> {
        loop {
            match self.recv().await? {
                StreamSignal::Event(item) => {
                    if let Some(value) = item.value.downcast::<T>() {
                        return Some(Timestamped::new(value, item.timestamp));
                    }
                },
                StreamSignal::Lagged(_) => {},
                StreamSignal::Completed | StreamSignal::Failed(_) => return None,
            }
        }
    }

    /// Blocking variant of [`next_event`](Self::next_event).
    pub fn blocking_next_event(&mut self) -> Option<Timestamped<Arc<T>>> {
        loop {
            match self.blocking_recv()? {
                StreamSignal::Event(item) => {
                    if let Some(value) = item.value.downcast::<T>() {
                        return Some(Timestamped::new(value, item.timestamp));
                    }
                },
                StreamSignal::Lagged(_) => {},
                StreamSignal::Completed | StreamSignal::Failed(_) => return None,
            }
        }
    }

    fn observe(&mut self, signal: StreamSignal) -> StreamSignal {
        if matches!(signal, StreamSignal::Completed | StreamSignal::Failed(_)) {
            self.finished = true;
        }
        signal
    }

    fn closed(&mut self) -> StreamSignal {
        self.finished = true;
        self.pending_terminal.take().unwrap_or(StreamSignal::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventObject, Timestamp};
    use chrono::{TimeZone, Utc};

    #[derive(Debug, Clone)]
    struct Base(u32);
    impl ReplayEvent for Base {}

    #[derive(Debug, Clone)]
    struct Derived(u32);
    impl ReplayEvent for Derived {
        fn parent_type(&self) -> Option<TypeId> {
            Some(TypeId::of::<Base>())
        }
    }

    #[derive(Debug, Clone)]
    struct Grandchild;
    impl ReplayEvent for Grandchild {
        fn parent_type(&self) -> Option<TypeId> {
            Some(TypeId::of::<Derived>())
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(event: impl ReplayEvent, secs: i64) -> ReplayItem {
        Timestamped::new(EventObject::new(event), ts(secs))
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let demux = Demultiplexor::new(64);

        // A channel must already exist for these to be retained anywhere at
        // all; without a subscriber they vanish.
        for i in 0..3 {
            demux.publish(&item(Base(i), i64::from(i)));
        }
        assert_eq!(demux.stats().unrouted(), 3);

        let mut stream = demux.subscribe::<Base>();
        demux.publish(&item(Base(10), 10));
        demux.publish(&item(Base(11), 11));
        demux.complete();

        assert_eq!(stream.next_event().await.unwrap().value.0, 10);
        assert_eq!(stream.next_event().await.unwrap().value.0, 11);
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn base_channel_sees_exact_and_one_level_fallback() {
        let demux = Demultiplexor::new(64);
        let mut stream = demux.subscribe::<Base>();

        demux.publish(&item(Base(1), 1));
        demux.publish(&item(Derived(2), 2));
        demux.publish(&item(Grandchild, 3));
        demux.complete();

        let mut seen = Vec::new();
        while let Some(signal) = stream.recv().await {
            match signal {
                StreamSignal::Event(event) => seen.push(event.value.type_name()),
                StreamSignal::Completed => break,
                other => panic!("unexpected signal: {other:?}"),
            }
        }
        assert_eq!(seen.len(), 2, "grandchild must not reach the base channel");
        assert!(seen[0].ends_with("Base"));
        assert!(seen[1].ends_with("Derived"));
    }

    #[tokio::test]
    async fn typed_iteration_skips_fallback_deliveries() {
        let demux = Demultiplexor::new(64);
        let mut stream = demux.subscribe::<Base>();

        demux.publish(&item(Derived(5), 1));
        demux.publish(&item(Base(6), 2));
        demux.complete();

        assert_eq!(stream.next_event().await.unwrap().value.0, 6);
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn failure_reaches_every_open_channel() {
        let demux = Demultiplexor::new(64);
        let mut base = demux.subscribe::<Base>();
        let mut derived = demux.subscribe::<Derived>();

        demux.fail(Arc::new(Error::source("a", "cable cut")));

        assert!(matches!(base.recv().await, Some(StreamSignal::Failed(_))));
        assert!(matches!(derived.recv().await, Some(StreamSignal::Failed(_))));
        assert!(base.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribing_after_termination_yields_the_terminal_signal() {
        let demux = Demultiplexor::new(64);
        demux.complete();

        let mut stream = demux.subscribe::<Base>();
        assert!(matches!(stream.recv().await, Some(StreamSignal::Completed)));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let demux = Demultiplexor::new(64);
        let mut first = demux.subscribe::<Base>();
        let mut second = demux.subscribe::<Base>();

        demux.publish(&item(Base(42), 1));
        demux.complete();

        assert_eq!(first.next_event().await.unwrap().value.0, 42);
        assert_eq!(second.next_event().await.unwrap().value.0, 42);
    }
}
