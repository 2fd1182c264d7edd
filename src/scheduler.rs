//! Virtual time scheduling driven by observed event timestamps.
//!
//! The clock starts `Uninitialized`; the first observed event timestamp
//! anchors it and transitions it to `Running`. From then on
//! [`advance_to`](VirtualScheduler::advance_to) moves "now" monotonically
//! forward and fires every queued callback whose virtual due time has been
//! reached. Delivery is observation-driven, never wall-clock-driven: a
//! callback scheduled for virtual time `T` runs only once an observed event
//! has advanced the clock to `T` or beyond, so its real-time latency is
//! decoupled from its nominal virtual delay.
//!
//! Work scheduled before the anchor is established is queued as *postponed*
//! and re-anchored relative to the start time once the clock is running.

use crate::types::Timestamp;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

struct DueEntry {
    due: Timestamp,
    seq: u64,
    callback: Callback,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties in due time fire in submission order.
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

enum PostponedTime {
    After(Duration),
    At(Timestamp),
}

struct PostponedEntry {
    when: PostponedTime,
    callback: Callback,
}

#[derive(Default)]
struct ClockInner {
    anchor: Option<Timestamp>,
    now: Option<Timestamp>,
    seq: u64,
    due: BinaryHeap<Reverse<DueEntry>>,
    postponed: Vec<PostponedEntry>,
}

impl ClockInner {
    fn push_due(&mut self, due: Timestamp, callback: Callback) {
        let seq = self.seq;
        self.seq += 1;
        self.due.push(Reverse(DueEntry { due, seq, callback }));
    }
}

/// A clock whose "now" advances only as merged events are observed.
///
/// Handles are cheap clones sharing one clock; scheduling is safe from any
/// thread while the pump advances.
#[derive(Clone)]
pub struct VirtualScheduler {
    inner: Arc<Mutex<ClockInner>>,
}

impl VirtualScheduler {
    /// Create an uninitialized scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(ClockInner::default())) }
    }

    /// Whether the clock has been anchored by an observed event.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().anchor.is_some()
    }

    /// Current virtual time, once running.
    #[must_use]
    pub fn now(&self) -> Option<Timestamp> {
        self.inner.lock().now
    }

    /// The timestamp that anchored the clock, once running.
    #[must_use]
    pub fn start_time(&self) -> Option<Timestamp> {
        self.inner.lock().anchor
    }

    /// Virtual duration elapsed since the anchor; zero while uninitialized.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.anchor, inner.now) {
            (Some(anchor), Some(now)) => (now - anchor).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Number of callbacks waiting to fire (due plus postponed).
    #[must_use]
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.due.len() + inner.postponed.len()
    }

    /// Schedule a callback a virtual delay from now.
    ///
    /// Before the clock is anchored the delay is interpreted relative to the
    /// start time that the first observed event will establish.
    pub fn schedule_after(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        match inner.now {
            Some(now) => {
                let due = saturating_add(now, delay);
                inner.push_due(due, Box::new(callback));
            },
            None => {
                inner.postponed.push(PostponedEntry {
                    when: PostponedTime::After(delay),
                    callback: Box::new(callback),
                });
            },
        }
    }

    /// Schedule a callback at an absolute virtual time.
    pub fn schedule_at(&self, due: Timestamp, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.now.is_some() {
            inner.push_due(due, Box::new(callback));
        } else {
            inner.postponed.push(PostponedEntry {
                when: PostponedTime::At(due),
                callback: Box::new(callback),
            });
        }
    }

    /// Observe an event timestamp: anchor the clock if needed, move "now"
    /// forward, and fire everything that has come due.
    ///
    /// A timestamp behind the current "now" never rolls the clock back; it
    /// only gives already-due callbacks a chance to fire. Callbacks run on the
    /// calling (pump) thread, outside the clock lock, so they may schedule
    /// further work; anything they make due within the same observation fires
    /// before this call returns.
    pub fn advance_to(&self, timestamp: Timestamp) {
        {
            let mut inner = self.inner.lock();
            if inner.anchor.is_none() {
                inner.anchor = Some(timestamp);
                inner.now = Some(timestamp);
                let postponed = std::mem::take(&mut inner.postponed);
                for entry in postponed {
                    let due = match entry.when {
                        PostponedTime::After(delay) => saturating_add(timestamp, delay),
                        PostponedTime::At(due) => due,
                    };
                    inner.push_due(due, entry.callback);
                }
                debug!(anchor = %timestamp, "virtual clock anchored");
            } else if inner.now.is_none_or(|now| timestamp > now) {
                inner.now = Some(timestamp);
            }
        }
        self.run_due();
    }

    fn run_due(&self) {
        loop {
            let callback = {
                let mut inner = self.inner.lock();
                let Some(now) = inner.now else { return };
                let ready = inner.due.peek().is_some_and(|Reverse(entry)| entry.due <= now);
                if ready {
                    inner.due.pop().map(|Reverse(entry)| entry.callback)
                } else {
                    None
                }
            };
            match callback {
                Some(callback) => callback(),
                None => break,
            }
        }
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VirtualScheduler")
            .field("anchor", &inner.anchor)
            .field("now", &inner.now)
            .field("due", &inner.due.len())
            .field("postponed", &inner.postponed.len())
            .finish()
    }
}

fn saturating_add(timestamp: Timestamp, delay: Duration) -> Timestamp {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| timestamp.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
