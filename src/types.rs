//! Common types used throughout the replay engine.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Timestamp type for event ordering and virtual-time progression.
pub type Timestamp = DateTime<Utc>;

/// Identifier of the provider that produced a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    /// Create a new source identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for SourceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A value paired with the timestamp at which it logically occurred.
///
/// This is the unit that flows through the merge engine, the virtual-time
/// scheduler, and the demultiplexor. Instances are immutable; transformations
/// produce new values via [`Timestamped::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    /// The carried value.
    pub value: T,
    /// Logical occurrence time of the value.
    pub timestamp: Timestamp,
}

impl<T> Timestamped<T> {
    /// Pair a value with its occurrence time.
    pub const fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }

    /// Transform the carried value, preserving the timestamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timestamped<U> {
        Timestamped { value: f(self.value), timestamp: self.timestamp }
    }

    /// Borrow the carried value with the same timestamp.
    pub const fn as_ref(&self) -> Timestamped<&T> {
        Timestamped { value: &self.value, timestamp: self.timestamp }
    }
}

/// A raw record as delivered by an external source.
///
/// Sources are only required to expose this abstract shape; everything else
/// about their transport (session readers, files, network feeds) stays behind
/// the [`RawSource`](crate::playback::RawSource) seam.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Time at which the record was produced.
    pub timestamp: Timestamp,
    /// Provider that produced the record.
    pub source_id: SourceId,
    /// Numeric sub-type identifier assigned by the provider.
    pub kind: u32,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Optional correlation identifier linking related records.
    pub correlation_id: Option<Uuid>,
}

/// Trait implemented by every typed event that can flow through playback.
///
/// The optional [`parent_type`](ReplayEvent::parent_type) discriminant declares
/// a single base type for demultiplexing purposes: an event is delivered to its
/// exact type's channel and, when registered, to its declared parent's channel.
/// The fallback is one level only; there is no transitive walk.
pub trait ReplayEvent: Send + Sync + 'static {
    /// The single declared base type of this event, if any.
    fn parent_type(&self) -> Option<TypeId> {
        None
    }
}

/// A type-erased, shareable replay event.
///
/// Captures the concrete type identity and the one-level parent discriminant at
/// erasure time so the demultiplexor can route without downcasting.
#[derive(Clone)]
pub struct EventObject {
    type_id: TypeId,
    type_name: &'static str,
    parent: Option<TypeId>,
    value: Arc<dyn Any + Send + Sync>,
}

impl EventObject {
    /// Erase a typed event.
    pub fn new<T: ReplayEvent>(value: T) -> Self {
        let parent = value.parent_type();
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            parent,
            value: Arc::new(value),
        }
    }

    /// The [`TypeId`] of the erased concrete type.
    #[must_use]
    pub const fn event_type(&self) -> TypeId {
        self.type_id
    }

    /// The declared single base type, if any.
    #[must_use]
    pub const fn parent_type(&self) -> Option<TypeId> {
        self.parent
    }

    /// Human-readable name of the erased concrete type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check whether the erased value is of type `T`.
    #[must_use]
    pub fn is<T: ReplayEvent>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Downcast to a shared handle of the concrete type.
    ///
    /// Returns `None` when the erased value is not a `T`, which is the normal
    /// outcome for events delivered through a parent-type channel.
    #[must_use]
    pub fn downcast<T: ReplayEvent>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for EventObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventObject")
            .field("type_name", &self.type_name)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// The merged, type-erased unit delivered to subscribers.
pub type ReplayItem = Timestamped<EventObject>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);
    impl ReplayEvent for Ping {}

    #[derive(Debug)]
    struct Pong;
    impl ReplayEvent for Pong {
        fn parent_type(&self) -> Option<TypeId> {
            Some(TypeId::of::<Ping>())
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn timestamped_map_preserves_timestamp() {
        let item = Timestamped::new(21u32, ts(5));
        let doubled = item.map(|v| v * 2);
        assert_eq!(doubled.value, 42);
        assert_eq!(doubled.timestamp, ts(5));
    }

    #[test]
    fn event_object_round_trips_through_erasure() {
        let obj = EventObject::new(Ping(7));
        assert!(obj.is::<Ping>());
        assert!(!obj.is::<Pong>());
        assert_eq!(*obj.downcast::<Ping>().unwrap(), Ping(7));
        assert!(obj.downcast::<Pong>().is_none());
    }

    #[test]
    fn event_object_captures_parent_discriminant() {
        let ping = EventObject::new(Ping(1));
        assert_eq!(ping.parent_type(), None);

        let pong = EventObject::new(Pong);
        assert_eq!(pong.parent_type(), Some(TypeId::of::<Ping>()));
        assert_eq!(pong.event_type(), TypeId::of::<Pong>());
    }

    #[test]
    fn source_id_display_and_from() {
        let id = SourceId::from("trace-session-0");
        assert_eq!(id.as_str(), "trace-session-0");
        assert_eq!(id.to_string(), "trace-session-0");
    }
}
