//! Type-keyed, on-demand deserialization.
//!
//! Raw items are routed to concrete output types through *type maps*. A map
//! comes in one of three capability variants:
//!
//! - **identity** ([`IdentityTypeMap`]): the input is itself the one possible
//!   output;
//! - **root** ([`RootTypeMap`]): every input maps to exactly one fixed output
//!   type;
//! - **partitioned** ([`PartitionedTypeMap`]): many possible outputs, keyed by
//!   a comparable [`TypeKey`].
//!
//! Transforms are compiled once per [`TypeKey`] when a consumer declares
//! interest via [`CompositeDeserializer::add_known_type`], and reused for all
//! subsequent items sharing that key. Types nobody declared cost nothing, even
//! when their wire data is present. A declared type whose payload turns out to
//! be corrupt does not abort the stream: the registration's default instance
//! is substituted and a `warn` is logged.

use crate::envelope::Envelope;
use crate::error::Result;
use crate::types::{EventObject, ReplayEvent, Timestamp, Timestamped};
use bytes::Bytes;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key used to route a raw item to an output type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeKey {
    /// A simple schema identifier.
    Schema(String),
    /// A composite key of provider sub-type id and schema version.
    Composite {
        /// Provider-assigned sub-type identifier.
        kind: u32,
        /// Schema version.
        version: u32,
    },
}

impl TypeKey {
    /// Create a schema-id key.
    #[must_use]
    pub fn schema(id: impl Into<String>) -> Self {
        Self::Schema(id.into())
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema(id) => write!(f, "{id}"),
            Self::Composite { kind, version } => write!(f, "{kind}/v{version}"),
        }
    }
}

type PayloadDecoder = Arc<dyn Fn(&Bytes) -> Result<EventObject> + Send + Sync>;
type DefaultFactory = Arc<dyn Fn() -> EventObject + Send + Sync>;

/// A consumer's declaration of interest in one output type.
///
/// Carries everything a type map needs to compile a transform for the type:
/// its identity, its wire key, a payload decoder, and a factory for the
/// default instance substituted when a payload is corrupt.
#[derive(Clone)]
pub struct EventRegistration {
    type_id: TypeId,
    type_name: &'static str,
    key: Option<TypeKey>,
    decode: Option<PayloadDecoder>,
    fallback: Option<DefaultFactory>,
}

impl EventRegistration {
    /// Registration for a type that arrives already constructed (identity and
    /// root maps match on the type alone).
    #[must_use]
    pub fn passthrough<T: ReplayEvent>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            key: None,
            decode: None,
            fallback: None,
        }
    }

    /// Registration for a type decoded from envelope payloads.
    #[must_use]
    pub fn enveloped<T: EnvelopeEvent>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            key: Some(T::type_key()),
            decode: Some(Arc::new(|payload: &Bytes| T::decode(payload).map(EventObject::new))),
            fallback: Some(Arc::new(|| EventObject::new(T::default()))),
        }
    }

    /// The registered type's identity.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The registered type's name, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The registered type's wire key, when it has one.
    #[must_use]
    pub const fn key(&self) -> Option<&TypeKey> {
        self.key.as_ref()
    }
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("type_name", &self.type_name)
            .field("key", &self.key)
            .finish()
    }
}

/// A typed event that can be decoded from an envelope payload.
///
/// `Default` provides the instance substituted when a payload of this type is
/// corrupt.
pub trait EnvelopeEvent: ReplayEvent + Default + Sized {
    /// The wire key under which payloads of this type arrive.
    fn type_key() -> TypeKey;

    /// Decode one payload.
    ///
    /// # Errors
    /// Returns an error when the payload does not match this type's schema.
    fn decode(payload: &Bytes) -> Result<Self>;
}

/// A typed event that can be subscribed to through the playback surface.
pub trait SubscribableEvent: ReplayEvent + Sized {
    /// Build the registration propagated to every configured input.
    fn registration() -> EventRegistration;
}

/// Outcome of offering one raw item to a type map.
#[derive(Debug)]
pub enum TypeMapOutcome {
    /// The map owns the item and produced a typed event.
    Produced(EventObject),
    /// The map owns the item but no consumer declared its output type.
    NotInterested,
    /// The item's key does not belong to this map.
    Unrecognized,
}

/// Object-safe view over the three type-map capability variants.
pub trait TypeMap<R>: Send {
    /// Extract the item's occurrence time; `None` marks an unusable record.
    fn timestamp(&self, raw: &R) -> Option<Timestamp>;

    /// Declare consumer interest in an output type.
    ///
    /// Returns `true` when this map can produce the type, in which case the
    /// transform is compiled and memoized now. A second declaration of the
    /// same type is a no-op.
    fn add_known_type(&mut self, registration: &EventRegistration) -> bool;

    /// Offer one raw item.
    fn deserialize(&mut self, raw: &R) -> TypeMapOutcome;
}

/// Identity variant: the raw item already is the output type.
pub struct IdentityTypeMap<T> {
    declared: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> IdentityTypeMap<T> {
    /// Create an identity map.
    #[must_use]
    pub const fn new() -> Self {
        Self { declared: false, _marker: PhantomData }
    }
}

impl<T> Default for IdentityTypeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ReplayEvent + Clone> TypeMap<Timestamped<T>> for IdentityTypeMap<T> {
    fn timestamp(&self, raw: &Timestamped<T>) -> Option<Timestamp> {
        Some(raw.timestamp)
    }

    fn add_known_type(&mut self, registration: &EventRegistration) -> bool {
        if registration.type_id() == TypeId::of::<T>() {
            self.declared = true;
            true
        } else {
            false
        }
    }

    fn deserialize(&mut self, raw: &Timestamped<T>) -> TypeMapOutcome {
        if self.declared {
            TypeMapOutcome::Produced(EventObject::new(raw.value.clone()))
        } else {
            TypeMapOutcome::NotInterested
        }
    }
}

/// Root variant: every input maps to exactly one fixed output type.
pub struct RootTypeMap<R, T> {
    time_fn: Box<dyn Fn(&R) -> Option<Timestamp> + Send>,
    transform: Box<dyn Fn(&R) -> Result<T> + Send>,
    declared: bool,
    substitutions: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<R, T: ReplayEvent + Default> RootTypeMap<R, T> {
    /// Create a root map from a time function and a transform.
    pub fn new(
        time_fn: impl Fn(&R) -> Option<Timestamp> + Send + 'static,
        transform: impl Fn(&R) -> Result<T> + Send + 'static,
    ) -> Self {
        Self {
            time_fn: Box::new(time_fn),
            transform: Box::new(transform),
            declared: false,
            substitutions: 0,
            _marker: PhantomData,
        }
    }

    /// How many corrupt payloads were replaced with the default instance.
    #[must_use]
    pub const fn substitution_count(&self) -> u64 {
        self.substitutions
    }
}

impl<R: Send, T: ReplayEvent + Default> TypeMap<R> for RootTypeMap<R, T> {
    fn timestamp(&self, raw: &R) -> Option<Timestamp> {
        (self.time_fn)(raw)
    }

    fn add_known_type(&mut self, registration: &EventRegistration) -> bool {
        if registration.type_id() == TypeId::of::<T>() {
            self.declared = true;
            true
        } else {
            false
        }
    }

    fn deserialize(&mut self, raw: &R) -> TypeMapOutcome {
        if !self.declared {
            return TypeMapOutcome::NotInterested;
        }
        match (self.transform)(raw) {
            Ok(value) => TypeMapOutcome::Produced(EventObject::new(value)),
            Err(error) => {
                self.substitutions += 1;
                warn!(
                    type_name = std::any::type_name::<T>(),
                    %error,
                    "substituting default instance for undecodable record"
                );
                TypeMapOutcome::Produced(EventObject::new(T::default()))
            },
        }
    }
}

struct Binding {
    type_name: &'static str,
    decode: PayloadDecoder,
    fallback: DefaultFactory,
}

/// Partitioned variant: many outputs over [`Envelope`] items, keyed by a
/// comparable [`TypeKey`].
pub struct PartitionedTypeMap {
    key_fn: Box<dyn Fn(&Envelope) -> Option<TypeKey> + Send>,
    bindings: HashMap<TypeKey, Binding>,
    substitutions: u64,
}

impl PartitionedTypeMap {
    /// Key envelopes by their schema identifier string.
    #[must_use]
    pub fn by_schema_id() -> Self {
        Self::with_key_fn(|envelope| Some(TypeKey::Schema(envelope.type_id.clone())))
    }

    /// Key envelopes with a custom function; returning `None` declines
    /// ownership of the item.
    pub fn with_key_fn(key_fn: impl Fn(&Envelope) -> Option<TypeKey> + Send + 'static) -> Self {
        Self { key_fn: Box::new(key_fn), bindings: HashMap::new(), substitutions: 0 }
    }

    /// Number of compiled transform bindings.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// How many corrupt payloads were replaced with default instances.
    #[must_use]
    pub const fn substitution_count(&self) -> u64 {
        self.substitutions
    }
}

impl TypeMap<Envelope> for PartitionedTypeMap {
    fn timestamp(&self, raw: &Envelope) -> Option<Timestamp> {
        Some(raw.occurrence_time)
    }

    fn add_known_type(&mut self, registration: &EventRegistration) -> bool {
        let (Some(key), Some(decode), Some(fallback)) =
            (registration.key.clone(), registration.decode.clone(), registration.fallback.clone())
        else {
            return false;
        };
        self.bindings
            .entry(key)
            .or_insert(Binding { type_name: registration.type_name, decode, fallback });
        true
    }

    fn deserialize(&mut self, raw: &Envelope) -> TypeMapOutcome {
        let Some(key) = (self.key_fn)(raw) else {
            return TypeMapOutcome::Unrecognized;
        };
        let Some(binding) = self.bindings.get(&key) else {
            return TypeMapOutcome::NotInterested;
        };
        match (binding.decode)(&raw.payload) {
            Ok(event) => TypeMapOutcome::Produced(event),
            Err(error) => {
                self.substitutions += 1;
                warn!(
                    type_name = binding.type_name,
                    key = %key,
                    %error,
                    "substituting default instance for undecodable payload"
                );
                TypeMapOutcome::Produced((binding.fallback)())
            },
        }
    }
}

/// Several type maps over one raw input shape, tried in registration order.
///
/// A given raw item has exactly one owning map: the first map that recognizes
/// the item's key decides the outcome, whether or not the output type was
/// declared.
pub struct CompositeDeserializer<R> {
    maps: Vec<Box<dyn TypeMap<R>>>,
}

impl<R> CompositeDeserializer<R> {
    /// Create an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self { maps: Vec::new() }
    }

    /// Append a type map (builder form).
    #[must_use]
    pub fn with_map(mut self, map: impl TypeMap<R> + 'static) -> Self {
        self.maps.push(Box::new(map));
        self
    }

    /// Append a type map.
    pub fn push_map(&mut self, map: impl TypeMap<R> + 'static) {
        self.maps.push(Box::new(map));
    }

    /// Number of wrapped maps.
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    /// Propagate a declaration of interest to every wrapped map.
    ///
    /// Returns `true` when at least one map can produce the type.
    pub fn add_known_type(&mut self, registration: &EventRegistration) -> bool {
        let mut claimed = false;
        for map in &mut self.maps {
            claimed |= map.add_known_type(registration);
        }
        claimed
    }

    /// Deserialize one raw item into a timestamped, type-erased event.
    ///
    /// Returns `None` when no map recognizes the item, when its owning map has
    /// no declared interest in the output type, or when the owning map cannot
    /// extract a timestamp.
    pub fn deserialize(&mut self, raw: &R) -> Option<Timestamped<EventObject>> {
        for map in &mut self.maps {
            match map.deserialize(raw) {
                TypeMapOutcome::Produced(event) => {
                    let Some(timestamp) = map.timestamp(raw) else {
                        warn!(
                            type_name = event.type_name(),
                            "dropping event with no extractable timestamp"
                        );
                        return None;
                    };
                    return Some(Timestamped::new(event, timestamp));
                },
                TypeMapOutcome::NotInterested => return None,
                TypeMapOutcome::Unrecognized => {},
            }
        }
        debug!("no type map recognized the record");
        None
    }
}

impl<R> Default for CompositeDeserializer<R> {
    fn default() -> Self {
        Self::new()
    }
}
