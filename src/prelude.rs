//! Common imports for working with chronomux.
//!
//! ```rust
//! use chronomux::prelude::*;
//! ```

pub use crate::config::PlaybackConfig;
pub use crate::demux::{EventStream, StreamSignal};
pub use crate::deserialize::{
    CompositeDeserializer, EnvelopeEvent, EventRegistration, SubscribableEvent, TypeKey,
};
pub use crate::envelope::Envelope;
pub use crate::error::{Error, Result};
pub use crate::playback::{Playback, RawSource};
pub use crate::scheduler::VirtualScheduler;
pub use crate::types::{ReplayEvent, Timestamp, Timestamped};
