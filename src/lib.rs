//! # Chronomux
//!
//! Correlation/replay engine for heterogeneous, timestamped event streams.
//!
//! Chronomux ingests records from multiple independently-paced sources,
//! reconstructs logical events that were fragmented to fit size-capped
//! physical records, deserializes them into typed objects only on demand,
//! merges everything into one globally time-ordered sequence, and fans it out
//! to per-type subscribers, driven by a virtual clock tied to event
//! timestamps rather than wall time.
//!
//! ## Pipeline
//!
//! ```text
//! Raw Source → Envelope Codec → Deserializer → Input Queue ─┐
//! Raw Source → Envelope Codec → Deserializer → Input Queue ─┼→ Merge → Virtual Clock → Demux → subscribers
//! Raw Source ─────────────────→ Deserializer → Input Queue ─┘
//! ```
//!
//! One producer thread per input pushes into its queue; exactly one pump
//! thread pulls the k-way merge, advances the virtual clock, and routes each
//! event to its type's broadcast channel. The single-consumer design keeps
//! the merge, scheduler, and demux stages lock-free with respect to each
//! other.
//!
//! ## Quick Start
//!
//! ```rust
//! use chronomux::prelude::*;
//! use chronomux::{IdentityTypeMap, VecSource};
//! use chrono::{TimeZone, Utc};
//!
//! #[derive(Debug, Clone)]
//! struct Tick(u64);
//! impl ReplayEvent for Tick {}
//! impl SubscribableEvent for Tick {
//!     fn registration() -> EventRegistration {
//!         EventRegistration::passthrough::<Self>()
//!     }
//! }
//!
//! fn main() -> chronomux::Result<()> {
//!     let ticks = vec![
//!         Timestamped::new(Tick(1), Utc.timestamp_opt(10, 0).unwrap()),
//!         Timestamped::new(Tick(2), Utc.timestamp_opt(20, 0).unwrap()),
//!     ];
//!
//!     let mut playback = Playback::new(PlaybackConfig::default())?;
//!     playback.add_input(
//!         VecSource::new("memory", ticks),
//!         CompositeDeserializer::new().with_map(IdentityTypeMap::<Tick>::new()),
//!     )?;
//!     let mut stream = playback.observe::<Tick>()?;
//!
//!     playback.run()?;
//!     while let Some(tick) = stream.blocking_next_event() {
//!         println!("{} at {}", tick.value.0, tick.timestamp);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: chunked binary envelope protocol (fragment/reassemble)
//! - [`deserialize`]: type-keyed, on-demand deserialization
//! - [`merge`]: k-way pull merge of sorted sequences
//! - [`scheduler`]: virtual time driven by observed events
//! - [`demux`]: per-type broadcast fan-out
//! - [`playback`]: orchestrator, input streams, and the pump
//! - [`config`]: playback configuration

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod demux;
pub mod deserialize;
pub mod envelope;
pub mod error;
pub mod merge;
pub mod playback;
pub mod prelude;
pub mod scheduler;
pub mod types;

// Core re-exports for convenience.
pub use crate::{
    config::PlaybackConfig,
    demux::{Demultiplexor, EventStream, StreamSignal},
    deserialize::{
        CompositeDeserializer, EnvelopeEvent, EventRegistration, IdentityTypeMap,
        PartitionedTypeMap, RootTypeMap, SubscribableEvent, TypeKey,
    },
    envelope::{Envelope, EnvelopeReader, EnvelopeWriter},
    error::{Error, Result},
    merge::PullMerge,
    playback::{EnvelopeSource, Playback, RawSource, VecSource},
    scheduler::VirtualScheduler,
    types::{EventObject, RawRecord, ReplayEvent, ReplayItem, SourceId, Timestamp, Timestamped},
};
