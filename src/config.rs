//! Playback configuration.

use crate::envelope::DEFAULT_RECORD_CAPACITY;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Tuning knobs for a [`Playback`](crate::playback::Playback) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Per-input queue capacity between a producer and the pump.
    ///
    /// `None` leaves the queue unbounded, so a fast producer can grow the
    /// queue without limit; `Some(n)` makes producers block once `n` items
    /// are in flight.
    pub queue_capacity: Option<usize>,

    /// Ring capacity of each per-type subscriber channel. A subscriber that
    /// falls more than this many signals behind observes a lag gap.
    pub channel_capacity: usize,

    /// Maximum payload size of one physical record on the envelope channels.
    pub record_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            channel_capacity: 1024,
            record_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }
}

impl PlaybackConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns a configuration error when any capacity is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == Some(0) {
            return Err(Error::configuration("queue_capacity must be at least 1 when bounded"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::configuration("channel_capacity must be at least 1"));
        }
        if self.record_capacity < 64 {
            return Err(Error::configuration(format!(
                "record_capacity of {} cannot hold any record overhead",
                self.record_capacity
            )));
        }
        Ok(())
    }

    /// Parse a configuration from TOML text and validate it.
    ///
    /// # Errors
    /// Returns a configuration error for unparseable text or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    /// Returns a resource error when the file cannot be read, or a
    /// configuration error when its contents are invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::resource(format!("cannot read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded playback configuration");
        Self::from_toml_str(&text)
    }
}
