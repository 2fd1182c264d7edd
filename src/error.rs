//! Error types for the replay engine.

use thiserror::Error;

/// Main error type for playback operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid configuration or misuse of the control surface.
    #[error("Configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration.
        message: String,
    },

    /// Envelope encoding failure. Decode-side shape errors are absorbed by the
    /// reader and never surface here.
    #[error(transparent)]
    Codec(#[from] crate::envelope::CodecError),

    /// A payload did not match its declared schema.
    #[error("Deserialize error for {type_name}: {message}")]
    Deserialize {
        /// Output type whose transform failed.
        type_name: &'static str,
        /// Failure detail.
        message: String,
    },

    /// A producer-side fault; fatal to the playback instance.
    #[error("Source '{source_name}' failed: {message}")]
    Source {
        /// Name of the failing input.
        source_name: String,
        /// Failure detail.
        message: String,
    },

    /// A resource needed at subscribe/start time is unavailable.
    #[error("Resource error: {message}")]
    Resource {
        /// Failure detail.
        message: String,
    },

    /// Operation attempted on a disposed playback.
    #[error("Playback has been disposed")]
    Disposed,

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal {
        /// Failure detail.
        message: String,
    },
}

impl Error {
    /// Create a configuration error with a message.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a source error with a message.
    #[must_use]
    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source { source_name: source_name.into(), message: message.into() }
    }

    /// Create a resource error with a message.
    #[must_use]
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource { message: message.into() }
    }

    /// Check whether this error is fatal to the playback instance.
    ///
    /// Data-shape errors are absorbed where they occur; everything that reaches
    /// a caller through this type terminates the run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Deserialize { .. })
    }
}

/// Result type alias for playback operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_context() {
        let err = Error::source("trace-a", "session dropped");
        assert_eq!(err.to_string(), "Source 'trace-a' failed: session dropped");
    }

    #[test]
    fn deserialize_errors_are_not_fatal() {
        let err = Error::Deserialize { type_name: "OrderPlaced", message: "truncated".into() };
        assert!(!err.is_fatal());
        assert!(Error::Disposed.is_fatal());
        assert!(Error::configuration("no inputs").is_fatal());
    }
}
