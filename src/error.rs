//! # Error Types Module
//!
//! Centralized error handling for the rawdata container.
//! Provides error types for each concern with context and error chaining.
//!
//! ## Error Types
//! - `RawDataError`: dataset, channel and persistence failures
//! - `EventError`: rejected annotation events
//! - `RegistryError`: channel catalog misconfiguration (fatal at startup)
//! - `ConfigError`: settings file I/O and parsing errors
//!
//! ## Usage Examples
//! ```rust,ignore
//! // Dataset operations surface RawDataError
//! pub fn save(&mut self, meta_only: bool) -> Result<(), RawDataError> { ... }
//!
//! // Settings use ConfigError
//! pub fn load() -> Result<Config, ConfigError> { ... }
//! ```
//!
//! ## Reporting Policy
//! Cast and missing-channel errors are logged and dropped at the sample level
//! (`Dataset::add` returns `false`). Path, analyse and corruption errors are
//! returned to the caller. Registry errors abort the process.

use crate::registry::Cast;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by datasets, channels and the on-disk layout
#[derive(Debug, Error)]
pub enum RawDataError {
    /// Operation needs a dataset directory and none is configured
    #[error("no dataset directory configured")]
    NoPath,
    /// `save` was called before `analyse`
    #[error("dataset must be analysed before it can be saved")]
    NotAnalysed,
    /// Sample value does not match the channel's declared type
    #[error("channel {identifier}: cannot cast {value} to {expected}")]
    Cast {
        identifier: String,
        expected: Cast,
        value: String,
    },
    /// Decompression or validation failed after all retries
    #[error("corrupt blob {}: {reason}", path.display())]
    CorruptBlob { path: PathBuf, reason: String },
    /// Operation requires a channel that is not present
    #[error("channel {0} is required but not present")]
    MissingChannel(String),
    /// Identifier is not part of the channel registry
    #[error("unknown channel identifier: {0}")]
    UnknownChannel(String),
    /// Parallel sequences passed to a bulk operation differ in length
    #[error("length mismatch: time_rec {t_rec}, time_calc {t_calc}, values {values}")]
    LengthMismatch {
        t_rec: usize,
        t_calc: usize,
        values: usize,
    },
    /// A sample time cannot be placed on the wall clock
    #[error("channel {identifier}: t_calc {t_calc} is outside the representable time range")]
    TimeOutOfRange { identifier: String, t_calc: f64 },
    /// A collaborator needed by this operation was never configured
    #[error("{0} collaborator is not configured")]
    CollaboratorUnavailable(&'static str),
    /// A collaborator reported a failure
    #[error("collaborator failed: {0}")]
    Collaborator(String),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reasons an annotation event is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
    /// Dataset identity carries no session start to measure offsets from
    #[error("dataset has no session start; cannot place event")]
    NoSessionStart,
    /// Another event already starts at this instant
    #[error("an event starting at {0} ms already exists")]
    Duplicate(i64),
    /// Event starts before the session or after its end
    #[error("event start {x_start:.3}s lies outside [0, {duration:.3}]s")]
    OutOfRange { x_start: f64, duration: f64 },
    /// No event with this id
    #[error("no event with id {0}")]
    NotFound(u64),
}

/// Channel catalog invariant violations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("channel id {0} is registered twice")]
    DuplicateId(u32),
    #[error("channel ids are not dense: expected {expected}, found {found}")]
    IdGap { expected: u32, found: u32 },
    #[error("display order {0} is used by more than one channel")]
    DuplicateOrder(u32),
    #[error("identifier {0} is registered twice")]
    DuplicateIdentifier(&'static str),
}

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[source] std::io::Error),
    /// Failed to write config file
    #[error("Failed to write config file: {0}")]
    WriteFailed(#[source] std::io::Error),
    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[source] toml::de::Error),
    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_error_display() {
        let err = RawDataError::Cast {
            identifier: "heart_rate".to_string(),
            expected: Cast::Int,
            value: "\"nan\"".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("heart_rate"));
        assert!(msg.contains("int"));
    }

    #[test]
    fn test_corrupt_blob_mentions_path() {
        let err = RawDataError::CorruptBlob {
            path: PathBuf::from("/data/s1/ppg_ir.gz"),
            reason: "invalid gzip header".to_string(),
        };
        assert!(err.to_string().contains("ppg_ir.gz"));
    }

    #[test]
    fn test_config_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_event_error_wraps() {
        let err: RawDataError = EventError::NotFound(7).into();
        assert!(matches!(err, RawDataError::Event(EventError::NotFound(7))));
    }
}
