//! Error types.
//!
//! Nothing in here is fatal to frame processing: verification errors are
//! cached as unresolved results and retried later, malformed observations are
//! dropped and counted. Only configuration loading surfaces errors to callers.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single external verification call.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),

    #[error("verification transport error: {0}")]
    Transport(String),

    #[error("verification service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode verification response: {0}")]
    Decode(String),

    #[error("verification backend error: {0}")]
    Backend(String),
}

impl VerificationError {
    /// Classify a client error; `timeout` is the limit the client was built with.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            VerificationError::Timeout(timeout)
        } else if err.is_decode() {
            VerificationError::Decode(err.to_string())
        } else {
            VerificationError::Transport(err.to_string())
        }
    }
}

/// Reason an observation from the tracker feed was rejected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ObservationError {
    #[error("observation has no track id")]
    MissingTrackId,

    #[error("bounding box has non-finite coordinates")]
    NonFiniteBox,

    #[error("bounding box has no area ({width}x{height})")]
    EmptyBox { width: f32, height: f32 },
}

/// Invalid or unreadable engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
