//! Error types for the mirror cache.
//!
//! Two families live here. [`MirrorError`] covers failures returned directly
//! from API calls (unknown endpoints, malformed arguments, invalid session
//! transitions). [`FetchError`] describes a failed remote request; it is stored
//! on cache entries and handed to every joiner of a de-duplicated fetch, so it
//! has to be cheap to clone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelledError;
use crate::session::SessionPhase;

/// Main error type for the mirror cache.
#[derive(Debug, Error)]
pub enum MirrorError {
    // Registration / call-site errors
    #[error("Unknown endpoint: {name}")]
    UnknownEndpoint { name: String },

    #[error("Endpoint registered twice: {name}")]
    DuplicateEndpoint { name: String },

    #[error("Invalid arguments for {endpoint}: {message}")]
    InvalidArguments { endpoint: String, message: String },

    #[error("Endpoint {name} is a {actual}, expected a {expected}")]
    WrongEndpointKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    // Session errors
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("Session unavailable (phase: {phase})")]
    SessionUnavailable { phase: SessionPhase },

    // Runtime errors
    #[error("No async runtime available: {message}")]
    NoRuntime { message: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for mirror cache operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MirrorError {
    /// Whether this error is a programming mistake rather than a runtime condition.
    ///
    /// Callers are expected to fix these at the call site instead of retrying.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            MirrorError::UnknownEndpoint { .. }
                | MirrorError::DuplicateEndpoint { .. }
                | MirrorError::InvalidArguments { .. }
                | MirrorError::WrongEndpointKind { .. }
                | MirrorError::InvalidTransition { .. }
        )
    }
}

/// Classification of a failed remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Connection refused, DNS failure, reset, ...
    Network,
    /// The transport gave up waiting.
    Timeout,
    /// The server answered with a non-success status.
    Status,
    /// The response body could not be decoded.
    Decode,
    /// The endpoint requires a session and none is available.
    Unauthenticated,
    /// The result arrived after its key was torn down.
    Cancelled,
}

/// A failed remote request, as stored on a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?} error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    /// HTTP status code, when the server produced one.
    pub status: Option<u16>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Decode, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Unauthenticated, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Cancelled, message)
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Status,
            message: message.into(),
            status: Some(code),
        }
    }

    /// Whether a manual retry has a reasonable chance of succeeding.
    ///
    /// This layer never retries on its own; the flag only drives whether a
    /// view offers a retry affordance.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FetchErrorKind::Network | FetchErrorKind::Timeout => true,
            FetchErrorKind::Status => matches!(self.status, Some(408 | 429 | 500..=599)),
            FetchErrorKind::Decode
            | FetchErrorKind::Unauthenticated
            | FetchErrorKind::Cancelled => false,
        }
    }
}

impl From<CancelledError> for FetchError {
    fn from(err: CancelledError) -> Self {
        Self::cancelled(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MirrorError::UnknownEndpoint {
            name: "messages".into(),
        };
        assert_eq!(err.to_string(), "Unknown endpoint: messages");
    }

    #[test]
    fn test_programmer_errors() {
        assert!(MirrorError::DuplicateEndpoint { name: "x".into() }.is_programmer_error());
        assert!(!MirrorError::Fetch(FetchError::network("down")).is_programmer_error());
        assert!(!MirrorError::SessionUnavailable {
            phase: SessionPhase::Unauthenticated
        }
        .is_programmer_error());
    }

    #[test]
    fn test_retryable_fetch_errors() {
        assert!(FetchError::timeout("slow").is_retryable());
        assert!(FetchError::status(503, "unavailable").is_retryable());
        assert!(!FetchError::status(404, "missing").is_retryable());
        assert!(!FetchError::unauthenticated("signed out").is_retryable());
        assert!(!FetchError::from(CancelledError).is_retryable());
    }

    #[test]
    fn test_fetch_error_serializes() {
        let err = FetchError::status(500, "boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["status"], 500);
        assert_eq!(json["message"], "boom");
    }
}
