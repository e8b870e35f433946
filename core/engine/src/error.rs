//! Error types for proctor-engine operations.

use proctor_daemon_protocol::ErrorInfo;
use std::path::PathBuf;

/// All errors that can surface from the engine.
///
/// Only `DetectorUnavailable`, `SessionStateViolation` and `Config` ever reach
/// a caller of the lifecycle API. The transient variants are constructed and
/// logged where they are recovered.
#[derive(Debug, thiserror::Error)]
pub enum ProctorError {
    // ═════════════════════════════════════════════════════════════════════
    // Sensor Errors
    // ═════════════════════════════════════════════════════════════════════
    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("Detector {detector} failed: {details}")]
    DetectorTransientFailure {
        detector: &'static str,
        details: String,
    },

    #[error("Evidence capture failed: {0}")]
    EvidenceCaptureFailure(String),

    // ═════════════════════════════════════════════════════════════════════
    // Delivery Errors
    // ═════════════════════════════════════════════════════════════════════
    #[error("Delivery to session store failed after {attempts} attempt(s): {source}")]
    DispatchDeliveryFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    // ═════════════════════════════════════════════════════════════════════
    // Lifecycle Errors
    // ═════════════════════════════════════════════════════════════════════
    #[error("Session state violation: {0}")]
    SessionStateViolation(String),

    // ═════════════════════════════════════════════════════════════════════
    // Configuration / I/O
    // ═════════════════════════════════════════════════════════════════════
    #[error("Configuration file malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by a `SessionStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transport-level failure; the request may succeed if retried.
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    /// The store understood the request and refused it. Retrying will not help.
    #[error("session store rejected request: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("session store returned malformed data: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<ErrorInfo> for StoreError {
    fn from(info: ErrorInfo) -> Self {
        if info.is_transient() {
            return StoreError::Unavailable(format!("{}: {}", info.code, info.message));
        }
        StoreError::Rejected {
            code: info.code,
            message: info.message,
        }
    }
}

/// Convenience type alias for Results using ProctorError.
pub type Result<T> = std::result::Result<T, ProctorError>;
