//! Interpreter error types.
//!
//! Only structural problems surface as [`CoreError`]: action and expression
//! failures during a macrostep become internal `error.execution` or
//! `error.communication` messages and never abort the run.

use rscharts_model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("chart not found: '{name}'")]
    ChartNotFound { name: String },

    #[error("chart '{name}' already registered with a different definition")]
    ChartAlreadyRegistered { name: String },

    #[error("chart checksum mismatch: snapshot has {snapshot:#010x}, chart has {chart:#010x}")]
    ChecksumMismatch { snapshot: u32, chart: u32 },

    #[error("illegal configuration: {reason}")]
    IllegalConfiguration { reason: String },

    #[error("conflicting transitions: {details}")]
    ConflictingTransitions { details: String },

    #[error("macrostep exceeded {limit} microsteps")]
    MicrostepLimit { limit: usize },

    #[error("interpreter is {status} and cannot accept {operation}")]
    InvalidStatus {
        status: &'static str,
        operation: &'static str,
    },

    #[error("event queue closed")]
    QueueClosed,

    #[error("snapshot is corrupt: {reason}")]
    CorruptSnapshot { reason: String },

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable machine-readable code for host-facing classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ChartNotFound { .. } => "CHART_NOT_FOUND",
            CoreError::ChartAlreadyRegistered { .. } => "CHART_ALREADY_REGISTERED",
            CoreError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            CoreError::IllegalConfiguration { .. } => "ILLEGAL_CONFIGURATION",
            CoreError::ConflictingTransitions { .. } => "CONFLICTING_TRANSITIONS",
            CoreError::MicrostepLimit { .. } => "MICROSTEP_LIMIT",
            CoreError::InvalidStatus { .. } => "INVALID_STATUS",
            CoreError::QueueClosed => "QUEUE_CLOSED",
            CoreError::CorruptSnapshot { .. } => "CORRUPT_SNAPSHOT",
            CoreError::Model(e) => e.error_code(),
            CoreError::Json(_) => "INTERNAL_ERROR",
            CoreError::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn illegal_configuration(reason: impl Into<String>) -> Self {
        CoreError::IllegalConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_snapshot(reason: impl Into<String>) -> Self {
        CoreError::CorruptSnapshot {
            reason: reason.into(),
        }
    }
}

/// Failure of an external service call.
///
/// Service errors are soft: the interpreter turns them into internal
/// `error.communication` messages, except [`ServiceError::Cancelled`] which
/// aborts the in-flight call without raising anything.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("no service registered for '{service}'")]
    NotFound { service: String },

    #[error("service call failed: {reason}")]
    Failed { reason: String },

    #[error("service call cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ServiceError::Failed {
            reason: reason.into(),
        }
    }
}
