//! Model error types.

use thiserror::Error;

/// Errors raised while compiling or validating a chart definition.
///
/// All of these are detected eagerly at load time, before an instance of
/// the chart ever runs.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid chart definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("duplicate state id: '{id}'")]
    DuplicateState { id: String },

    #[error("unknown state: '{id}' (referenced by {referenced_by})")]
    UnknownState { id: String, referenced_by: String },

    #[error("invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Returns a stable error code suitable for host-facing responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ModelError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            ModelError::DuplicateState { .. } => "INVALID_DEFINITION",
            ModelError::UnknownState { .. } => "UNKNOWN_STATE",
            ModelError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            ModelError::InvalidLocation { .. } => "INVALID_EXPRESSION",
            ModelError::Json(_) => "BAD_REQUEST",
        }
    }

    pub(crate) fn definition(reason: impl Into<String>) -> Self {
        ModelError::InvalidDefinition {
            reason: reason.into(),
        }
    }
}

/// Errors raised while evaluating an expression against a data context.
///
/// Evaluation failures are soft: the interpreter converts them to internal
/// `error.execution` events instead of aborting the running instance.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("type error: {reason}")]
    Type { reason: String },

    #[error("cannot assign to '{location}': {reason}")]
    Assign { location: String, reason: String },

    #[error("native expression failed: {reason}")]
    Native { reason: String },
}

impl EvalError {
    pub fn type_error(reason: impl Into<String>) -> Self {
        EvalError::Type {
            reason: reason.into(),
        }
    }
}
