//! Command rejection model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used by processing logic that may refuse a command.
pub type RejectionResult<T> = Result<T, Rejection>;

/// Category of a command rejection.
///
/// Rejections are expected, data-driven outcomes. They are written to the log as
/// `COMMAND_REJECTION` records and surfaced back to the requester; they are never
/// retried by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    /// The command carried a malformed or out-of-range value.
    InvalidArgument,

    /// The entity referenced by the command does not exist (or no longer accepts commands).
    NotFound,

    /// The entity the command wants to create already exists.
    AlreadyExists,

    /// The entity exists but is in a state that does not allow the command.
    InvalidState,

    /// The processor failed unexpectedly while handling the command.
    ProcessingError,

    /// The follow-up records of the command would not fit into one batch.
    ExceededBatchRecordSize,
}

impl RejectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionType::InvalidArgument => "INVALID_ARGUMENT",
            RejectionType::NotFound => "NOT_FOUND",
            RejectionType::AlreadyExists => "ALREADY_EXISTS",
            RejectionType::InvalidState => "INVALID_STATE",
            RejectionType::ProcessingError => "PROCESSING_ERROR",
            RejectionType::ExceededBatchRecordSize => "EXCEEDED_BATCH_RECORD_SIZE",
        }
    }
}

impl core::fmt::Display for RejectionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refusal of the current command, with a human-readable reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{rejection_type}: {reason}")]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

impl Rejection {
    pub fn new(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            rejection_type,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidArgument, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::NotFound, reason)
    }

    pub fn already_exists(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::AlreadyExists, reason)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidState, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_display_includes_type_and_reason() {
        let rejection = Rejection::not_found("job 42 does not exist");
        assert_eq!(rejection.to_string(), "NOT_FOUND: job 42 does not exist");
    }

    #[test]
    fn rejection_type_serializes_in_protocol_casing() {
        let json = serde_json::to_string(&RejectionType::ExceededBatchRecordSize).unwrap();
        assert_eq!(json, "\"EXCEEDED_BATCH_RECORD_SIZE\"");
    }
}
