use thiserror::Error;

use logflow_core::RejectionType;
use logflow_protocol::{Intent, LoggedRecord, ValueType};

use crate::appliers::ApplyError;
use crate::writers::{WriteError, Writers};

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("{intent} expects a {expected} value")]
    UnexpectedValue { intent: Intent, expected: ValueType },

    #[error("no command handling for intent {0}")]
    UnsupportedIntent(Intent),

    #[error("command produced no follow-up record")]
    NoFollowUp,

    #[error("{0}")]
    Failed(String),
}

impl ProcessingError {
    /// Applier failures mean state can no longer be trusted; the partition must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessingError::Write(WriteError::Apply(_)))
    }

    pub fn rejection_type(&self) -> RejectionType {
        match self {
            ProcessingError::Write(WriteError::ExceededBatchRecordSize { .. }) => {
                RejectionType::ExceededBatchRecordSize
            }
            _ => RejectionType::ProcessingError,
        }
    }
}

impl From<ApplyError> for ProcessingError {
    fn from(value: ApplyError) -> Self {
        ProcessingError::Write(WriteError::Apply(value))
    }
}

/// Turns commands of one value type into follow-up records.
///
/// Implementations must be deterministic: the outcome may depend only on the command
/// (including its timestamp) and the processing state. Data-driven failures are written as
/// rejections; an `Err` means the processor itself could not complete.
pub trait RecordProcessor: Send {
    fn value_type(&self) -> ValueType;

    fn process(
        &mut self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError>;

    /// Runs after a failed attempt was rolled back, in a fresh attempt.
    ///
    /// The default rejects the command so the requester always gets an answer.
    fn on_error(
        &mut self,
        command: &LoggedRecord,
        error: &ProcessingError,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let rejection_type = error.rejection_type();
        let reason = format!(
            "Expected to process {} command at position {}, but failed: {error}",
            command.intent(),
            command.position()
        );
        writers
            .rejection()
            .append_rejection(command, rejection_type, &reason)?;
        writers
            .response()
            .write_rejection_on_command(command, rejection_type, &reason);
        Ok(())
    }
}
