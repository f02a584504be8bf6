//! Writers: the only way processing logic touches the log or the state.
//!
//! A processor receives a [`Writers`] facade per command. It exposes four capabilities:
//!
//! - [`CommandWriter`]: append new or follow-up commands
//! - [`RejectionWriter`]: reject the command being processed
//! - [`StateWriter`]: append a follow-up event **and** apply it to state in one call
//! - [`ResponseWriter`]: stage the response to the requester (last write wins)
//!
//! Everything lands in a [`ProcessingResultBuilder`]. Nothing becomes visible until the
//! orchestrator flushes the batch; the staged response and post-commit tasks are released
//! only after that flush succeeded.

use thiserror::Error;
use tracing::debug;

use logflow_core::{Key, RecordKey, Rejection, RejectionType};
use logflow_logstream::{
    BatchError, CodecError, RecordBatchBuilder, encode_metadata, encode_value,
};
use logflow_protocol::{
    Intent, LoggedRecord, RecordMetadata, RecordType, RecordValue, RequestId,
};

use crate::appliers::{ApplyError, EventAppliers};
use crate::state::ProcessingState;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("record of {length} bytes exceeds the remaining batch capacity")]
    ExceededBatchRecordSize { length: usize },

    #[error("contradictory processing result: {0}")]
    Contradiction(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Outcome of a command, delivered to the requester once the batch is durable.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResponse {
    pub request: RequestId,
    pub key: Key,
    pub record_type: RecordType,
    pub intent: Intent,
    pub rejection_type: Option<RejectionType>,
    pub rejection_reason: String,
    pub value: RecordValue,
}

impl ProcessingResponse {
    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

/// Side effect to run after the batch is durable. Never run during reprocessing.
pub type PostCommitTask = Box<dyn FnOnce() + Send>;

/// Accumulated result of one processing attempt.
pub struct ProcessingResultBuilder {
    batch: RecordBatchBuilder,
    response: Option<ProcessingResponse>,
    post_commit_tasks: Vec<PostCommitTask>,
    rejected: bool,
    events: usize,
}

impl ProcessingResultBuilder {
    pub fn new(max_fragment_size: usize) -> Self {
        Self {
            batch: RecordBatchBuilder::new(max_fragment_size),
            response: None,
            post_commit_tasks: Vec::new(),
            rejected: false,
            events: 0,
        }
    }

    pub fn batch(&self) -> &RecordBatchBuilder {
        &self.batch
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub fn response(&self) -> Option<&ProcessingResponse> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<ProcessingResponse> {
        self.response.take()
    }

    pub fn take_post_commit_tasks(&mut self) -> Vec<PostCommitTask> {
        std::mem::take(&mut self.post_commit_tasks)
    }

    /// Drop everything staged so far.
    pub fn reset(&mut self) {
        self.batch.reset();
        self.response = None;
        self.post_commit_tasks.clear();
        self.rejected = false;
        self.events = 0;
    }

    /// Payload bytes a record with this metadata and value occupies.
    pub fn record_length(metadata: &RecordMetadata, value: &RecordValue) -> Result<usize, WriteError> {
        Ok(encode_metadata(metadata)?.len() + encode_value(value)?.len())
    }

    fn append(
        &mut self,
        key: RecordKey,
        metadata: &RecordMetadata,
        value: &RecordValue,
    ) -> Result<(), WriteError> {
        match metadata.record_type() {
            RecordType::CommandRejection if self.rejected => {
                return Err(WriteError::Contradiction("command was already rejected"));
            }
            RecordType::CommandRejection if self.events > 0 => {
                return Err(WriteError::Contradiction("command already produced events"));
            }
            RecordType::Event if self.rejected => {
                return Err(WriteError::Contradiction("command was rejected"));
            }
            RecordType::Event if !metadata.intent().is_event() => {
                return Err(WriteError::Contradiction("event written with a command intent"));
            }
            RecordType::Command if metadata.intent().is_event() => {
                return Err(WriteError::Contradiction("command written with an event intent"));
            }
            _ => {}
        }

        let metadata_bytes = encode_metadata(metadata)?;
        let value_bytes = encode_value(value)?;
        let length = metadata_bytes.len() + value_bytes.len();
        if !self.batch.can_write_additional_event(length) {
            return Err(WriteError::ExceededBatchRecordSize { length });
        }

        self.batch
            .event()
            .key(key)
            .metadata(metadata_bytes)
            .value(value_bytes)
            .done()?;

        match metadata.record_type() {
            RecordType::CommandRejection => self.rejected = true,
            RecordType::Event => self.events += 1,
            RecordType::Command => {}
        }
        Ok(())
    }
}

impl core::fmt::Debug for ProcessingResultBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessingResultBuilder")
            .field("records", &self.batch.len())
            .field("bytes", &self.batch.byte_len())
            .field("response", &self.response)
            .field("post_commit_tasks", &self.post_commit_tasks.len())
            .field("rejected", &self.rejected)
            .finish()
    }
}

/// Facade handed to a processor for one command.
pub struct Writers<'a> {
    state: &'a mut ProcessingState,
    appliers: &'a EventAppliers,
    result: &'a mut ProcessingResultBuilder,
}

impl<'a> Writers<'a> {
    pub fn new(
        state: &'a mut ProcessingState,
        appliers: &'a EventAppliers,
        result: &'a mut ProcessingResultBuilder,
    ) -> Self {
        Self {
            state,
            appliers,
            result,
        }
    }

    pub fn command(&mut self) -> CommandWriter<'_> {
        CommandWriter {
            result: &mut *self.result,
        }
    }

    pub fn rejection(&mut self) -> RejectionWriter<'_> {
        RejectionWriter {
            result: &mut *self.result,
        }
    }

    pub fn state(&mut self) -> StateWriter<'_> {
        StateWriter {
            state: &mut *self.state,
            appliers: self.appliers,
            result: &mut *self.result,
        }
    }

    pub fn response(&mut self) -> ResponseWriter<'_> {
        ResponseWriter {
            result: &mut *self.result,
        }
    }

    /// Read access to state, including events applied earlier in this attempt.
    pub fn processing_state(&self) -> &ProcessingState {
        &*self.state
    }

    pub fn append_post_commit_task(&mut self, task: impl FnOnce() + Send + 'static) {
        self.result.post_commit_tasks.push(Box::new(task));
    }

    /// Reject `command` and tell the requester why.
    pub fn reject(&mut self, command: &LoggedRecord, rejection: &Rejection) -> Result<(), WriteError> {
        debug!(
            position = %command.position(),
            key = %command.key(),
            intent = %command.intent(),
            rejection_type = %rejection.rejection_type,
            reason = %rejection.reason,
            "command rejected"
        );
        self.rejection()
            .append_rejection(command, rejection.rejection_type, &rejection.reason)?;
        self.response()
            .write_rejection_on_command(command, rejection.rejection_type, &rejection.reason);
        Ok(())
    }
}

pub struct CommandWriter<'w> {
    result: &'w mut ProcessingResultBuilder,
}

impl CommandWriter<'_> {
    /// Append a command for a new entity; its key is assigned on flush.
    pub fn append_new_command(
        &mut self,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) -> Result<(), WriteError> {
        self.result.append(
            RecordKey::AutoAssign,
            &RecordMetadata::command(intent),
            &value.into(),
        )
    }

    pub fn append_follow_up_command(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) -> Result<(), WriteError> {
        self.result
            .append(key.into(), &RecordMetadata::command(intent), &value.into())
    }

    pub fn can_write_command_of_length(&self, length: usize) -> bool {
        self.result.batch.can_write_additional_event(length)
    }
}

pub struct RejectionWriter<'w> {
    result: &'w mut ProcessingResultBuilder,
}

impl RejectionWriter<'_> {
    /// Record that `command` is invalid. At most once per command, never next to events.
    ///
    /// A rejection that does not fit next to the command's full value is written with the
    /// payload stripped and the reason cut to [`MAX_TRIMMED_REASON_LEN`] bytes, then with an
    /// empty value. A command accepted at ingress can therefore always be rejected.
    pub fn append_rejection(
        &mut self,
        command: &LoggedRecord,
        rejection_type: RejectionType,
        reason: &str,
    ) -> Result<(), WriteError> {
        let metadata = RecordMetadata::rejection(command.intent(), rejection_type, reason)
            .with_request(command.metadata().request());
        match self
            .result
            .append(command.key().into(), &metadata, command.value())
        {
            Err(WriteError::ExceededBatchRecordSize { length }) => {
                debug!(
                    position = %command.position(),
                    length,
                    "rejection exceeds the batch; writing it without payload"
                );
            }
            other => return other,
        }

        let metadata = RecordMetadata::rejection(
            command.intent(),
            rejection_type,
            truncate_reason(reason, MAX_TRIMMED_REASON_LEN),
        )
        .with_request(command.metadata().request());
        match self.result.append(
            command.key().into(),
            &metadata,
            &command.value().without_payload(),
        ) {
            Err(WriteError::ExceededBatchRecordSize { .. }) => self.result.append(
                command.key().into(),
                &metadata,
                &RecordValue::empty(command.value_type()),
            ),
            other => other,
        }
    }
}

/// Longest reason, in bytes, kept on a rejection written without payload.
pub const MAX_TRIMMED_REASON_LEN: usize = 256;

fn truncate_reason(reason: &str, max_len: usize) -> &str {
    if reason.len() <= max_len {
        return reason;
    }
    let mut end = max_len;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

pub struct StateWriter<'w> {
    state: &'w mut ProcessingState,
    appliers: &'w EventAppliers,
    result: &'w mut ProcessingResultBuilder,
}

impl StateWriter<'_> {
    /// Append an event at the latest applier version and apply it to state.
    pub fn append_follow_up_event(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) -> Result<(), WriteError> {
        let intent = intent.into();
        let version = self
            .appliers
            .latest_version(intent)
            .ok_or(ApplyError::NoApplier { intent, version: 0 })?;
        self.append_follow_up_event_with_version(key, intent, value, version)
    }

    pub fn append_follow_up_event_with_version(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
        version: u16,
    ) -> Result<(), WriteError> {
        let intent = intent.into();
        let value = value.into();
        let metadata = RecordMetadata::event(intent).with_record_version(version);

        self.result.append(key.into(), &metadata, &value)?;
        self.appliers
            .apply(self.state, key, intent, &value, version)?;
        Ok(())
    }

    /// Payload bytes of the event this writer would append.
    pub fn event_length(&self, intent: impl Into<Intent>, value: &RecordValue) -> Result<usize, WriteError> {
        let intent = intent.into();
        let version = self.appliers.latest_version(intent).unwrap_or(1);
        ProcessingResultBuilder::record_length(
            &RecordMetadata::event(intent).with_record_version(version),
            value,
        )
    }

    pub fn can_write_event_of_length(&self, length: usize) -> bool {
        self.result.batch.can_write_additional_event(length)
    }

    pub fn can_write_events_of_length(&self, lengths: &[usize]) -> bool {
        self.result.batch.can_write_additional_events(lengths)
    }

    pub fn max_fragment_size(&self) -> usize {
        self.result.batch.max_fragment_size()
    }
}

pub struct ResponseWriter<'w> {
    result: &'w mut ProcessingResultBuilder,
}

impl ResponseWriter<'_> {
    /// Stage an event response to the requester of `command`, if it has one.
    pub fn write_event_on_command(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
        command: &LoggedRecord,
    ) {
        let Some(request) = command.metadata().request() else {
            return;
        };
        self.result.response = Some(ProcessingResponse {
            request,
            key,
            record_type: RecordType::Event,
            intent: intent.into(),
            rejection_type: None,
            rejection_reason: String::new(),
            value: value.into(),
        });
    }

    pub fn write_rejection_on_command(
        &mut self,
        command: &LoggedRecord,
        rejection_type: RejectionType,
        reason: &str,
    ) {
        let Some(request) = command.metadata().request() else {
            return;
        };
        self.result.response = Some(ProcessingResponse {
            request,
            key: command.key(),
            record_type: RecordType::CommandRejection,
            intent: command.intent(),
            rejection_type: Some(rejection_type),
            rejection_reason: reason.to_string(),
            value: command.value().clone(),
        });
    }
}
