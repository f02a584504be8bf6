use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use logflow_core::{Key, Position, RejectionType};

use crate::intent::Intent;
use crate::value::RecordValue;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

impl core::fmt::Display for RecordType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            RecordType::Command => "COMMAND",
            RecordType::Event => "EVENT",
            RecordType::CommandRejection => "COMMAND_REJECTION",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Job,
    JobBatch,
    JobSubscription,
}

impl core::fmt::Display for ValueType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ValueType::Job => "JOB",
            ValueType::JobBatch => "JOB_BATCH",
            ValueType::JobSubscription => "JOB_SUBSCRIPTION",
        })
    }
}

/// Correlation of a command with the requester waiting for its outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestId {
    pub request_stream_id: u32,
    pub request_id: u64,
}

impl RequestId {
    pub fn new(request_stream_id: u32, request_id: u64) -> Self {
        Self {
            request_stream_id,
            request_id,
        }
    }
}

/// Everything about a record except its key, positions and value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    record_type: RecordType,
    intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rejection_type: Option<RejectionType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    rejection_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<RequestId>,
    #[serde(default = "default_record_version")]
    record_version: u16,
}

fn default_record_version() -> u16 {
    1
}

impl RecordMetadata {
    pub fn command(intent: impl Into<Intent>) -> Self {
        Self::of(RecordType::Command, intent.into())
    }

    pub fn event(intent: impl Into<Intent>) -> Self {
        Self::of(RecordType::Event, intent.into())
    }

    /// Metadata rejecting a command with the given intent.
    pub fn rejection(
        intent: impl Into<Intent>,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            rejection_type: Some(rejection_type),
            rejection_reason: reason.into(),
            ..Self::of(RecordType::CommandRejection, intent.into())
        }
    }

    fn of(record_type: RecordType, intent: Intent) -> Self {
        Self {
            record_type,
            intent,
            rejection_type: None,
            rejection_reason: String::new(),
            request: None,
            record_version: default_record_version(),
        }
    }

    pub fn with_request(mut self, request: Option<RequestId>) -> Self {
        self.request = request;
        self
    }

    pub fn with_record_version(mut self, record_version: u16) -> Self {
        self.record_version = record_version;
        self
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn value_type(&self) -> ValueType {
        self.intent.value_type()
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }

    pub fn rejection_type(&self) -> Option<RejectionType> {
        self.rejection_type
    }

    pub fn rejection_reason(&self) -> &str {
        &self.rejection_reason
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn record_version(&self) -> u16 {
        self.record_version
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

/// A durable record read back from the log.
///
/// Notes:
/// - `position` is assigned on flush and strictly increases per partition.
/// - `source_position` is `None` for commands written from outside the partition; every
///   event and rejection points at the command that caused it.
/// - `key` is always concrete; auto-assigned keys are resolved before the batch is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRecord {
    position: Position,
    source_position: Option<Position>,
    key: Key,
    timestamp: DateTime<Utc>,
    metadata: RecordMetadata,
    value: RecordValue,
}

impl LoggedRecord {
    pub fn new(
        position: Position,
        source_position: Option<Position>,
        key: Key,
        timestamp: DateTime<Utc>,
        metadata: RecordMetadata,
        value: RecordValue,
    ) -> Self {
        Self {
            position,
            source_position,
            key,
            timestamp,
            metadata,
            value,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn source_position(&self) -> Option<Position> {
        self.source_position
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    pub fn value(&self) -> &RecordValue {
        &self.value
    }

    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type()
    }

    pub fn intent(&self) -> Intent {
        self.metadata.intent()
    }

    pub fn value_type(&self) -> ValueType {
        self.metadata.value_type()
    }

    pub fn is_command(&self) -> bool {
        self.metadata.is_command()
    }

    pub fn is_event(&self) -> bool {
        self.metadata.is_event()
    }

    pub fn is_rejection(&self) -> bool {
        self.metadata.is_rejection()
    }

    /// Whether this record was written while processing another record.
    pub fn is_follow_up(&self) -> bool {
        self.source_position.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::JobIntent;

    #[test]
    fn rejection_metadata_keeps_command_intent() {
        let metadata = RecordMetadata::rejection(
            JobIntent::Complete,
            RejectionType::InvalidState,
            "job is not activated",
        );

        assert!(metadata.is_rejection());
        assert_eq!(metadata.intent(), Intent::Job(JobIntent::Complete));
        assert_eq!(metadata.value_type(), ValueType::Job);
        assert_eq!(metadata.rejection_type(), Some(RejectionType::InvalidState));
        assert_eq!(metadata.rejection_reason(), "job is not activated");
    }

    #[test]
    fn record_version_defaults_to_one_on_decode() {
        let json = r#"{"recordType":"EVENT","intent":{"valueType":"JOB","name":"FAILED"}}"#;
        let metadata: RecordMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.record_version(), 1);
        assert_eq!(metadata.request(), None);
    }
}
