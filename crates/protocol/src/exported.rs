use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use logflow_core::{Key, PartitionId, Position, RejectionType};

use crate::intent::Intent;
use crate::record::{LoggedRecord, RecordType, ValueType};
use crate::value::RecordValue;

/// A durable record as observed by downstream consumers (exporters, secondary indices).
///
/// This is the only externally visible view of the log:
/// - published strictly in position order, once the record's batch is durable
/// - never published during reprocessing
/// - carries the partition so consumers can merge several partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedRecord {
    position: Position,
    source_record_position: Option<Position>,
    partition_id: PartitionId,
    key: Key,
    timestamp: DateTime<Utc>,
    record_type: RecordType,
    intent: Intent,
    rejection_type: Option<RejectionType>,
    rejection_reason: String,
    value: RecordValue,
}

impl ExportedRecord {
    pub fn from_logged(partition_id: PartitionId, record: &LoggedRecord) -> Self {
        let metadata = record.metadata();
        Self {
            position: record.position(),
            source_record_position: record.source_position(),
            partition_id,
            key: record.key(),
            timestamp: record.timestamp(),
            record_type: metadata.record_type(),
            intent: metadata.intent(),
            rejection_type: metadata.rejection_type(),
            rejection_reason: metadata.rejection_reason().to_owned(),
            value: record.value().clone(),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn source_record_position(&self) -> Option<Position> {
        self.source_record_position
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
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

    pub fn value(&self) -> &RecordValue {
        &self.value
    }

    pub fn into_value(self) -> RecordValue {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::JobIntent;
    use crate::record::RecordMetadata;
    use crate::value::JobRecord;

    #[test]
    fn exported_view_carries_full_field_set() {
        let logged = LoggedRecord::new(
            Position::new(7),
            Some(Position::new(6)),
            Key::new(42),
            Utc::now(),
            RecordMetadata::rejection(JobIntent::Activate, RejectionType::NotFound, "no job"),
            JobRecord::new("foo").into(),
        );

        let exported = ExportedRecord::from_logged(PartitionId::new(1), &logged);
        let json = serde_json::to_value(&exported).unwrap();

        assert_eq!(json["position"], 7);
        assert_eq!(json["sourceRecordPosition"], 6);
        assert_eq!(json["partitionId"], 1);
        assert_eq!(json["key"], 42);
        assert_eq!(json["recordType"], "COMMAND_REJECTION");
        assert_eq!(json["intent"]["name"], "ACTIVATE");
        assert_eq!(json["rejectionType"], "NOT_FOUND");
        assert_eq!(json["rejectionReason"], "no job");
        assert_eq!(json["value"]["valueType"], "JOB");
        assert_eq!(exported.value_type(), ValueType::Job);
    }
}
