//! Encoding of records as stored frames.
//!
//! Metadata and value are JSON documents. The durable frame prefixes them with a fixed
//! header: source position (i64, `-1` for none), key (u64), timestamp in epoch millis (i64),
//! metadata length (u32) and value length (u32), all little endian. The position itself is
//! owned by the storage frame.

use chrono::{DateTime, Utc};

use logflow_core::{Key, Position};
use logflow_protocol::{LoggedRecord, RecordMetadata, RecordValue};

use crate::error::CodecError;
use crate::storage::StoredFrame;

pub const RECORD_HEADER_LENGTH: usize = 8 + 8 + 8 + 4 + 4;

const NO_SOURCE_POSITION: i64 = -1;

pub fn encode_metadata(metadata: &RecordMetadata) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(metadata)?)
}

pub fn encode_value(value: &RecordValue) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode metadata and value of one record and check they agree on the value type.
pub fn decode_payload(
    metadata: &[u8],
    value: &[u8],
) -> Result<(RecordMetadata, RecordValue), CodecError> {
    let metadata: RecordMetadata = serde_json::from_slice(metadata)?;
    let value: RecordValue = serde_json::from_slice(value)?;

    if metadata.value_type() != value.value_type() {
        return Err(CodecError::ValueTypeMismatch {
            declared: metadata.value_type(),
            actual: value.value_type(),
        });
    }
    Ok((metadata, value))
}

/// Truncate to the precision a stored frame keeps.
pub fn stored_timestamp(timestamp: DateTime<Utc>) -> Result<DateTime<Utc>, CodecError> {
    let millis = timestamp.timestamp_millis();
    DateTime::from_timestamp_millis(millis).ok_or(CodecError::InvalidTimestamp(millis))
}

pub fn encode_record(
    source_position: Option<Position>,
    key: Key,
    timestamp: DateTime<Utc>,
    metadata: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let source = source_position
        .map(|p| p.get() as i64)
        .unwrap_or(NO_SOURCE_POSITION);

    let mut bytes = Vec::with_capacity(RECORD_HEADER_LENGTH + metadata.len() + value.len());
    bytes.extend_from_slice(&source.to_le_bytes());
    bytes.extend_from_slice(&key.get().to_le_bytes());
    bytes.extend_from_slice(&timestamp.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
    bytes.extend_from_slice(metadata);
    bytes.extend_from_slice(value);
    bytes
}

pub fn decode_record(frame: &StoredFrame) -> Result<LoggedRecord, CodecError> {
    let bytes = frame.bytes.as_slice();
    let header = slice(bytes, 0, RECORD_HEADER_LENGTH)?;

    let source = i64::from_le_bytes(array(&header[0..8]));
    let key = u64::from_le_bytes(array(&header[8..16]));
    let millis = i64::from_le_bytes(array(&header[16..24]));
    let metadata_len = u32::from_le_bytes(array(&header[24..28])) as usize;
    let value_len = u32::from_le_bytes(array(&header[28..32])) as usize;

    let metadata = slice(bytes, RECORD_HEADER_LENGTH, metadata_len)?;
    let value = slice(bytes, RECORD_HEADER_LENGTH + metadata_len, value_len)?;
    let (metadata, value) = decode_payload(metadata, value)?;

    let timestamp =
        DateTime::from_timestamp_millis(millis).ok_or(CodecError::InvalidTimestamp(millis))?;
    let source_position = (source >= 0).then(|| Position::new(source as u64));

    Ok(LoggedRecord::new(
        frame.position,
        source_position,
        Key::new(key),
        timestamp,
        metadata,
        value,
    ))
}

fn slice(bytes: &[u8], start: usize, len: usize) -> Result<&[u8], CodecError> {
    bytes
        .get(start..start + len)
        .ok_or(CodecError::Truncated {
            needed: start + len,
            available: bytes.len(),
        })
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use logflow_protocol::{JobIntent, JobRecord, JobSubscriptionRecord};

    use super::*;

    #[test]
    fn frame_decodes_to_logged_record() {
        let metadata = RecordMetadata::event(JobIntent::Created);
        let value = RecordValue::from(JobRecord::new("foo").with_retries(3));
        let timestamp = stored_timestamp(Utc::now()).unwrap();

        let bytes = encode_record(
            Some(Position::new(4)),
            Key::new(9),
            timestamp,
            &encode_metadata(&metadata).unwrap(),
            &encode_value(&value).unwrap(),
        );
        let record = decode_record(&StoredFrame {
            position: Position::new(5),
            bytes,
        })
        .unwrap();

        assert_eq!(record.position(), Position::new(5));
        assert_eq!(record.source_position(), Some(Position::new(4)));
        assert_eq!(record.key(), Key::new(9));
        assert_eq!(record.timestamp(), timestamp);
        assert_eq!(record.metadata(), &metadata);
        assert_eq!(record.value(), &value);
    }

    #[test]
    fn truncated_frame_is_reported() {
        let err = decode_record(&StoredFrame {
            position: Position::new(1),
            bytes: vec![0; 10],
        })
        .unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 32, available: 10 }));
    }

    #[test]
    fn mismatched_value_type_is_rejected() {
        let metadata = encode_metadata(&RecordMetadata::command(JobIntent::Create)).unwrap();
        let value = encode_value(&JobSubscriptionRecord::new("foo", "w", 1).into()).unwrap();

        assert!(matches!(
            decode_payload(&metadata, &value),
            Err(CodecError::ValueTypeMismatch { .. })
        ));
    }
}
