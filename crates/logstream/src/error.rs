use thiserror::Error;

use logflow_protocol::ValueType;

use crate::storage::LogStorageError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch entry finished without a value")]
    MissingValue,

    #[error("malformed batch frame at offset {offset}")]
    MalformedFrame { offset: usize },

    #[error("entry {index} links to entry {source_index}, which is not an earlier entry")]
    InvalidSourceIndex { index: usize, source_index: i32 },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("record timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("metadata declares value type {declared} but value is {actual}")]
    ValueTypeMismatch {
        declared: ValueType,
        actual: ValueType,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors of the log stream reader and writer.
#[derive(Debug, Error)]
pub enum LogStreamError {
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] LogStorageError),
}
