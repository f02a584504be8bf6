//! Durable log boundary.
//!
//! The storage layer (replication, segments, flushing to disk) is an external
//! collaborator. The stream processor only relies on this contract:
//!
//! - `append` persists a whole batch atomically (all frames or none)
//! - positions are assigned by the appender and must continue the log without gaps;
//!   a mismatch is rejected like an optimistic concurrency conflict
//! - `read_from` returns frames in position order

use std::sync::Arc;

use thiserror::Error;

use logflow_core::Position;

/// One encoded record at its log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    pub position: Position,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogStorageError {
    #[error("position conflict: expected next position {expected}, log continues at {actual}")]
    PositionConflict { expected: Position, actual: Position },

    #[error("frames of one append must have consecutive positions (index {index})")]
    NonConsecutive { index: usize },

    #[error("log storage unavailable: {0}")]
    Unavailable(String),
}

pub trait LogStorage: Send + Sync {
    /// Append `frames` atomically. The first frame must sit at the next free position.
    fn append(&self, frames: Vec<StoredFrame>) -> Result<Position, LogStorageError>;

    /// Read up to `limit` frames starting at `from` (inclusive).
    fn read_from(&self, from: Position, limit: usize) -> Result<Vec<StoredFrame>, LogStorageError>;

    /// Position of the last durable frame, `None` for an empty log.
    fn last_position(&self) -> Result<Option<Position>, LogStorageError>;
}

impl<S> LogStorage for Arc<S>
where
    S: LogStorage + ?Sized,
{
    fn append(&self, frames: Vec<StoredFrame>) -> Result<Position, LogStorageError> {
        (**self).append(frames)
    }

    fn read_from(&self, from: Position, limit: usize) -> Result<Vec<StoredFrame>, LogStorageError> {
        (**self).read_from(from, limit)
    }

    fn last_position(&self) -> Result<Option<Position>, LogStorageError> {
        (**self).last_position()
    }
}

/// Next free position after `last`.
pub fn next_position(last: Option<Position>) -> Position {
    last.map(Position::next).unwrap_or(Position::FIRST)
}
