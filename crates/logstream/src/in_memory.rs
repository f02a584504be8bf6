use std::sync::RwLock;

use logflow_core::Position;

use crate::storage::{LogStorage, LogStorageError, StoredFrame, next_position};

/// In-memory append-only log.
///
/// Intended for tests/dev. Supports injecting append failures to simulate a storage outage
/// between processing and flush.
#[derive(Debug, Default)]
pub struct InMemoryLogStorage {
    frames: RwLock<Vec<StoredFrame>>,
    fail_appends: RwLock<bool>,
}

impl InMemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail with [`LogStorageError::Unavailable`].
    pub fn set_fail_appends(&self, fail: bool) {
        let mut flag = self
            .fail_appends
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *flag = fail;
    }

    pub fn len(&self) -> usize {
        self.frames.read().map(|frames| frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_poisoned() -> LogStorageError {
        LogStorageError::Unavailable("lock poisoned".to_string())
    }
}

impl LogStorage for InMemoryLogStorage {
    fn append(&self, frames: Vec<StoredFrame>) -> Result<Position, LogStorageError> {
        if *self.fail_appends.read().map_err(|_| Self::lock_poisoned())? {
            return Err(LogStorageError::Unavailable("append failure injected".to_string()));
        }

        let mut log = self.frames.write().map_err(|_| Self::lock_poisoned())?;
        let expected = next_position(log.last().map(|f| f.position));

        let Some(first) = frames.first() else {
            return Ok(expected);
        };
        if first.position != expected {
            return Err(LogStorageError::PositionConflict {
                expected: first.position,
                actual: expected,
            });
        }
        for (index, pair) in frames.windows(2).enumerate() {
            if pair[1].position != pair[0].position.next() {
                return Err(LogStorageError::NonConsecutive { index: index + 1 });
            }
        }

        let last = frames
            .last()
            .map(|f| f.position)
            .unwrap_or(first.position);
        log.extend(frames);
        Ok(last)
    }

    fn read_from(&self, from: Position, limit: usize) -> Result<Vec<StoredFrame>, LogStorageError> {
        let log = self.frames.read().map_err(|_| Self::lock_poisoned())?;
        let start = log.partition_point(|f| f.position < from);
        Ok(log.iter().skip(start).take(limit).cloned().collect())
    }

    fn last_position(&self) -> Result<Option<Position>, LogStorageError> {
        let log = self.frames.read().map_err(|_| Self::lock_poisoned())?;
        Ok(log.last().map(|f| f.position))
    }
}
