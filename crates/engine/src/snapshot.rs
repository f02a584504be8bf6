//! Snapshot persistence.
//!
//! A snapshot is the serialized [`ProcessingState`], including the last processed and last
//! written positions. Recovery restores the latest snapshot and replays only the log tail;
//! without a snapshot it replays from the first position.

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::state::ProcessingState;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

pub trait SnapshotStore: Send + Sync {
    fn persist(&self, state: &ProcessingState) -> Result<(), SnapshotError>;

    fn latest(&self) -> Result<Option<ProcessingState>, SnapshotError>;
}

impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    fn persist(&self, state: &ProcessingState) -> Result<(), SnapshotError> {
        (**self).persist(state)
    }

    fn latest(&self) -> Result<Option<ProcessingState>, SnapshotError> {
        (**self).latest()
    }
}

/// Keeps the latest snapshot as JSON bytes in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    latest: RwLock<Option<Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        if let Ok(mut latest) = self.latest.write() {
            *latest = None;
        }
    }

    fn poisoned() -> SnapshotError {
        SnapshotError::Unavailable("lock poisoned".to_string())
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn persist(&self, state: &ProcessingState) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(state)?;
        let mut latest = self.latest.write().map_err(|_| Self::poisoned())?;
        *latest = Some(bytes);
        Ok(())
    }

    fn latest(&self) -> Result<Option<ProcessingState>, SnapshotError> {
        let latest = self.latest.read().map_err(|_| Self::poisoned())?;
        latest
            .as_deref()
            .map(serde_json::from_slice::<ProcessingState>)
            .transpose()
            .map_err(SnapshotError::from)
    }
}
