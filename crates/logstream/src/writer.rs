use std::sync::Arc;

use tracing::debug;

use logflow_core::{KeyGenerator, Position, StreamClock};
use logflow_protocol::LoggedRecord;

use crate::batch::RecordBatchBuilder;
use crate::codec::{decode_payload, encode_record, stored_timestamp};
use crate::error::{BatchError, LogStreamError};
use crate::storage::{LogStorage, StoredFrame, next_position};

/// Single writer of a partition log.
///
/// Turns a staged batch into positioned records: assigns consecutive positions, resolves
/// auto-assigned keys, links source positions and stamps the flush time, then appends
/// everything in one storage call.
pub struct LogStreamWriter<S> {
    storage: S,
    clock: Arc<dyn StreamClock>,
    next_position: Position,
}

impl<S: LogStorage> LogStreamWriter<S> {
    pub fn new(storage: S, clock: Arc<dyn StreamClock>) -> Result<Self, LogStreamError> {
        let next_position = next_position(storage.last_position()?);
        Ok(Self {
            storage,
            clock,
            next_position,
        })
    }

    pub fn next_position(&self) -> Position {
        self.next_position
    }

    /// Append `batch` atomically.
    ///
    /// `source_position` is the record the batch was produced for (`None` for commands
    /// written from outside the partition). Keys are drawn from `keys` only if the append
    /// succeeds; on error neither the log nor the generator changes. Explicit keys advance
    /// the generator too, the same way reprocessing observes them.
    pub fn flush(
        &mut self,
        batch: &RecordBatchBuilder,
        source_position: Option<Position>,
        keys: &mut KeyGenerator,
    ) -> Result<Vec<LoggedRecord>, LogStreamError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut generator = keys.clone();
        let timestamp = stored_timestamp(self.clock.now())?;
        let first = self.next_position;

        let mut frames = Vec::with_capacity(batch.len());
        let mut records = Vec::with_capacity(batch.len());
        for (index, entry) in batch.entries().enumerate() {
            let entry = entry?;
            let position = Position::new(first.get() + index as u64);
            let source = match entry.source_index {
                i if i < 0 => source_position,
                i if (i as usize) < index => Some(Position::new(first.get() + i as u64)),
                i => {
                    return Err(BatchError::InvalidSourceIndex {
                        index,
                        source_index: i,
                    }
                    .into());
                }
            };
            let key = entry.key.resolve(&mut generator);
            generator.set_key_if_higher(key);
            let (metadata, value) = decode_payload(entry.metadata, entry.value)?;

            frames.push(StoredFrame {
                position,
                bytes: encode_record(source, key, timestamp, entry.metadata, entry.value),
            });
            records.push(LoggedRecord::new(
                position, source, key, timestamp, metadata, value,
            ));
        }

        let last = self.storage.append(frames)?;
        self.next_position = last.next();
        *keys = generator;

        debug!(
            first_position = %first,
            last_position = %last,
            records = records.len(),
            "batch appended"
        );
        Ok(records)
    }
}
