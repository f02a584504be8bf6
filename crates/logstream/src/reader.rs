use std::collections::VecDeque;

use logflow_core::Position;
use logflow_protocol::LoggedRecord;

use crate::codec::decode_record;
use crate::error::LogStreamError;
use crate::storage::LogStorage;

const READ_AHEAD: usize = 64;

/// Reads records in position order, starting from a seek position.
///
/// Records appended after the reader caught up are picked up by the next call; `Ok(None)`
/// only means "nothing more right now".
pub struct LogStreamReader<S> {
    storage: S,
    next_position: Position,
    buffered: VecDeque<LoggedRecord>,
}

impl<S: LogStorage> LogStreamReader<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            next_position: Position::FIRST,
            buffered: VecDeque::new(),
        }
    }

    /// Continue reading at `position` (inclusive).
    pub fn seek(&mut self, position: Position) {
        self.next_position = position;
        self.buffered.clear();
    }

    /// Position the next returned record will have at minimum.
    pub fn next_position(&self) -> Position {
        self.buffered
            .front()
            .map(LoggedRecord::position)
            .unwrap_or(self.next_position)
    }

    pub fn next_record(&mut self) -> Result<Option<LoggedRecord>, LogStreamError> {
        if self.buffered.is_empty() {
            let frames = self.storage.read_from(self.next_position, READ_AHEAD)?;
            for frame in &frames {
                self.buffered.push_back(decode_record(frame)?);
            }
            if let Some(last) = frames.last() {
                self.next_position = last.position.next();
            }
        }
        Ok(self.buffered.pop_front())
    }

    pub fn has_next(&mut self) -> Result<bool, LogStreamError> {
        if !self.buffered.is_empty() {
            return Ok(true);
        }
        Ok(!self.storage.read_from(self.next_position, 1)?.is_empty())
    }
}

impl<S: LogStorage> Iterator for LogStreamReader<S> {
    type Item = Result<LoggedRecord, LogStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
