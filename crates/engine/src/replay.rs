//! Reprocessing: rebuilding processing state from the log.
//!
//! Recovery restores the latest snapshot (or starts empty) and reads the log tail after the
//! snapshot's last processed position. Follow-up events written after the snapshot are
//! applied through the same appliers live processing uses; rejections and commands change
//! nothing. Replay never writes to the log, never responds and never exports.
//!
//! Commands without follow-ups are left for the orchestrator, which processes them as usual
//! once replay has finished.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info};

use logflow_core::{PartitionId, Position};
use logflow_logstream::{LogStorage, LogStreamError, LogStreamReader};

use crate::appliers::{ApplyError, EventAppliers};
use crate::state::ProcessingState;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("log error during replay: {0}")]
    LogStream(#[from] LogStreamError),

    #[error("event at position {position} could not be applied: {source}")]
    Apply {
        position: Position,
        #[source]
        source: ApplyError,
    },

    #[error("command at position {position} has no follow-up but later commands do")]
    UnprocessedCommand { position: Position },

    #[error("snapshot belongs to partition {actual}, expected {expected}")]
    PartitionMismatch {
        expected: PartitionId,
        actual: PartitionId,
    },
}

/// Phase of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    /// Restoring the snapshot.
    Restoring,
    /// Reading the log tail and applying events.
    Replaying,
    /// Completed successfully.
    Complete,
}

/// Progress counters of a replay run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReplayProgress {
    pub phase: ReplayPhase,
    /// Position replay started reading at.
    pub start_position: Position,
    /// Records read from the log tail.
    pub records_read: u64,
    /// Events applied to state.
    pub events_applied: u64,
    /// Events skipped because the snapshot already contains them.
    pub events_skipped: u64,
    pub restored_from_snapshot: bool,
}

impl ReplayProgress {
    fn new(start_position: Position, restored_from_snapshot: bool) -> Self {
        Self {
            phase: ReplayPhase::Restoring,
            start_position,
            records_read: 0,
            events_applied: 0,
            events_skipped: 0,
            restored_from_snapshot,
        }
    }
}

/// Rebuilt state plus what replay found out about the log.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub state: ProcessingState,
    pub progress: ReplayProgress,
    /// Commands that still need processing, in position order.
    pub pending_commands: Vec<Position>,
}

/// Rebuild the state of `partition_id` from `snapshot` and the log in `storage`.
pub fn replay<S: LogStorage>(
    storage: S,
    appliers: &EventAppliers,
    partition_id: PartitionId,
    snapshot: Option<ProcessingState>,
) -> Result<ReplayOutcome, ReplayError> {
    let restored = snapshot.is_some();
    let mut state = match snapshot {
        Some(state) if state.partition_id() != partition_id => {
            return Err(ReplayError::PartitionMismatch {
                expected: partition_id,
                actual: state.partition_id(),
            });
        }
        Some(state) => state,
        None => ProcessingState::new(partition_id),
    };

    let start = state
        .last_processed_position()
        .map(Position::next)
        .unwrap_or(Position::FIRST);
    let applied_up_to = state.last_written_position();
    let mut progress = ReplayProgress::new(start, restored);

    info!(
        partition_id = %partition_id,
        start_position = %start,
        restored_from_snapshot = restored,
        "replay started"
    );
    progress.phase = ReplayPhase::Replaying;

    let mut commands = BTreeSet::new();
    let mut reader = LogStreamReader::new(storage);
    reader.seek(start);
    for record in reader {
        let record = record?;
        progress.records_read += 1;
        state.key_generator_mut().set_key_if_higher(record.key());

        if let Some(source) = record.source_position() {
            commands.remove(&source);
            state.mark_processed(source);
            state.mark_written(record.position());
        }
        if record.is_command() {
            commands.insert(record.position());
        }
        if !record.is_event() {
            continue;
        }
        if applied_up_to.is_some_and(|applied| record.position() <= applied) {
            progress.events_skipped += 1;
            continue;
        }

        appliers
            .apply_record(&mut state, &record)
            .map_err(|source| ReplayError::Apply {
                position: record.position(),
                source,
            })?;
        progress.events_applied += 1;
        debug!(position = %record.position(), intent = %record.intent(), "event replayed");
    }

    // Commands are processed in position order, so nothing before the last processed
    // command can still be waiting.
    if let Some(last_processed) = state.last_processed_position()
        && let Some(&position) = commands.iter().find(|&&p| p < last_processed)
    {
        return Err(ReplayError::UnprocessedCommand { position });
    }

    progress.phase = ReplayPhase::Complete;
    info!(
        partition_id = %partition_id,
        records_read = progress.records_read,
        events_applied = progress.events_applied,
        pending_commands = commands.len(),
        "replay complete"
    );

    Ok(ReplayOutcome {
        state,
        progress,
        pending_commands: commands.into_iter().collect(),
    })
}
