//! Processing state of a partition.
//!
//! State is only ever changed by event appliers. Changes made while a command is processed
//! are tracked in a transaction: the orchestrator commits once the batch is durable and
//! rolls back otherwise, so a failed attempt leaves no trace.

mod journal;
pub mod jobs;
pub mod subscriptions;

use serde::{Deserialize, Serialize};

use logflow_core::{KeyGenerator, PartitionId, Position};

pub use jobs::{Job, JobState, JobStatus};
pub use subscriptions::{Subscription, SubscriptionState};

#[derive(Debug, Clone)]
struct Savepoint {
    key_generator: KeyGenerator,
    last_processed_position: Option<Position>,
    last_written_position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    key_generator: KeyGenerator,
    jobs: JobState,
    subscriptions: SubscriptionState,
    /// Position of the last command whose follow-ups are durable.
    last_processed_position: Option<Position>,
    /// Position of the last follow-up record written by processing.
    last_written_position: Option<Position>,
    #[serde(skip)]
    savepoint: Option<Savepoint>,
}

impl ProcessingState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            key_generator: KeyGenerator::new(partition_id),
            jobs: JobState::default(),
            subscriptions: SubscriptionState::default(),
            last_processed_position: None,
            last_written_position: None,
            savepoint: None,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.key_generator.partition_id()
    }

    pub fn jobs(&self) -> &JobState {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut JobState {
        &mut self.jobs
    }

    pub fn subscriptions(&self) -> &SubscriptionState {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionState {
        &mut self.subscriptions
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.key_generator
    }

    pub fn key_generator_mut(&mut self) -> &mut KeyGenerator {
        &mut self.key_generator
    }

    pub fn last_processed_position(&self) -> Option<Position> {
        self.last_processed_position
    }

    pub fn last_written_position(&self) -> Option<Position> {
        self.last_written_position
    }

    /// Never moves backwards.
    pub fn mark_processed(&mut self, position: Position) {
        self.last_processed_position = self.last_processed_position.max(Some(position));
    }

    /// Never moves backwards.
    pub fn mark_written(&mut self, position: Position) {
        self.last_written_position = self.last_written_position.max(Some(position));
    }

    pub fn in_transaction(&self) -> bool {
        self.savepoint.is_some()
    }

    pub fn begin(&mut self) {
        self.savepoint = Some(Savepoint {
            key_generator: self.key_generator.clone(),
            last_processed_position: self.last_processed_position,
            last_written_position: self.last_written_position,
        });
        self.jobs.begin();
        self.subscriptions.begin();
    }

    pub fn commit(&mut self) {
        self.savepoint = None;
        self.jobs.commit();
        self.subscriptions.commit();
    }

    pub fn rollback(&mut self) {
        if let Some(savepoint) = self.savepoint.take() {
            self.key_generator = savepoint.key_generator;
            self.last_processed_position = savepoint.last_processed_position;
            self.last_written_position = savepoint.last_written_position;
        }
        self.jobs.rollback();
        self.subscriptions.rollback();
    }
}

impl PartialEq for ProcessingState {
    fn eq(&self, other: &Self) -> bool {
        self.key_generator == other.key_generator
            && self.jobs == other.jobs
            && self.subscriptions == other.subscriptions
            && self.last_processed_position == other.last_processed_position
            && self.last_written_position == other.last_written_position
    }
}

#[cfg(test)]
mod tests {
    use logflow_core::Key;
    use logflow_protocol::JobRecord;

    use super::*;

    fn created(key: u64) -> Job {
        Job {
            key: Key::new(key),
            status: JobStatus::Created,
            record: JobRecord::new("foo"),
        }
    }

    #[test]
    fn rollback_restores_everything_touched_in_the_transaction() {
        let mut state = ProcessingState::new(PartitionId::new(1));
        state.jobs_mut().put(created(1));
        state.mark_processed(Position::new(1));
        let before = state.clone();

        state.begin();
        state.jobs_mut().put(created(2));
        state.key_generator_mut().next_key();
        state.mark_processed(Position::new(5));
        state.mark_written(Position::new(6));
        state.rollback();

        assert_eq!(state, before);
        assert!(!state.in_transaction());
    }

    #[test]
    fn commit_keeps_changes() {
        let mut state = ProcessingState::new(PartitionId::new(1));
        state.begin();
        state.jobs_mut().put(created(1));
        state.mark_written(Position::new(2));
        state.commit();
        state.rollback();

        assert!(state.jobs().contains(Key::new(1)));
        assert_eq!(state.last_written_position(), Some(Position::new(2)));
    }

    #[test]
    fn positions_never_move_backwards() {
        let mut state = ProcessingState::new(PartitionId::new(1));
        state.mark_processed(Position::new(4));
        state.mark_processed(Position::new(2));
        assert_eq!(state.last_processed_position(), Some(Position::new(4)));
    }

    #[test]
    fn snapshot_round_trip_preserves_state() {
        let mut state = ProcessingState::new(PartitionId::new(2));
        state.jobs_mut().put(created(1));
        state.key_generator_mut().next_key();
        state.mark_processed(Position::new(3));

        let restored: ProcessingState =
            serde_json::from_slice(&serde_json::to_vec(&state).unwrap()).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.partition_id(), PartitionId::new(2));
    }
}
