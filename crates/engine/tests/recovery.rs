mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use proptest::prelude::*;

use common::Harness;
use logflow_core::{Key, RejectionType};
use logflow_engine::jobs::{InMemoryJobStreamer, JobBackoffChecker, JobTimeoutChecker};
use logflow_engine::{
    CommandRequest, EngineConfig, EventAppliers, JobStatus, Phase, ProcessingError,
    ProcessingState, RecordProcessor, StreamProcessorError, Writers, replay,
};
use logflow_protocol::{
    JobIntent, JobRecord, JobSubscriptionIntent, JobSubscriptionRecord, LoggedRecord, RequestId,
    ValueType, Variables,
};

fn snapshot_of(state: &ProcessingState) -> serde_json::Value {
    serde_json::to_value(state).unwrap()
}

/// Writes an event and then gives up, so the attempt must be rolled back.
struct AppendThenFail;

impl RecordProcessor for AppendThenFail {
    fn value_type(&self) -> ValueType {
        ValueType::Job
    }

    fn process(
        &mut self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        writers
            .state()
            .append_follow_up_event(command.key(), JobIntent::Created, JobRecord::new("foo"))?;
        Err(ProcessingError::Failed("worker pool unavailable".to_string()))
    }
}

/// Writes an event no applier accepts: completing a job that does not exist.
struct Corrupting;

impl RecordProcessor for Corrupting {
    fn value_type(&self) -> ValueType {
        ValueType::Job
    }

    fn process(
        &mut self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        writers.state().append_follow_up_event(
            command.key(),
            JobIntent::Completed,
            JobRecord::new("foo"),
        )?;
        Ok(())
    }
}

fn harness_with(processor: Box<dyn RecordProcessor>) -> Harness {
    Harness::with_processors(
        EngineConfig::default().with_snapshot_period(0),
        vec![processor],
        Arc::new(InMemoryJobStreamer::new()),
    )
}

#[test]
fn failed_attempt_leaves_only_the_rejection() {
    let mut h = harness_with(Box::new(AppendThenFail));

    let response = h.send(CommandRequest::new(JobIntent::Create, JobRecord::new("foo")));

    assert!(response.is_rejection());
    assert_eq!(response.rejection_type, Some(RejectionType::ProcessingError));
    assert!(response.rejection_reason.contains("worker pool unavailable"));
    assert!(h.processor.state().jobs().is_empty());
    assert!(h.events_of(JobIntent::Created).is_empty());
    assert_eq!(h.rejections().len(), 1);
    assert_eq!(h.processor.phase(), Phase::Processing);

    let stats = h.processor.stats();
    assert_eq!(stats.errors_handled, 1);
    assert_eq!(stats.commands_rejected, 1);
}

/// Write the largest `intent` command for `key` that still passes the ingress ceiling.
fn write_near_ceiling(h: &mut Harness, intent: JobIntent, key: Key) -> LoggedRecord {
    for padding in (0..h.config.max_fragment_size).rev().step_by(4) {
        let mut variables = Variables::new();
        variables.insert("blob".to_string(), serde_json::json!("x".repeat(padding)));
        let request = CommandRequest::new(intent, JobRecord::new("foo").with_variables(variables))
            .with_key(key)
            .with_request(RequestId::new(1, 500));
        if let Ok(command) = h.processor.write_command(request) {
            return command;
        }
    }
    panic!("no command fits under the ceiling");
}

#[test]
fn near_ceiling_command_is_rejected_and_the_partition_moves_on() {
    let mut h = Harness::with_config(
        EngineConfig::default()
            .with_snapshot_period(0)
            .with_max_fragment_size(2048),
    );
    let command = write_near_ceiling(&mut h, JobIntent::Complete, Key::new(12345));

    assert_eq!(h.processor.process_until_idle().unwrap(), 1);
    assert_eq!(h.processor.phase(), Phase::Processing);

    let rejections = h.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].key(), command.key());
    assert_eq!(rejections[0].metadata().rejection_type(), Some(RejectionType::NotFound));
    assert!(rejections[0].value().as_job().unwrap().variables.is_empty());

    let response = h.responses.take().pop().unwrap();
    assert_eq!(response.request, RequestId::new(1, 500));
    assert_eq!(response.rejection_type, Some(RejectionType::NotFound));

    let next = h.create_job("foo");
    assert!(h.processor.state().jobs().contains(next));
}

#[test]
fn near_ceiling_command_survives_a_failing_processor() {
    let mut h = Harness::with_processors(
        EngineConfig::default()
            .with_snapshot_period(0)
            .with_max_fragment_size(2048),
        vec![Box::new(AppendThenFail)],
        Arc::new(InMemoryJobStreamer::new()),
    );
    write_near_ceiling(&mut h, JobIntent::Create, Key::new(1));

    assert_eq!(h.processor.process_until_idle().unwrap(), 1);
    assert_eq!(h.processor.phase(), Phase::Processing);
    assert!(h.events_of(JobIntent::Created).is_empty());

    let rejections = h.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(
        rejections[0].metadata().rejection_type(),
        Some(RejectionType::ProcessingError)
    );
    assert_eq!(h.processor.stats().errors_handled, 1);

    h.processor
        .write_command(CommandRequest::new(JobIntent::Create, JobRecord::new("foo")))
        .unwrap();
    assert_eq!(h.processor.process_until_idle().unwrap(), 1);
    assert_eq!(h.rejections().len(), 2);
}

#[test]
fn applier_failure_halts_the_partition() {
    let mut h = harness_with(Box::new(Corrupting));
    let command = h
        .processor
        .write_command(CommandRequest::new(JobIntent::Complete, JobRecord::new("foo")))
        .unwrap();

    let err = h.processor.process_until_idle().unwrap_err();
    assert!(matches!(
        err,
        StreamProcessorError::Processing { position, .. } if position == command.position()
    ));
    assert_eq!(h.processor.phase(), Phase::Failed);
    assert_eq!(h.records().len(), 1);
    assert!(h.responses.responses().is_empty());
    assert!(h.processor.state().last_processed_position().is_none());

    let refused = h
        .processor
        .write_command(CommandRequest::new(JobIntent::Create, JobRecord::new("foo")));
    assert!(matches!(
        refused,
        Err(StreamProcessorError::InvalidPhase(Phase::Failed))
    ));

    h.processor.recover().unwrap();
    assert_eq!(h.processor.phase(), Phase::Processing);
    assert!(h.processor.process_until_idle().is_err());
}

#[test]
fn command_without_processor_halts_the_partition() {
    let mut h = harness_with(Box::new(AppendThenFail));
    h.processor
        .write_command(CommandRequest::new(
            JobSubscriptionIntent::Open,
            JobSubscriptionRecord::new("foo", "w", 1000),
        ))
        .unwrap();

    let err = h.processor.process_until_idle().unwrap_err();
    assert!(matches!(
        err,
        StreamProcessorError::NoSuchProcessor(ValueType::JobSubscription)
    ));
    assert_eq!(h.processor.phase(), Phase::Failed);
}

#[test]
fn append_failure_rolls_back_and_recovery_reprocesses() {
    let mut h = Harness::new();
    let existing = h.create_job("foo");
    h.processor
        .write_command(CommandRequest::new(
            JobIntent::Create,
            JobRecord::new("bar").with_retries(1),
        ))
        .unwrap();
    let before = snapshot_of(h.processor.state());
    h.storage.set_fail_appends(true);

    let err = h.processor.process_until_idle().unwrap_err();
    assert!(matches!(err, StreamProcessorError::LogStream(_)));
    assert_eq!(h.processor.phase(), Phase::Failed);
    assert_eq!(snapshot_of(h.processor.state()), before);

    h.storage.set_fail_appends(false);
    h.processor.recover().unwrap();
    assert_eq!(h.processor.process_until_idle().unwrap(), 1);

    let created = h.events_of(JobIntent::Created);
    assert_eq!(created.len(), 2);
    let new_key = created[1].key();
    assert!(new_key > existing);
    assert_eq!(
        h.processor.state().jobs().get(new_key).unwrap().job_type(),
        "bar"
    );
}

fn run_lifecycle(h: &mut Harness) {
    let first = h.create_job("foo");
    let second = h.create_job("foo");
    let third = h.create_job("bar");
    h.open_subscription("bar", 1);

    h.activate(first, "worker-1", 1000);
    h.job_command(first, JobIntent::Complete, JobRecord::new("foo"));
    h.activate(second, "worker-1", 1000);
    h.job_command(
        second,
        JobIntent::Fail,
        JobRecord::new("foo").with_retries(2).with_retry_backoff_ms(100),
    );
    h.activate_batch("foo", 3);
    h.clock.advance(TimeDelta::seconds(2));
    h.sweep(&mut JobBackoffChecker::new(Duration::from_millis(10)));
    h.sweep(&mut JobTimeoutChecker::new(Duration::from_millis(10)));
    h.job_command(third, JobIntent::Cancel, JobRecord::new("bar"));
}

#[test]
fn restart_rebuilds_the_same_state() {
    let mut h = Harness::new();
    run_lifecycle(&mut h);
    let live = snapshot_of(h.processor.state());
    let records = h.storage.len();

    h.restart();

    assert_eq!(snapshot_of(h.processor.state()), live);
    assert_eq!(h.storage.len(), records);
}

#[test]
fn restart_from_a_snapshot_rebuilds_the_same_state() {
    let mut h = Harness::with_config(EngineConfig::default().with_snapshot_period(3));
    run_lifecycle(&mut h);
    assert!(h.processor.stats().snapshots_taken > 0);
    let live = snapshot_of(h.processor.state());

    let mut restarted = h.rebuilt();
    let progress = restarted.recover().unwrap();

    assert!(progress.restored_from_snapshot);
    assert_eq!(snapshot_of(restarted.state()), live);
}

#[test]
fn keys_continue_after_restart() {
    let mut h = Harness::new();
    h.create_job("foo");
    run_lifecycle(&mut h);
    let last_key = h.processor.state().key_generator().last_key();

    h.restart();
    assert_eq!(h.processor.state().key_generator().last_key(), last_key);

    let next = h.create_job("foo");
    assert!(Some(next) > last_key);
}

#[test]
fn replay_is_repeatable_and_writes_nothing() {
    let mut h = Harness::new();
    run_lifecycle(&mut h);
    let records = h.storage.len();
    let appliers = EventAppliers::new();

    let first = replay(h.storage.clone(), &appliers, h.config.partition_id, None).unwrap();
    let second = replay(h.storage.clone(), &appliers, h.config.partition_id, None).unwrap();

    assert_eq!(snapshot_of(&first.state), snapshot_of(&second.state));
    assert_eq!(snapshot_of(&first.state), snapshot_of(h.processor.state()));
    assert_eq!(first.progress.records_read, records as u64);
    assert!(first.pending_commands.is_empty());
    assert_eq!(h.storage.len(), records);
}

#[test]
fn replay_does_not_repeat_side_effects() {
    let mut h = Harness::new();
    let subscriber = h.open_subscription("foo", 2);
    h.create_job("foo");
    assert_eq!(h.streamer.take_for(subscriber).len(), 1);

    h.restart();

    assert!(h.streamer.pushed().is_empty());
    assert!(h.responses.take().is_empty());
}

#[test]
fn unprocessed_command_is_processed_after_restart() {
    let mut h = Harness::new();
    h.create_job("foo");
    let pending = h
        .processor
        .write_command(CommandRequest::new(JobIntent::Create, JobRecord::new("bar")))
        .unwrap();

    h.restart();
    assert!(h.processor.state().jobs().get(pending.key()).is_none());

    assert_eq!(h.processor.process_until_idle().unwrap(), 1);
    let job = h.processor.state().jobs().get(pending.key()).unwrap();
    assert_eq!(job.status, JobStatus::Created);
    assert_eq!(h.events_of(JobIntent::Created).len(), 2);
}

#[test]
fn snapshot_of_another_partition_is_refused() {
    let mut h = Harness::new();
    h.create_job("foo");
    let foreign = ProcessingState::new(logflow_core::PartitionId::new(9));

    let err = replay(
        h.storage.clone(),
        &EventAppliers::new(),
        h.config.partition_id,
        Some(foreign),
    )
    .unwrap_err();
    assert!(matches!(err, logflow_engine::ReplayError::PartitionMismatch { .. }));
}

#[derive(Debug, Clone)]
enum Op {
    Create(usize),
    Activate(usize, i64),
    Complete(usize),
    Fail(usize, i32, i64),
    Cancel(usize),
    UpdateRetries(usize, i32),
    Batch(usize, i32),
    Subscribe(usize, i32),
    Advance(i64),
    Sweep,
}

const TYPES: [&str; 2] = ["foo", "bar"];

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..TYPES.len()).prop_map(Op::Create),
        3 => (any::<usize>(), 1i64..3000).prop_map(|(job, timeout)| Op::Activate(job, timeout)),
        2 => any::<usize>().prop_map(Op::Complete),
        2 => (any::<usize>(), 0i32..3, 0i64..1500)
            .prop_map(|(job, retries, backoff)| Op::Fail(job, retries, backoff)),
        1 => any::<usize>().prop_map(Op::Cancel),
        1 => (any::<usize>(), 0i32..3).prop_map(|(job, retries)| Op::UpdateRetries(job, retries)),
        2 => (0..TYPES.len(), 1i32..4).prop_map(|(ty, max)| Op::Batch(ty, max)),
        1 => (0..TYPES.len(), 0i32..3).prop_map(|(ty, credits)| Op::Subscribe(ty, credits)),
        2 => (0i64..3000).prop_map(Op::Advance),
        2 => Just(Op::Sweep),
    ]
}

fn pick(jobs: &[Key], index: usize) -> Option<Key> {
    (!jobs.is_empty()).then(|| jobs[index % jobs.len()])
}

fn job_type(h: &Harness, key: Key) -> String {
    h.processor
        .state()
        .jobs()
        .get(key)
        .map(|job| job.record.job_type.clone())
        .unwrap_or_default()
}

fn run(h: &mut Harness, ops: &[Op]) {
    let mut jobs = Vec::new();
    let mut timeouts = JobTimeoutChecker::new(Duration::from_millis(1));
    let mut backoffs = JobBackoffChecker::new(Duration::from_millis(1));

    for op in ops {
        match *op {
            Op::Create(ty) => jobs.push(h.create_job(TYPES[ty])),
            Op::Activate(index, timeout) => {
                if let Some(key) = pick(&jobs, index) {
                    h.activate(key, "worker", timeout);
                }
            }
            Op::Complete(index) => {
                if let Some(key) = pick(&jobs, index) {
                    let record = JobRecord::new(job_type(h, key));
                    h.job_command(key, JobIntent::Complete, record);
                }
            }
            Op::Fail(index, retries, backoff) => {
                if let Some(key) = pick(&jobs, index) {
                    let record = JobRecord::new(job_type(h, key))
                        .with_retries(retries)
                        .with_retry_backoff_ms(backoff);
                    h.job_command(key, JobIntent::Fail, record);
                }
            }
            Op::Cancel(index) => {
                if let Some(key) = pick(&jobs, index) {
                    let record = JobRecord::new(job_type(h, key));
                    h.job_command(key, JobIntent::Cancel, record);
                }
            }
            Op::UpdateRetries(index, retries) => {
                if let Some(key) = pick(&jobs, index) {
                    let record = JobRecord::new(job_type(h, key)).with_retries(retries);
                    h.job_command(key, JobIntent::UpdateRetries, record);
                }
            }
            Op::Batch(ty, max) => {
                h.activate_batch(TYPES[ty], max);
            }
            Op::Subscribe(ty, credits) => {
                h.open_subscription(TYPES[ty], credits);
            }
            Op::Advance(ms) => h.clock.advance(TimeDelta::milliseconds(ms)),
            Op::Sweep => {
                h.sweep(&mut timeouts);
                h.sweep(&mut backoffs);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    #[test]
    fn replayed_state_matches_live_state(ops in proptest::collection::vec(op(), 1..40)) {
        let mut h = Harness::with_config(EngineConfig::default().with_snapshot_period(5));
        run(&mut h, &ops);
        let live = snapshot_of(h.processor.state());

        let from_log = replay(
            h.storage.clone(),
            &EventAppliers::new(),
            h.config.partition_id,
            None,
        )
        .unwrap();
        prop_assert_eq!(&snapshot_of(&from_log.state), &live);
        prop_assert!(from_log.pending_commands.is_empty());

        h.restart();
        prop_assert_eq!(&snapshot_of(h.processor.state()), &live);

        for job in h.processor.state().jobs().iter() {
            prop_assert!(job.record.retries >= 0);
            prop_assert_eq!(job.deadline().is_some(), job.status == JobStatus::Activated);
        }
    }
}
