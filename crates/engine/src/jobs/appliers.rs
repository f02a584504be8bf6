//! Appliers for job, job batch and job subscription events.

use logflow_core::Key;
use logflow_protocol::{
    Intent, JobBatchIntent, JobIntent, JobRecord, JobSubscriptionIntent, JobSubscriptionRecord,
    RecordValue, ValueType,
};

use crate::appliers::{ApplyError, EventAppliers};
use crate::state::{Job, JobStatus, ProcessingState, Subscription};

pub fn register(appliers: &mut EventAppliers) {
    appliers
        .register(JobIntent::Created, 1, job_created)
        .register(JobIntent::Activated, 1, job_activated)
        .register(JobIntent::Completed, 1, job_completed)
        .register(JobIntent::Failed, 1, job_failed_v1)
        .register(JobIntent::Failed, 2, job_failed_v2)
        .register(JobIntent::Canceled, 1, job_canceled)
        .register(JobIntent::RetriesUpdated, 1, job_retries_updated)
        .register(JobIntent::TimedOut, 1, job_timed_out)
        .register(JobIntent::RecurredAfterBackoff, 1, job_recurred_after_backoff)
        .register(JobBatchIntent::Activated, 1, job_batch_activated)
        .register(JobSubscriptionIntent::Opened, 1, subscription_opened)
        .register(JobSubscriptionIntent::CreditsAdded, 1, subscription_credits_added)
        .register(JobSubscriptionIntent::Closed, 1, subscription_closed);
}

fn job_value(intent: JobIntent, value: &RecordValue) -> Result<&JobRecord, ApplyError> {
    value.as_job().ok_or(ApplyError::UnexpectedValue {
        intent: intent.into(),
        expected: ValueType::Job,
        actual: value.value_type(),
    })
}

fn subscription_value(
    intent: JobSubscriptionIntent,
    value: &RecordValue,
) -> Result<&JobSubscriptionRecord, ApplyError> {
    value.as_job_subscription().ok_or(ApplyError::UnexpectedValue {
        intent: intent.into(),
        expected: ValueType::JobSubscription,
        actual: value.value_type(),
    })
}

fn existing_job(state: &ProcessingState, intent: JobIntent, key: Key) -> Result<Job, ApplyError> {
    state
        .jobs()
        .get(key)
        .cloned()
        .ok_or(ApplyError::MissingEntity {
            intent: intent.into(),
            key,
        })
}

fn invalid_transition(intent: JobIntent, job: &Job) -> ApplyError {
    ApplyError::InvalidTransition {
        intent: intent.into(),
        key: job.key,
        status: job.status.to_string(),
    }
}

fn job_created(state: &mut ProcessingState, key: Key, value: &RecordValue) -> Result<(), ApplyError> {
    let intent = JobIntent::Created;
    let record = job_value(intent, value)?;
    if state.jobs().contains(key) {
        return Err(ApplyError::EntityExists {
            intent: intent.into(),
            key,
        });
    }

    let mut record = record.clone();
    record.deadline = None;
    record.recur_at = None;
    state.jobs_mut().put(Job {
        key,
        status: JobStatus::Created,
        record,
    });
    Ok(())
}

fn job_activated(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobIntent::Activated;
    let record = job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if !job.is_activatable() {
        return Err(invalid_transition(intent, &job));
    }
    if record.deadline.is_none() {
        return Err(ApplyError::Invariant {
            intent: intent.into(),
            reason: format!("job {key} activated without a deadline"),
        });
    }

    if let Some(subscriber_key) = record.subscriber_key {
        let mut subscription = state
            .subscriptions()
            .get(subscriber_key)
            .cloned()
            .ok_or(ApplyError::MissingEntity {
                intent: intent.into(),
                key: subscriber_key,
            })?;
        if !subscription.has_credits() {
            return Err(ApplyError::Invariant {
                intent: intent.into(),
                reason: format!("subscriber {subscriber_key} has no credits"),
            });
        }
        subscription.record.credits -= 1;
        state.subscriptions_mut().put(subscription);
    }

    job.status = JobStatus::Activated;
    job.record.worker = record.worker.clone();
    job.record.timeout_ms = record.timeout_ms;
    job.record.deadline = record.deadline;
    job.record.subscriber_key = record.subscriber_key;
    job.record.recur_at = None;
    state.jobs_mut().put(job);
    Ok(())
}

fn job_completed(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobIntent::Completed;
    let record = job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if job.status != JobStatus::Activated {
        return Err(invalid_transition(intent, &job));
    }

    job.status = JobStatus::Completed;
    job.record.variables = record.variables.clone();
    job.record.deadline = None;
    state.jobs_mut().put(job);
    Ok(())
}

fn apply_failed(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
    honour_backoff: bool,
) -> Result<(), ApplyError> {
    let intent = JobIntent::Failed;
    let record = job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if job.status != JobStatus::Activated {
        return Err(invalid_transition(intent, &job));
    }
    if record.retries < 0 {
        return Err(ApplyError::Invariant {
            intent: intent.into(),
            reason: format!("negative retries {}", record.retries),
        });
    }

    job.status = JobStatus::Failed;
    job.record.retries = record.retries;
    job.record.error_code = record.error_code.clone();
    job.record.error_message = record.error_message.clone();
    job.record.retry_backoff_ms = record.retry_backoff_ms;
    job.record.deadline = None;
    job.record.recur_at = if honour_backoff && record.retries > 0 {
        record.recur_at
    } else {
        None
    };
    state.jobs_mut().put(job);
    Ok(())
}

/// Version 1 predates retry backoff: a failed job with retries is activatable at once.
fn job_failed_v1(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    apply_failed(state, key, value, false)
}

fn job_failed_v2(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    apply_failed(state, key, value, true)
}

fn job_canceled(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobIntent::Canceled;
    job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if job.status.is_terminal() {
        return Err(invalid_transition(intent, &job));
    }

    job.status = JobStatus::Canceled;
    job.record.deadline = None;
    job.record.recur_at = None;
    state.jobs_mut().put(job);
    Ok(())
}

fn job_retries_updated(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobIntent::RetriesUpdated;
    let record = job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if job.status.is_terminal() {
        return Err(invalid_transition(intent, &job));
    }

    job.record.retries = record.retries;
    if job.status == JobStatus::Failed && record.retries > 0 {
        job.status = JobStatus::Created;
        job.record.recur_at = None;
    }
    state.jobs_mut().put(job);
    Ok(())
}

fn job_timed_out(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobIntent::TimedOut;
    job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if job.status != JobStatus::Activated {
        return Err(invalid_transition(intent, &job));
    }

    job.status = JobStatus::TimedOut;
    job.record.deadline = None;
    job.record.worker.clear();
    job.record.subscriber_key = None;
    state.jobs_mut().put(job);
    Ok(())
}

fn job_recurred_after_backoff(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobIntent::RecurredAfterBackoff;
    job_value(intent, value)?;
    let mut job = existing_job(state, intent, key)?;
    if job.status != JobStatus::Failed || job.record.recur_at.is_none() {
        return Err(invalid_transition(intent, &job));
    }

    job.record.recur_at = None;
    state.jobs_mut().put(job);
    Ok(())
}

/// The batch summary changes nothing: each activation has its own job event.
fn job_batch_activated(
    _state: &mut ProcessingState,
    _key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    match value {
        RecordValue::JobBatch(_) => Ok(()),
        other => Err(ApplyError::UnexpectedValue {
            intent: Intent::JobBatch(JobBatchIntent::Activated),
            expected: ValueType::JobBatch,
            actual: other.value_type(),
        }),
    }
}

fn subscription_opened(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobSubscriptionIntent::Opened;
    let record = subscription_value(intent, value)?;
    if state.subscriptions().get(key).is_some() {
        return Err(ApplyError::EntityExists {
            intent: intent.into(),
            key,
        });
    }

    state.subscriptions_mut().put(Subscription {
        key,
        record: record.clone(),
    });
    Ok(())
}

/// The event carries the credit total after the top-up.
fn subscription_credits_added(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobSubscriptionIntent::CreditsAdded;
    let record = subscription_value(intent, value)?;
    let mut subscription =
        state
            .subscriptions()
            .get(key)
            .cloned()
            .ok_or(ApplyError::MissingEntity {
                intent: intent.into(),
                key,
            })?;

    subscription.record.credits = record.credits;
    state.subscriptions_mut().put(subscription);
    Ok(())
}

fn subscription_closed(
    state: &mut ProcessingState,
    key: Key,
    value: &RecordValue,
) -> Result<(), ApplyError> {
    let intent = JobSubscriptionIntent::Closed;
    subscription_value(intent, value)?;
    state
        .subscriptions_mut()
        .remove(key)
        .map(|_| ())
        .ok_or(ApplyError::MissingEntity {
            intent: intent.into(),
            key,
        })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use logflow_core::PartitionId;

    use super::*;

    fn setup() -> (EventAppliers, ProcessingState) {
        (EventAppliers::new(), ProcessingState::new(PartitionId::new(1)))
    }

    fn apply(
        appliers: &EventAppliers,
        state: &mut ProcessingState,
        key: u64,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
        version: u16,
    ) -> Result<(), ApplyError> {
        appliers.apply(state, Key::new(key), intent.into(), &value.into(), version)
    }

    fn activated_value(deadline_in: Duration) -> JobRecord {
        let mut record = JobRecord::new("foo").with_worker("w1").with_timeout_ms(1000);
        record.deadline = Some(Utc::now() + deadline_in);
        record
    }

    #[test]
    fn activation_sets_deadline_and_consumes_subscriber_credit() {
        let (appliers, mut state) = setup();
        apply(&appliers, &mut state, 1, JobIntent::Created, JobRecord::new("foo"), 1).unwrap();
        apply(
            &appliers,
            &mut state,
            10,
            JobSubscriptionIntent::Opened,
            JobSubscriptionRecord::new("foo", "w1", 1000).with_credits(2),
            1,
        )
        .unwrap();

        let value = activated_value(Duration::seconds(1)).with_subscriber(Key::new(10));
        apply(&appliers, &mut state, 1, JobIntent::Activated, value, 1).unwrap();

        let job = state.jobs().get(Key::new(1)).unwrap();
        assert_eq!(job.status, JobStatus::Activated);
        assert!(job.deadline().is_some());
        assert_eq!(state.subscriptions().get(Key::new(10)).unwrap().credits(), 1);
    }

    #[test]
    fn second_activation_violates_applier_invariant() {
        let (appliers, mut state) = setup();
        apply(&appliers, &mut state, 1, JobIntent::Created, JobRecord::new("foo"), 1).unwrap();
        apply(&appliers, &mut state, 1, JobIntent::Activated, activated_value(Duration::seconds(1)), 1)
            .unwrap();

        let err = apply(
            &appliers,
            &mut state,
            1,
            JobIntent::Activated,
            activated_value(Duration::seconds(1)),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidTransition { .. }));
    }

    #[test]
    fn failed_versions_differ_only_in_backoff() {
        for (version, expect_recur_at) in [(1u16, false), (2u16, true)] {
            let (appliers, mut state) = setup();
            apply(&appliers, &mut state, 1, JobIntent::Created, JobRecord::new("foo"), 1).unwrap();
            apply(&appliers, &mut state, 1, JobIntent::Activated, activated_value(Duration::seconds(1)), 1)
                .unwrap();

            let mut failed = JobRecord::new("foo").with_retries(2).with_retry_backoff_ms(500);
            failed.recur_at = Some(Utc::now() + Duration::milliseconds(500));
            apply(&appliers, &mut state, 1, JobIntent::Failed, failed, version).unwrap();

            let job = state.jobs().get(Key::new(1)).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.deadline(), None);
            assert_eq!(job.record.recur_at.is_some(), expect_recur_at);
            assert_eq!(job.is_activatable(), !expect_recur_at);
        }
    }

    #[test]
    fn timed_out_job_is_activatable_again() {
        let (appliers, mut state) = setup();
        apply(&appliers, &mut state, 1, JobIntent::Created, JobRecord::new("foo"), 1).unwrap();
        apply(&appliers, &mut state, 1, JobIntent::Activated, activated_value(Duration::seconds(-1)), 1)
            .unwrap();
        apply(&appliers, &mut state, 1, JobIntent::TimedOut, JobRecord::new("foo"), 1).unwrap();

        let job = state.jobs().get(Key::new(1)).unwrap();
        assert_eq!(job.status, JobStatus::TimedOut);
        assert_eq!(job.deadline(), None);
        assert_eq!(state.jobs().activatable("foo").collect::<Vec<_>>(), vec![Key::new(1)]);
    }

    #[test]
    fn retries_update_moves_failed_job_back_to_created() {
        let (appliers, mut state) = setup();
        apply(&appliers, &mut state, 1, JobIntent::Created, JobRecord::new("foo"), 1).unwrap();
        apply(&appliers, &mut state, 1, JobIntent::Activated, activated_value(Duration::seconds(1)), 1)
            .unwrap();
        apply(&appliers, &mut state, 1, JobIntent::Failed, JobRecord::new("foo"), 2).unwrap();
        assert!(!state.jobs().get(Key::new(1)).unwrap().is_activatable());

        apply(
            &appliers,
            &mut state,
            1,
            JobIntent::RetriesUpdated,
            JobRecord::new("foo").with_retries(1),
            1,
        )
        .unwrap();
        let job = state.jobs().get(Key::new(1)).unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.record.retries, 1);
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        let (appliers, mut state) = setup();
        let err = apply(
            &appliers,
            &mut state,
            1,
            JobIntent::Created,
            JobSubscriptionRecord::new("foo", "w", 1),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::UnexpectedValue { .. }));
    }

    #[test]
    fn closing_unknown_subscription_is_fatal() {
        let (appliers, mut state) = setup();
        let err = apply(
            &appliers,
            &mut state,
            5,
            JobSubscriptionIntent::Closed,
            JobSubscriptionRecord::default(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::MissingEntity { .. }));
    }
}
