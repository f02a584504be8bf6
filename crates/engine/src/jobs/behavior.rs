//! Push activation: handing activatable jobs to subscribers with credits.
//!
//! Runs inside the processing of the command that made a job activatable or gave a
//! subscriber credits, so every push is an ordinary `JOB ACTIVATED` event in the same batch.
//! The applier takes one credit per activation; the job itself is delivered by a post-commit
//! task once the batch is durable.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use logflow_core::Key;
use logflow_protocol::{JobIntent, JobRecord, RecordValue};

use crate::processor::ProcessingError;
use crate::state::{Job, Subscription};
use crate::writers::Writers;

use super::streamer::{ActivatedJob, JobStreamer};

/// `now + timeout_ms`, or `None` if the timeout is not positive or overflows.
pub fn deadline_after(now: DateTime<Utc>, timeout_ms: i64) -> Option<DateTime<Utc>> {
    if timeout_ms <= 0 {
        return None;
    }
    now.checked_add_signed(TimeDelta::try_milliseconds(timeout_ms)?)
}

/// Copy of `job` as it looks once activated by `worker`.
pub fn activated_record(
    job: &Job,
    worker: &str,
    timeout_ms: i64,
    deadline: DateTime<Utc>,
) -> JobRecord {
    let mut record = job.record.clone();
    record.worker = worker.to_string();
    record.timeout_ms = timeout_ms;
    record.deadline = Some(deadline);
    record.subscriber_key = None;
    record.recur_at = None;
    record
}

#[derive(Clone)]
pub struct JobActivationBehavior {
    streamer: Arc<dyn JobStreamer>,
}

impl JobActivationBehavior {
    pub fn new(streamer: Arc<dyn JobStreamer>) -> Self {
        Self { streamer }
    }

    /// Offer the job at `job_key` to the best subscriber of its type.
    ///
    /// Returns whether the job was activated. A job that is not activatable, has no
    /// subscriber with credits or does not fit into the batch stays where it is.
    pub fn push_job(
        &self,
        writers: &mut Writers<'_>,
        job_key: Key,
        now: DateTime<Utc>,
    ) -> Result<bool, ProcessingError> {
        let state = writers.processing_state();
        let Some(job) = state.jobs().get(job_key).filter(|job| job.is_activatable()) else {
            return Ok(false);
        };
        let Some(subscription) = state.subscriptions().best_subscriber(job.job_type()) else {
            return Ok(false);
        };
        let (job, subscription) = (job.clone(), subscription.clone());
        self.activate_for(writers, &job, &subscription, now)
    }

    /// Activate waiting jobs for `subscriber_key` until it runs out of credits or jobs.
    pub fn push_to_subscriber(
        &self,
        writers: &mut Writers<'_>,
        subscriber_key: Key,
        now: DateTime<Utc>,
    ) -> Result<usize, ProcessingError> {
        let mut pushed = 0;
        loop {
            let state = writers.processing_state();
            let Some(subscription) = state
                .subscriptions()
                .get(subscriber_key)
                .filter(|s| s.has_credits())
                .cloned()
            else {
                break;
            };
            let Some(job) = state
                .jobs()
                .activatable(&subscription.record.job_type)
                .next()
                .and_then(|key| state.jobs().get(key))
                .cloned()
            else {
                break;
            };
            if !self.activate_for(writers, &job, &subscription, now)? {
                break;
            }
            pushed += 1;
        }
        Ok(pushed)
    }

    fn activate_for(
        &self,
        writers: &mut Writers<'_>,
        job: &Job,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool, ProcessingError> {
        let Some(deadline) = deadline_after(now, subscription.record.timeout_ms) else {
            return Ok(false);
        };
        let mut record = activated_record(
            job,
            &subscription.record.worker,
            subscription.record.timeout_ms,
            deadline,
        );
        record.subscriber_key = Some(subscription.key);

        let value = RecordValue::from(record.clone());
        let length = writers.state().event_length(JobIntent::Activated, &value)?;
        if !writers.state().can_write_event_of_length(length) {
            debug!(job_key = %job.key, subscriber_key = %subscription.key, "push skipped, batch full");
            return Ok(false);
        }
        writers
            .state()
            .append_follow_up_event(job.key, JobIntent::Activated, value)?;

        let streamer = self.streamer.clone();
        let activated = ActivatedJob {
            key: job.key,
            subscriber_key: subscription.key,
            record,
        };
        writers.append_post_commit_task(move || streamer.push(activated));
        debug!(job_key = %job.key, subscriber_key = %subscription.key, "job pushed");
        Ok(true)
    }
}

impl core::fmt::Debug for JobActivationBehavior {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobActivationBehavior").finish_non_exhaustive()
    }
}
