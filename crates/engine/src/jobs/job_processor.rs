//! `JOB` commands: the per-job lifecycle state machine.
//!
//! ```text
//! CREATED ──ACTIVATE──▶ ACTIVATED ──COMPLETE──▶ COMPLETED
//!    ▲                    │  │  └──FAIL────────▶ FAILED ──UPDATE_RETRIES──▶ CREATED
//!    │                    │  └────CANCEL───────▶ CANCELED
//!    └──── TIMED_OUT ◀────┘ TIME_OUT
//! ```
//!
//! Every command is validated against the current state; invalid commands are rejected,
//! never ignored. Jobs that become activatable are offered to subscribers right away.

use chrono::{DateTime, Utc};

use logflow_core::{Key, Rejection, RejectionResult};
use logflow_protocol::{Intent, JobIntent, JobRecord, LoggedRecord, ValueType};

use crate::processor::{ProcessingError, RecordProcessor};
use crate::state::{Job, JobStatus, ProcessingState};
use crate::writers::Writers;

use super::behavior::{JobActivationBehavior, activated_record, deadline_after};

#[derive(Debug)]
pub struct JobCommandProcessor {
    behavior: JobActivationBehavior,
}

impl JobCommandProcessor {
    pub fn new(behavior: JobActivationBehavior) -> Self {
        Self { behavior }
    }

    fn create(
        &self,
        command: &LoggedRecord,
        value: &JobRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let checked = if value.job_type.is_empty() {
            Err(Rejection::invalid_argument(
                "Expected to create job with a non-empty type, but it was empty",
            ))
        } else if value.retries < 0 {
            Err(Rejection::invalid_argument(format!(
                "Expected to create job with retries >= 0, but it was {}",
                value.retries
            )))
        } else if writers.processing_state().jobs().contains(key) {
            Err(Rejection::already_exists(format!(
                "Expected to create job with key '{key}', but it already exists"
            )))
        } else {
            Ok(())
        };
        if let Err(rejection) = checked {
            return Ok(writers.reject(command, &rejection)?);
        }

        let mut record = value.clone();
        record.worker.clear();
        record.deadline = None;
        record.subscriber_key = None;
        record.recur_at = None;
        record.error_code.clear();
        record.error_message.clear();

        writers
            .state()
            .append_follow_up_event(key, JobIntent::Created, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::Created, record, command);
        self.behavior.push_job(writers, key, command.timestamp())?;
        Ok(())
    }

    fn activate(
        &self,
        command: &LoggedRecord,
        value: &JobRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let now = command.timestamp();
        let checked = check_activation(writers.processing_state(), key, value, now);
        let (job, deadline) = match checked {
            Ok(checked) => checked,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = activated_record(&job, &value.worker, value.timeout_ms, deadline);
        record.subscriber_key = value.subscriber_key;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::Activated, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::Activated, record, command);
        Ok(())
    }

    fn complete(
        &self,
        command: &LoggedRecord,
        value: &JobRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let job = match activated_job(writers.processing_state(), key, "complete") {
            Ok(job) => job,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = job.record;
        record.variables = value.variables.clone();
        record.deadline = None;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::Completed, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::Completed, record, command);
        Ok(())
    }

    fn fail(
        &self,
        command: &LoggedRecord,
        value: &JobRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let now = command.timestamp();
        let checked = activated_job(writers.processing_state(), key, "fail").and_then(|job| {
            let recur_at = check_failure(value, now)?;
            Ok((job, recur_at))
        });
        let (job, recur_at) = match checked {
            Ok(checked) => checked,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = job.record;
        record.retries = value.retries;
        record.error_code = value.error_code.clone();
        record.error_message = value.error_message.clone();
        record.retry_backoff_ms = value.retry_backoff_ms;
        record.deadline = None;
        record.recur_at = recur_at;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::Failed, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::Failed, record, command);
        self.behavior.push_job(writers, key, now)?;
        Ok(())
    }

    fn cancel(&self, command: &LoggedRecord, writers: &mut Writers<'_>) -> Result<(), ProcessingError> {
        let key = command.key();
        let job = match live_job(writers.processing_state(), key, "cancel") {
            Ok(job) => job,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = job.record;
        record.deadline = None;
        record.recur_at = None;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::Canceled, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::Canceled, record, command);
        Ok(())
    }

    fn update_retries(
        &self,
        command: &LoggedRecord,
        value: &JobRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let checked = if value.retries < 1 {
            Err(Rejection::invalid_argument(format!(
                "Expected to update retries of job with key '{key}' to a positive amount, but it was {}",
                value.retries
            )))
        } else {
            live_job(writers.processing_state(), key, "update retries of")
        };
        let job = match checked {
            Ok(job) => job,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = job.record;
        record.retries = value.retries;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::RetriesUpdated, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::RetriesUpdated, record, command);
        self.behavior.push_job(writers, key, command.timestamp())?;
        Ok(())
    }

    /// Issued by the timeout sweep. Re-validated here: the job may have moved on since.
    fn time_out(&self, command: &LoggedRecord, writers: &mut Writers<'_>) -> Result<(), ProcessingError> {
        let key = command.key();
        let now = command.timestamp();
        let checked = activated_job(writers.processing_state(), key, "time out").and_then(|job| {
            match job.deadline() {
                Some(deadline) if deadline <= now => Ok(job),
                _ => Err(Rejection::invalid_state(format!(
                    "Expected to time out job with key '{key}', but its deadline has not passed"
                ))),
            }
        });
        let job = match checked {
            Ok(job) => job,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = job.record;
        record.deadline = None;
        record.worker.clear();
        record.subscriber_key = None;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::TimedOut, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::TimedOut, record, command);
        self.behavior.push_job(writers, key, now)?;
        Ok(())
    }

    /// Issued by the backoff sweep once `recur_at` has passed.
    fn recur_after_backoff(
        &self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let now = command.timestamp();
        let checked = match writers.processing_state().jobs().get(key) {
            None => Err(not_found(key, "recur")),
            Some(job) if job.status != JobStatus::Failed => Err(Rejection::invalid_state(format!(
                "Expected to recur job with key '{key}' after backoff, but it is {}",
                job.status
            ))),
            Some(job) => match job.record.recur_at {
                Some(recur_at) if recur_at <= now => Ok(job.clone()),
                _ => Err(Rejection::invalid_state(format!(
                    "Expected to recur job with key '{key}' after backoff, but it is not due"
                ))),
            },
        };
        let job = match checked {
            Ok(job) => job,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let mut record = job.record;
        record.recur_at = None;
        writers
            .state()
            .append_follow_up_event(key, JobIntent::RecurredAfterBackoff, record.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobIntent::RecurredAfterBackoff, record, command);
        self.behavior.push_job(writers, key, now)?;
        Ok(())
    }
}

impl RecordProcessor for JobCommandProcessor {
    fn value_type(&self) -> ValueType {
        ValueType::Job
    }

    fn process(
        &mut self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let Intent::Job(intent) = command.intent() else {
            return Err(ProcessingError::UnsupportedIntent(command.intent()));
        };
        let value = command
            .value()
            .as_job()
            .ok_or(ProcessingError::UnexpectedValue {
                intent: command.intent(),
                expected: ValueType::Job,
            })?;

        match intent {
            JobIntent::Create => self.create(command, value, writers),
            JobIntent::Activate => self.activate(command, value, writers),
            JobIntent::Complete => self.complete(command, value, writers),
            JobIntent::Fail => self.fail(command, value, writers),
            JobIntent::Cancel => self.cancel(command, writers),
            JobIntent::UpdateRetries => self.update_retries(command, value, writers),
            JobIntent::TimeOut => self.time_out(command, writers),
            JobIntent::RecurAfterBackoff => self.recur_after_backoff(command, writers),
            event => Err(ProcessingError::UnsupportedIntent(event.into())),
        }
    }
}

fn not_found(key: Key, action: &str) -> Rejection {
    Rejection::not_found(format!(
        "Expected to {action} job with key '{key}', but no such job was found"
    ))
}

/// A job that exists and is not terminal.
fn live_job(state: &ProcessingState, key: Key, action: &str) -> RejectionResult<Job> {
    match state.jobs().get(key) {
        None => Err(not_found(key, action)),
        Some(job) if job.status.is_terminal() => Err(Rejection::invalid_state(format!(
            "Expected to {action} job with key '{key}', but it is already {}",
            job.status
        ))),
        Some(job) => Ok(job.clone()),
    }
}

fn activated_job(state: &ProcessingState, key: Key, action: &str) -> RejectionResult<Job> {
    let job = live_job(state, key, action)?;
    if job.status != JobStatus::Activated {
        return Err(Rejection::invalid_state(format!(
            "Expected to {action} job with key '{key}', but it is {}",
            job.status
        )));
    }
    Ok(job)
}

/// A keyed activation may claim only an activatable job, and only once.
fn check_activation(
    state: &ProcessingState,
    key: Key,
    value: &JobRecord,
    now: DateTime<Utc>,
) -> RejectionResult<(Job, DateTime<Utc>)> {
    if value.worker.is_empty() {
        return Err(Rejection::invalid_argument(format!(
            "Expected to activate job with key '{key}' for a named worker, but the worker was empty"
        )));
    }
    let deadline = deadline_after(now, value.timeout_ms).ok_or_else(|| {
        Rejection::invalid_argument(format!(
            "Expected to activate job with key '{key}' with a positive timeout, but it was {}",
            value.timeout_ms
        ))
    })?;

    let job = match state.jobs().get(key) {
        Some(job) if !job.status.is_terminal() => job,
        _ => return Err(not_found(key, "activate")),
    };
    if job.status == JobStatus::Activated {
        return Err(Rejection::invalid_state(format!(
            "Expected to activate job with key '{key}', but it is already activated"
        )));
    }
    if !job.is_activatable() {
        return Err(Rejection::invalid_state(format!(
            "Expected to activate job with key '{key}', but it is {} and not activatable",
            job.status
        )));
    }

    if let Some(subscriber_key) = value.subscriber_key {
        let subscription = state.subscriptions().get(subscriber_key).ok_or_else(|| {
            Rejection::not_found(format!(
                "Expected to activate job with key '{key}' for subscriber '{subscriber_key}', but no such subscription was found"
            ))
        })?;
        if subscription.record.job_type != job.record.job_type {
            return Err(Rejection::invalid_argument(format!(
                "Expected subscriber '{subscriber_key}' to subscribe to type '{}', but it subscribes to '{}'",
                job.record.job_type, subscription.record.job_type
            )));
        }
        if !subscription.has_credits() {
            return Err(Rejection::invalid_state(format!(
                "Expected subscriber '{subscriber_key}' to have credits, but it has none"
            )));
        }
    }

    Ok((job.clone(), deadline))
}

/// `recur_at` of a failure; only set when retries are left and a backoff was given.
fn check_failure(value: &JobRecord, now: DateTime<Utc>) -> RejectionResult<Option<DateTime<Utc>>> {
    if value.retries < 0 {
        return Err(Rejection::invalid_argument(format!(
            "Expected to fail job with retries >= 0, but it was {}",
            value.retries
        )));
    }
    if value.retry_backoff_ms < 0 {
        return Err(Rejection::invalid_argument(format!(
            "Expected to fail job with a retry backoff >= 0, but it was {}",
            value.retry_backoff_ms
        )));
    }
    if value.retries == 0 || value.retry_backoff_ms == 0 {
        return Ok(None);
    }
    deadline_after(now, value.retry_backoff_ms)
        .map(Some)
        .ok_or_else(|| {
            Rejection::invalid_argument(format!(
                "Expected a retry backoff that can be scheduled, but {} ms overflows",
                value.retry_backoff_ms
            ))
        })
}
