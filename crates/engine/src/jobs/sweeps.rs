//! Background sweeps over job state.
//!
//! A sweep never touches state itself. It scans for due jobs and returns commands; the
//! partition feeds them through the regular pipeline, where each one is re-validated
//! before anything is written. A job that completed between scan and processing simply
//! gets its expiry command rejected.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use logflow_core::RecordKey;
use logflow_protocol::JobIntent;

use crate::state::ProcessingState;
use crate::stream_processor::CommandRequest;

/// A periodic check that turns due jobs into commands.
pub trait ScheduledSweep: Send {
    fn name(&self) -> &'static str;

    fn is_due(&self, now: DateTime<Utc>) -> bool;

    /// Scan `state` and return one command per due job. Marks the sweep as run at `now`.
    fn check(&mut self, state: &ProcessingState, now: DateTime<Utc>) -> Vec<CommandRequest>;
}

#[derive(Debug, Clone)]
struct Schedule {
    interval: TimeDelta,
    last_run: Option<DateTime<Utc>>,
}

impl Schedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            last_run: None,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.interval,
        }
    }
}

/// Emits `JOB TIME_OUT` for activated jobs whose deadline has passed.
#[derive(Debug, Clone)]
pub struct JobTimeoutChecker {
    schedule: Schedule,
}

impl JobTimeoutChecker {
    pub fn new(interval: Duration) -> Self {
        Self {
            schedule: Schedule::new(interval),
        }
    }
}

impl ScheduledSweep for JobTimeoutChecker {
    fn name(&self) -> &'static str {
        "job-timeout"
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_due(now)
    }

    fn check(&mut self, state: &ProcessingState, now: DateTime<Utc>) -> Vec<CommandRequest> {
        self.schedule.last_run = Some(now);
        let commands: Vec<_> = state
            .jobs()
            .expired(now)
            .into_iter()
            .filter_map(|key| state.jobs().get(key))
            .map(|job| {
                CommandRequest::new(JobIntent::TimeOut, job.record.clone())
                    .with_key(RecordKey::Explicit(job.key))
            })
            .collect();
        if !commands.is_empty() {
            debug!(expired = commands.len(), "job deadlines passed");
        }
        commands
    }
}

/// Emits `JOB RECUR_AFTER_BACKOFF` for failed jobs whose backoff has elapsed.
#[derive(Debug, Clone)]
pub struct JobBackoffChecker {
    schedule: Schedule,
}

impl JobBackoffChecker {
    pub fn new(interval: Duration) -> Self {
        Self {
            schedule: Schedule::new(interval),
        }
    }
}

impl ScheduledSweep for JobBackoffChecker {
    fn name(&self) -> &'static str {
        "job-backoff"
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_due(now)
    }

    fn check(&mut self, state: &ProcessingState, now: DateTime<Utc>) -> Vec<CommandRequest> {
        self.schedule.last_run = Some(now);
        let commands: Vec<_> = state
            .jobs()
            .backoff_elapsed(now)
            .into_iter()
            .filter_map(|key| state.jobs().get(key))
            .map(|job| {
                CommandRequest::new(JobIntent::RecurAfterBackoff, job.record.clone())
                    .with_key(RecordKey::Explicit(job.key))
            })
            .collect();
        if !commands.is_empty() {
            debug!(due = commands.len(), "job backoffs elapsed");
        }
        commands
    }
}
