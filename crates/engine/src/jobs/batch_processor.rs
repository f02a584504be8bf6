//! `JOB_BATCH ACTIVATE`: pull activation of up to `maxJobsToActivate` jobs of one type.
//!
//! Jobs are taken in creation order. Each activation is its own `JOB ACTIVATED` event and
//! the batch closes with a `JOB_BATCH ACTIVATED` summary carrying the activated jobs and the
//! `truncated` flag. Capacity is checked before every append, including the room the
//! summary still needs, so a full batch ends the scan instead of failing the command.

use logflow_core::{Key, Rejection, RejectionType};
use logflow_protocol::{
    Intent, JobBatchIntent, JobBatchRecord, JobIntent, LoggedRecord, RecordValue, ValueType,
};

use crate::processor::{ProcessingError, RecordProcessor};
use crate::writers::Writers;

use super::behavior::{activated_record, deadline_after};

#[derive(Debug, Default)]
pub struct JobBatchActivateProcessor;

impl JobBatchActivateProcessor {
    pub fn new() -> Self {
        Self
    }

    fn activate(
        &self,
        command: &LoggedRecord,
        request: &JobBatchRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let now = command.timestamp();
        let checked = if request.job_type.is_empty() {
            Err(Rejection::invalid_argument(
                "Expected to activate jobs of a non-empty type, but it was empty",
            ))
        } else if request.worker.is_empty() {
            Err(Rejection::invalid_argument(
                "Expected to activate jobs for a named worker, but the worker was empty",
            ))
        } else if request.max_jobs_to_activate < 1 {
            Err(Rejection::invalid_argument(format!(
                "Expected to activate at least one job, but max jobs to activate was {}",
                request.max_jobs_to_activate
            )))
        } else {
            deadline_after(now, request.timeout_ms).ok_or_else(|| {
                Rejection::invalid_argument(format!(
                    "Expected to activate jobs with a positive timeout, but it was {}",
                    request.timeout_ms
                ))
            })
        };
        let deadline = match checked {
            Ok(deadline) => deadline,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let limit = request.max_jobs_to_activate as usize;
        let state = writers.processing_state();
        let candidates: Vec<_> = state
            .jobs()
            .activatable(&request.job_type)
            .take(limit + 1)
            .filter_map(|key| state.jobs().get(key).cloned())
            .collect();

        let mut summary = JobBatchRecord {
            job_keys: Vec::new(),
            jobs: Vec::new(),
            truncated: false,
            ..request.clone()
        };
        let mut exceeded_capacity = false;
        for job in candidates.iter().take(limit) {
            let record = activated_record(job, &request.worker, request.timeout_ms, deadline);
            let event = RecordValue::from(record.clone());

            let mut grown = summary.clone();
            grown.job_keys.push(job.key);
            grown.jobs.push(record);
            let job_length = writers.state().event_length(JobIntent::Activated, &event)?;
            let summary_length = writers
                .state()
                .event_length(JobBatchIntent::Activated, &grown.clone().into())?;
            if !writers
                .state()
                .can_write_events_of_length(&[job_length, summary_length])
            {
                exceeded_capacity = true;
                break;
            }

            writers
                .state()
                .append_follow_up_event(job.key, JobIntent::Activated, event)?;
            summary = grown;
        }

        if exceeded_capacity && summary.jobs.is_empty() {
            let rejection = Rejection::new(
                RejectionType::ExceededBatchRecordSize,
                format!(
                    "Expected to activate jobs of type '{}', but not even one job fits into a batch of {} bytes",
                    request.job_type,
                    writers.state().max_fragment_size()
                ),
            );
            return Ok(writers.reject(command, &rejection)?);
        }

        summary.truncated = exceeded_capacity || candidates.len() > summary.jobs.len();
        let key: Key = command.key();
        writers
            .state()
            .append_follow_up_event(key, JobBatchIntent::Activated, summary.clone())?;
        writers
            .response()
            .write_event_on_command(key, JobBatchIntent::Activated, summary, command);
        Ok(())
    }
}

impl RecordProcessor for JobBatchActivateProcessor {
    fn value_type(&self) -> ValueType {
        ValueType::JobBatch
    }

    fn process(
        &mut self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let request = command
            .value()
            .as_job_batch()
            .ok_or(ProcessingError::UnexpectedValue {
                intent: command.intent(),
                expected: ValueType::JobBatch,
            })?;
        match command.intent() {
            Intent::JobBatch(JobBatchIntent::Activate) => self.activate(command, request, writers),
            other => Err(ProcessingError::UnsupportedIntent(other)),
        }
    }
}
