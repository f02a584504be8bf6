//! Job lifecycle: processors, appliers, push activation and the expiry sweeps.

pub mod appliers;
pub mod batch_processor;
pub mod behavior;
pub mod job_processor;
pub mod streamer;
pub mod subscription_processor;
pub mod sweeps;

use std::sync::Arc;

pub use batch_processor::JobBatchActivateProcessor;
pub use behavior::JobActivationBehavior;
pub use job_processor::JobCommandProcessor;
pub use streamer::{ActivatedJob, InMemoryJobStreamer, JobStreamer};
pub use subscription_processor::JobSubscriptionProcessor;
pub use sweeps::{JobBackoffChecker, JobTimeoutChecker, ScheduledSweep};

use crate::config::EngineConfig;
use crate::processor::RecordProcessor;

/// The processors for `JOB`, `JOB_BATCH` and `JOB_SUBSCRIPTION` commands.
pub fn processors(streamer: Arc<dyn JobStreamer>) -> Vec<Box<dyn RecordProcessor>> {
    let behavior = JobActivationBehavior::new(streamer);
    vec![
        Box::new(JobCommandProcessor::new(behavior.clone())),
        Box::new(JobBatchActivateProcessor::new()),
        Box::new(JobSubscriptionProcessor::new(behavior)),
    ]
}

/// Timeout and backoff sweeps at the configured intervals.
pub fn sweeps(config: &EngineConfig) -> Vec<Box<dyn ScheduledSweep>> {
    vec![
        Box::new(JobTimeoutChecker::new(config.job_timeout_check_interval)),
        Box::new(JobBackoffChecker::new(config.job_backoff_check_interval)),
    ]
}
