//! Delivery of pushed jobs to subscribed workers.

use std::sync::{Arc, Mutex};

use tracing::warn;

use logflow_core::Key;
use logflow_protocol::JobRecord;

/// A job activated for a subscriber, as handed to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivatedJob {
    pub key: Key,
    pub subscriber_key: Key,
    pub record: JobRecord,
}

/// Transport towards subscribed workers. Called only after the activation is durable.
pub trait JobStreamer: Send + Sync {
    fn push(&self, job: ActivatedJob);
}

impl<S> JobStreamer for Arc<S>
where
    S: JobStreamer + ?Sized,
{
    fn push(&self, job: ActivatedJob) {
        (**self).push(job)
    }
}

/// Keeps pushed jobs in memory until the worker side takes them.
#[derive(Debug, Default)]
pub struct InMemoryJobStreamer {
    pushed: Mutex<Vec<ActivatedJob>>,
}

impl InMemoryJobStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<ActivatedJob> {
        self.pushed
            .lock()
            .map(|pushed| pushed.clone())
            .unwrap_or_default()
    }

    /// Remove and return the jobs pushed to `subscriber_key`.
    pub fn take_for(&self, subscriber_key: Key) -> Vec<ActivatedJob> {
        let Ok(mut pushed) = self.pushed.lock() else {
            return Vec::new();
        };
        let (taken, kept) = pushed
            .drain(..)
            .partition(|job| job.subscriber_key == subscriber_key);
        *pushed = kept;
        taken
    }
}

impl JobStreamer for InMemoryJobStreamer {
    fn push(&self, job: ActivatedJob) {
        match self.pushed.lock() {
            Ok(mut pushed) => pushed.push(job),
            Err(_) => warn!(job_key = %job.key, "job streamer lock poisoned; push dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(key: u64, subscriber: u64) -> ActivatedJob {
        ActivatedJob {
            key: Key::new(key),
            subscriber_key: Key::new(subscriber),
            record: JobRecord::new("foo"),
        }
    }

    #[test]
    fn take_for_only_removes_that_subscribers_jobs() {
        let streamer = InMemoryJobStreamer::new();
        streamer.push(job(1, 10));
        streamer.push(job(2, 20));
        streamer.push(job(3, 10));

        let taken = streamer.take_for(Key::new(10));
        assert_eq!(
            taken.iter().map(|j| j.key.get()).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(streamer.pushed(), vec![job(2, 20)]);
    }
}
