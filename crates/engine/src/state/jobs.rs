use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use logflow_core::Key;
use logflow_protocol::JobRecord;

use super::journal::Journal;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Activated,
    Completed,
    Failed,
    Canceled,
    /// The activation expired; the job is back in the activatable pool.
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Canceled)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            JobStatus::Created => "CREATED",
            JobStatus::Activated => "ACTIVATED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::TimedOut => "TIMED_OUT",
        })
    }
}

/// A job as held in processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: Key,
    pub status: JobStatus,
    pub record: JobRecord,
}

impl Job {
    /// Whether a worker may claim the job now.
    pub fn is_activatable(&self) -> bool {
        match self.status {
            JobStatus::Created | JobStatus::TimedOut => true,
            JobStatus::Failed => self.record.retries > 0 && self.record.recur_at.is_none(),
            _ => false,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.record.job_type
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.record.deadline
    }
}

#[derive(Debug, Clone, Default)]
struct JobIndices {
    /// Activatable jobs per type. Keys grow with creation, so key order is creation order.
    activatable: BTreeMap<String, BTreeSet<Key>>,
    deadlines: BTreeSet<(DateTime<Utc>, Key)>,
    backoffs: BTreeSet<(DateTime<Utc>, Key)>,
}

impl JobIndices {
    fn add(&mut self, job: &Job) {
        if job.is_activatable() {
            self.activatable
                .entry(job.record.job_type.clone())
                .or_default()
                .insert(job.key);
        }
        if job.status == JobStatus::Activated {
            if let Some(deadline) = job.record.deadline {
                self.deadlines.insert((deadline, job.key));
            }
        }
        if job.status == JobStatus::Failed {
            if let Some(recur_at) = job.record.recur_at {
                self.backoffs.insert((recur_at, job.key));
            }
        }
    }

    fn remove(&mut self, job: &Job) {
        if let Some(keys) = self.activatable.get_mut(&job.record.job_type) {
            keys.remove(&job.key);
            if keys.is_empty() {
                self.activatable.remove(&job.record.job_type);
            }
        }
        if let Some(deadline) = job.record.deadline {
            self.deadlines.remove(&(deadline, job.key));
        }
        if let Some(recur_at) = job.record.recur_at {
            self.backoffs.remove(&(recur_at, job.key));
        }
    }
}

/// All jobs of the partition plus lookup indices for activation and the expiry sweeps.
///
/// Jobs are never removed; terminal jobs stay with their final status.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    jobs: BTreeMap<Key, Job>,
    indices: JobIndices,
    journal: Journal<Job>,
}

impl JobState {
    pub fn get(&self, key: Key) -> Option<&Job> {
        self.jobs.get(&key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.jobs.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Insert or replace a job, keeping the indices in sync.
    pub fn put(&mut self, job: Job) {
        let key = job.key;
        self.journal.record(key, self.jobs.get(&key));

        if let Some(previous) = self.jobs.get(&key) {
            self.indices.remove(previous);
        }
        self.indices.add(&job);
        self.jobs.insert(key, job);
    }

    /// Activatable jobs of `job_type`, oldest first.
    pub fn activatable(&self, job_type: &str) -> impl Iterator<Item = Key> + '_ {
        self.indices
            .activatable
            .get(job_type)
            .into_iter()
            .flat_map(|keys| keys.iter().copied())
    }

    /// Activated jobs whose deadline is at or before `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Key> {
        self.indices
            .deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, key)| *key)
            .collect()
    }

    /// Failed jobs whose retry backoff elapsed at or before `now`.
    pub fn backoff_elapsed(&self, now: DateTime<Utc>) -> Vec<Key> {
        self.indices
            .backoffs
            .iter()
            .take_while(|(recur_at, _)| *recur_at <= now)
            .map(|(_, key)| *key)
            .collect()
    }

    pub(crate) fn begin(&mut self) {
        self.journal.begin();
    }

    pub(crate) fn commit(&mut self) {
        self.journal.commit();
    }

    pub(crate) fn rollback(&mut self) {
        for (key, prior) in self.journal.take() {
            if let Some(current) = self.jobs.remove(&key) {
                self.indices.remove(&current);
            }
            if let Some(prior) = prior {
                self.indices.add(&prior);
                self.jobs.insert(key, prior);
            }
        }
    }

    fn from_jobs(jobs: Vec<Job>) -> Self {
        let mut state = Self::default();
        for job in jobs {
            state.put(job);
        }
        state
    }
}

impl PartialEq for JobState {
    fn eq(&self, other: &Self) -> bool {
        self.jobs == other.jobs
    }
}

impl Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.jobs.values())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Job>::deserialize(deserializer).map(Self::from_jobs)
    }
}
