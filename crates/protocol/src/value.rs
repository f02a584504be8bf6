//! Typed record payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use logflow_core::Key;

use crate::record::ValueType;

/// Job variables: an object-shaped JSON document.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Payload of `JOB` records.
///
/// Commands only fill the fields their intent reads; events carry the full job as it looks
/// after the event is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRecord {
    #[serde(rename = "type")]
    pub job_type: String,
    pub worker: String,
    pub retries: i32,
    /// Activation duration in milliseconds requested by a keyed activation.
    pub timeout_ms: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub variables: Variables,
    pub custom_headers: BTreeMap<String, String>,
    pub error_code: String,
    pub error_message: String,
    /// Subscriber that receives the job when it was pushed through a subscription.
    pub subscriber_key: Option<Key>,
    /// Delay in milliseconds before a failed job with retries left becomes activatable.
    pub retry_backoff_ms: i64,
    pub recur_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = code.into();
        self.error_message = message.into();
        self
    }

    pub fn with_subscriber(mut self, subscriber_key: Key) -> Self {
        self.subscriber_key = Some(subscriber_key);
        self
    }

    pub fn with_retry_backoff_ms(mut self, retry_backoff_ms: i64) -> Self {
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }
}

/// Payload of `JOB_BATCH` records: a pull activation request and its result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobBatchRecord {
    #[serde(rename = "type")]
    pub job_type: String,
    pub worker: String,
    pub timeout_ms: i64,
    pub max_jobs_to_activate: i32,
    pub job_keys: Vec<Key>,
    pub jobs: Vec<JobRecord>,
    pub truncated: bool,
}

impl JobBatchRecord {
    pub fn new(
        job_type: impl Into<String>,
        worker: impl Into<String>,
        timeout_ms: i64,
        max_jobs_to_activate: i32,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            worker: worker.into(),
            timeout_ms,
            max_jobs_to_activate,
            ..Self::default()
        }
    }
}

/// Payload of `JOB_SUBSCRIPTION` records. The subscriber key is the record key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSubscriptionRecord {
    #[serde(rename = "type")]
    pub job_type: String,
    pub worker: String,
    pub timeout_ms: i64,
    pub credits: i32,
}

impl JobSubscriptionRecord {
    pub fn new(job_type: impl Into<String>, worker: impl Into<String>, timeout_ms: i64) -> Self {
        Self {
            job_type: job_type.into(),
            worker: worker.into(),
            timeout_ms,
            credits: 0,
        }
    }

    pub fn with_credits(mut self, credits: i32) -> Self {
        self.credits = credits;
        self
    }
}

/// Value of a record, tagged with its value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    Job(JobRecord),
    JobBatch(JobBatchRecord),
    JobSubscription(JobSubscriptionRecord),
}

impl RecordValue {
    /// A value of `value_type` with every field at its default.
    pub fn empty(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Job => JobRecord::default().into(),
            ValueType::JobBatch => JobBatchRecord::default().into(),
            ValueType::JobSubscription => JobSubscriptionRecord::default().into(),
        }
    }

    /// Copy without the unbounded parts: variables, headers, error message and batch jobs.
    pub fn without_payload(&self) -> Self {
        match self {
            RecordValue::Job(job) => RecordValue::Job(JobRecord {
                variables: Variables::new(),
                custom_headers: BTreeMap::new(),
                error_message: String::new(),
                ..job.clone()
            }),
            RecordValue::JobBatch(batch) => RecordValue::JobBatch(JobBatchRecord {
                job_keys: Vec::new(),
                jobs: Vec::new(),
                ..batch.clone()
            }),
            RecordValue::JobSubscription(subscription) => {
                RecordValue::JobSubscription(subscription.clone())
            }
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Job(_) => ValueType::Job,
            RecordValue::JobBatch(_) => ValueType::JobBatch,
            RecordValue::JobSubscription(_) => ValueType::JobSubscription,
        }
    }

    pub fn as_job(&self) -> Option<&JobRecord> {
        match self {
            RecordValue::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn as_job_batch(&self) -> Option<&JobBatchRecord> {
        match self {
            RecordValue::JobBatch(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn as_job_subscription(&self) -> Option<&JobSubscriptionRecord> {
        match self {
            RecordValue::JobSubscription(subscription) => Some(subscription),
            _ => None,
        }
    }
}

impl From<JobRecord> for RecordValue {
    fn from(value: JobRecord) -> Self {
        RecordValue::Job(value)
    }
}

impl From<JobBatchRecord> for RecordValue {
    fn from(value: JobBatchRecord) -> Self {
        RecordValue::JobBatch(value)
    }
}

impl From<JobSubscriptionRecord> for RecordValue {
    fn from(value: JobSubscriptionRecord) -> Self {
        RecordValue::JobSubscription(value)
    }
}
