//! Intents: the verb (command) or fact (event) a record represents within its value type.

use serde::{Deserialize, Serialize};

use crate::record::ValueType;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobIntent {
    Create,
    Created,

    /// Exclusive claim of one job by key (the legacy `LOCK` command).
    Activate,
    Activated,

    Complete,
    Completed,

    Fail,
    Failed,

    Cancel,
    Canceled,

    UpdateRetries,
    RetriesUpdated,

    /// Expiry of an activation whose deadline passed (the legacy `EXPIRE_LOCK`).
    TimeOut,
    TimedOut,

    RecurAfterBackoff,
    RecurredAfterBackoff,
}

impl JobIntent {
    pub fn is_event(self) -> bool {
        matches!(
            self,
            JobIntent::Created
                | JobIntent::Activated
                | JobIntent::Completed
                | JobIntent::Failed
                | JobIntent::Canceled
                | JobIntent::RetriesUpdated
                | JobIntent::TimedOut
                | JobIntent::RecurredAfterBackoff
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobIntent::Create => "CREATE",
            JobIntent::Created => "CREATED",
            JobIntent::Activate => "ACTIVATE",
            JobIntent::Activated => "ACTIVATED",
            JobIntent::Complete => "COMPLETE",
            JobIntent::Completed => "COMPLETED",
            JobIntent::Fail => "FAIL",
            JobIntent::Failed => "FAILED",
            JobIntent::Cancel => "CANCEL",
            JobIntent::Canceled => "CANCELED",
            JobIntent::UpdateRetries => "UPDATE_RETRIES",
            JobIntent::RetriesUpdated => "RETRIES_UPDATED",
            JobIntent::TimeOut => "TIME_OUT",
            JobIntent::TimedOut => "TIMED_OUT",
            JobIntent::RecurAfterBackoff => "RECUR_AFTER_BACKOFF",
            JobIntent::RecurredAfterBackoff => "RECURRED_AFTER_BACKOFF",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobBatchIntent {
    Activate,
    Activated,
}

impl JobBatchIntent {
    pub fn is_event(self) -> bool {
        matches!(self, JobBatchIntent::Activated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobBatchIntent::Activate => "ACTIVATE",
            JobBatchIntent::Activated => "ACTIVATED",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobSubscriptionIntent {
    Open,
    Opened,
    AddCredits,
    CreditsAdded,
    Close,
    Closed,
}

impl JobSubscriptionIntent {
    pub fn is_event(self) -> bool {
        matches!(
            self,
            JobSubscriptionIntent::Opened
                | JobSubscriptionIntent::CreditsAdded
                | JobSubscriptionIntent::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobSubscriptionIntent::Open => "OPEN",
            JobSubscriptionIntent::Opened => "OPENED",
            JobSubscriptionIntent::AddCredits => "ADD_CREDITS",
            JobSubscriptionIntent::CreditsAdded => "CREDITS_ADDED",
            JobSubscriptionIntent::Close => "CLOSE",
            JobSubscriptionIntent::Closed => "CLOSED",
        }
    }
}

/// Intent of a record, scoped by its value type.
///
/// The value type is carried by the variant, so a record can never pair a job intent with a
/// subscription value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "valueType", content = "name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Job(JobIntent),
    JobBatch(JobBatchIntent),
    JobSubscription(JobSubscriptionIntent),
}

impl Intent {
    pub fn value_type(self) -> ValueType {
        match self {
            Intent::Job(_) => ValueType::Job,
            Intent::JobBatch(_) => ValueType::JobBatch,
            Intent::JobSubscription(_) => ValueType::JobSubscription,
        }
    }

    pub fn is_event(self) -> bool {
        match self {
            Intent::Job(intent) => intent.is_event(),
            Intent::JobBatch(intent) => intent.is_event(),
            Intent::JobSubscription(intent) => intent.is_event(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Job(intent) => intent.as_str(),
            Intent::JobBatch(intent) => intent.as_str(),
            Intent::JobSubscription(intent) => intent.as_str(),
        }
    }
}

impl From<JobIntent> for Intent {
    fn from(value: JobIntent) -> Self {
        Intent::Job(value)
    }
}

impl From<JobBatchIntent> for Intent {
    fn from(value: JobBatchIntent) -> Self {
        Intent::JobBatch(value)
    }
}

impl From<JobSubscriptionIntent> for Intent {
    fn from(value: JobSubscriptionIntent) -> Self {
        Intent::JobSubscription(value)
    }
}

impl core::fmt::Display for Intent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.value_type(), self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_verb_on_different_value_types_stays_distinct() {
        let job: Intent = JobIntent::Activate.into();
        let batch: Intent = JobBatchIntent::Activate.into();
        assert_ne!(job, batch);

        let decoded: Intent =
            serde_json::from_str(&serde_json::to_string(&batch).unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn intent_wire_form_names_value_type() {
        let json = serde_json::to_value(Intent::from(JobIntent::TimedOut)).unwrap();
        assert_eq!(json, serde_json::json!({ "valueType": "JOB", "name": "TIMED_OUT" }));
    }

    #[test]
    fn commands_and_events_are_classified() {
        assert!(!Intent::from(JobIntent::TimeOut).is_event());
        assert!(Intent::from(JobIntent::TimedOut).is_event());
        assert!(Intent::from(JobSubscriptionIntent::CreditsAdded).is_event());
        assert!(!Intent::from(JobBatchIntent::Activate).is_event());
    }
}
