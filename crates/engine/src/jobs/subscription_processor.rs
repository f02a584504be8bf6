//! `JOB_SUBSCRIPTION` commands: the credit-based push registry.
//!
//! Opening a subscription or topping up its credits immediately hands waiting jobs to it.

use logflow_core::{Key, Rejection, RejectionResult};
use logflow_protocol::{
    Intent, JobSubscriptionIntent, JobSubscriptionRecord, LoggedRecord, ValueType,
};

use crate::processor::{ProcessingError, RecordProcessor};
use crate::state::{ProcessingState, Subscription};
use crate::writers::Writers;

use super::behavior::{JobActivationBehavior, deadline_after};

#[derive(Debug)]
pub struct JobSubscriptionProcessor {
    behavior: JobActivationBehavior,
}

impl JobSubscriptionProcessor {
    pub fn new(behavior: JobActivationBehavior) -> Self {
        Self { behavior }
    }

    fn open(
        &self,
        command: &LoggedRecord,
        value: &JobSubscriptionRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let checked = if value.job_type.is_empty() {
            Err(Rejection::invalid_argument(
                "Expected to subscribe to a non-empty job type, but it was empty",
            ))
        } else if value.worker.is_empty() {
            Err(Rejection::invalid_argument(
                "Expected to subscribe a named worker, but the worker was empty",
            ))
        } else if deadline_after(command.timestamp(), value.timeout_ms).is_none() {
            Err(Rejection::invalid_argument(format!(
                "Expected to subscribe with a positive activation timeout, but it was {}",
                value.timeout_ms
            )))
        } else if value.credits < 0 {
            Err(Rejection::invalid_argument(format!(
                "Expected to subscribe with credits >= 0, but it was {}",
                value.credits
            )))
        } else if writers.processing_state().subscriptions().get(key).is_some() {
            Err(Rejection::already_exists(format!(
                "Expected to open subscription with key '{key}', but it is already open"
            )))
        } else {
            Ok(())
        };
        if let Err(rejection) = checked {
            return Ok(writers.reject(command, &rejection)?);
        }

        writers
            .state()
            .append_follow_up_event(key, JobSubscriptionIntent::Opened, value.clone())?;
        writers.response().write_event_on_command(
            key,
            JobSubscriptionIntent::Opened,
            value.clone(),
            command,
        );
        self.behavior
            .push_to_subscriber(writers, key, command.timestamp())?;
        Ok(())
    }

    fn add_credits(
        &self,
        command: &LoggedRecord,
        value: &JobSubscriptionRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let key = command.key();
        let checked = if value.credits < 1 {
            Err(Rejection::invalid_argument(format!(
                "Expected to add a positive amount of credits, but it was {}",
                value.credits
            )))
        } else {
            open_subscription(writers.processing_state(), key).and_then(|subscription| {
                subscription
                    .credits()
                    .checked_add(value.credits)
                    .map(|total| (subscription, total))
                    .ok_or_else(|| {
                        Rejection::invalid_argument(format!(
                            "Expected credits of subscription '{key}' to stay representable, but adding {} overflows",
                            value.credits
                        ))
                    })
            })
        };
        let (subscription, total) = match checked {
            Ok(checked) => checked,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        let record = subscription.record.with_credits(total);
        writers.state().append_follow_up_event(
            key,
            JobSubscriptionIntent::CreditsAdded,
            record.clone(),
        )?;
        writers.response().write_event_on_command(
            key,
            JobSubscriptionIntent::CreditsAdded,
            record,
            command,
        );
        self.behavior
            .push_to_subscriber(writers, key, command.timestamp())?;
        Ok(())
    }

    fn close(&self, command: &LoggedRecord, writers: &mut Writers<'_>) -> Result<(), ProcessingError> {
        let key = command.key();
        let subscription = match open_subscription(writers.processing_state(), key) {
            Ok(subscription) => subscription,
            Err(rejection) => return Ok(writers.reject(command, &rejection)?),
        };

        writers.state().append_follow_up_event(
            key,
            JobSubscriptionIntent::Closed,
            subscription.record.clone(),
        )?;
        writers.response().write_event_on_command(
            key,
            JobSubscriptionIntent::Closed,
            subscription.record,
            command,
        );
        Ok(())
    }
}

impl RecordProcessor for JobSubscriptionProcessor {
    fn value_type(&self) -> ValueType {
        ValueType::JobSubscription
    }

    fn process(
        &mut self,
        command: &LoggedRecord,
        writers: &mut Writers<'_>,
    ) -> Result<(), ProcessingError> {
        let value = command
            .value()
            .as_job_subscription()
            .ok_or(ProcessingError::UnexpectedValue {
                intent: command.intent(),
                expected: ValueType::JobSubscription,
            })?;
        match command.intent() {
            Intent::JobSubscription(JobSubscriptionIntent::Open) => self.open(command, value, writers),
            Intent::JobSubscription(JobSubscriptionIntent::AddCredits) => {
                self.add_credits(command, value, writers)
            }
            Intent::JobSubscription(JobSubscriptionIntent::Close) => self.close(command, writers),
            other => Err(ProcessingError::UnsupportedIntent(other)),
        }
    }
}

fn open_subscription(state: &ProcessingState, key: Key) -> RejectionResult<Subscription> {
    state.subscriptions().get(key).cloned().ok_or_else(|| {
        Rejection::not_found(format!(
            "Expected subscription with key '{key}' to be open, but no such subscription was found"
        ))
    })
}
