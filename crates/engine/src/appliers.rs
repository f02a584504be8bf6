//! Event applier registry.
//!
//! An applier is a pure function `(state, key, value) -> state change`, registered per
//! `(intent, record version)`. The same applier runs when an event is written and when it
//! is replayed, which is what keeps live and recovered state identical. Appliers may not
//! read the clock or do IO; everything time-related travels inside the event value.
//!
//! Writers stamp new events with the latest registered version of their intent. Replay uses
//! the version stored in the record, so a fix in a newer applier version never changes the
//! meaning of events already on the log.

use std::collections::HashMap;

use thiserror::Error;

use logflow_core::Key;
use logflow_protocol::{Intent, LoggedRecord, RecordValue, ValueType};

use crate::state::ProcessingState;

/// Applier invariant violation. Always fatal for the partition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("no applier registered for {intent} version {version}")]
    NoApplier { intent: Intent, version: u16 },

    #[error("{intent} expects a {expected} value, got {actual}")]
    UnexpectedValue {
        intent: Intent,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("{intent}: entity {key} does not exist")]
    MissingEntity { intent: Intent, key: Key },

    #[error("{intent}: entity {key} already exists")]
    EntityExists { intent: Intent, key: Key },

    #[error("{intent}: entity {key} is {status}")]
    InvalidTransition {
        intent: Intent,
        key: Key,
        status: String,
    },

    #[error("{intent}: {reason}")]
    Invariant { intent: Intent, reason: String },
}

pub type ApplyFn = fn(&mut ProcessingState, Key, &RecordValue) -> Result<(), ApplyError>;

pub struct EventAppliers {
    appliers: HashMap<(Intent, u16), ApplyFn>,
    latest: HashMap<Intent, u16>,
}

impl EventAppliers {
    /// A registry without appliers.
    pub fn empty() -> Self {
        Self {
            appliers: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    /// A registry with all job and subscription appliers.
    pub fn new() -> Self {
        let mut appliers = Self::empty();
        crate::jobs::appliers::register(&mut appliers);
        appliers
    }

    pub fn register(&mut self, intent: impl Into<Intent>, version: u16, applier: ApplyFn) -> &mut Self {
        let intent = intent.into();
        self.appliers.insert((intent, version), applier);
        let latest = self.latest.entry(intent).or_insert(version);
        *latest = (*latest).max(version);
        self
    }

    pub fn latest_version(&self, intent: Intent) -> Option<u16> {
        self.latest.get(&intent).copied()
    }

    pub fn apply(
        &self,
        state: &mut ProcessingState,
        key: Key,
        intent: Intent,
        value: &RecordValue,
        version: u16,
    ) -> Result<(), ApplyError> {
        let applier = self
            .appliers
            .get(&(intent, version))
            .ok_or(ApplyError::NoApplier { intent, version })?;
        applier(state, key, value)
    }

    pub fn apply_record(
        &self,
        state: &mut ProcessingState,
        record: &LoggedRecord,
    ) -> Result<(), ApplyError> {
        self.apply(
            state,
            record.key(),
            record.intent(),
            record.value(),
            record.metadata().record_version(),
        )
    }
}

impl Default for EventAppliers {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventAppliers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut registered: Vec<String> = self
            .appliers
            .keys()
            .map(|(intent, version)| format!("{intent}@{version}"))
            .collect();
        registered.sort();
        f.debug_struct("EventAppliers")
            .field("registered", &registered)
            .finish()
    }
}
