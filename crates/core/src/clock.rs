//! Clock used to stamp records and drive expiry sweeps.
//!
//! Processors never read the clock: they use the timestamp of the command they process,
//! which keeps processing deterministic under replay.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

pub trait StreamClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C> StreamClock for Arc<C>
where
    C: StreamClock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl StreamClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ControlledClock {
    now: RwLock<DateTime<Utc>>,
}

impl ControlledClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Default for ControlledClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl StreamClock for ControlledClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
