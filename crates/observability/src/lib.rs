//! Process-wide logging setup for partition runners, tests and benches.
//!
//! Partitions log through `tracing` with structured fields; this crate only decides where
//! those events go.

pub mod tracing;

pub use self::tracing::{DEFAULT_FILTER, init_with_default};

/// Install the JSON subscriber with the [`DEFAULT_FILTER`]. Later calls are no-ops.
pub fn init() {
    self::tracing::init();
}
