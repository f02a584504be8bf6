//! Partition-level primitives shared by every layer.
//!
//! This crate contains **pure** building blocks (no IO, no logging): the rejection
//! taxonomy, strongly-typed keys and log positions, the partition-scoped key generator
//! and the clock abstraction used to stamp records.

pub mod clock;
pub mod error;
pub mod key;

pub use clock::{ControlledClock, StreamClock, SystemClock};
pub use error::{Rejection, RejectionResult, RejectionType};
pub use key::{Key, KeyGenerator, PartitionId, Position, RecordKey};
