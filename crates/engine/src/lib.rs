//! Command processing for one partition.
//!
//! Commands are read from the log in position order, handed to a [`RecordProcessor`] and
//! turned into follow-up events (applied to [`ProcessingState`] as they are written),
//! rejections and a response. Each command's follow-ups are appended as one atomic batch.
//! After a restart the same state is rebuilt by [`replay`], which applies the logged events
//! without re-running processors or side effects.
//!
//! The job lifecycle in [`jobs`] is the processing logic that ships with the engine.

pub mod appliers;
pub mod config;
pub mod jobs;
pub mod partition;
pub mod processor;
pub mod replay;
pub mod snapshot;
pub mod state;
pub mod stream_processor;
pub mod writers;

pub use appliers::{ApplyError, ApplyFn, EventAppliers};
pub use config::{ConfigError, EngineConfig};
pub use partition::{Partition, PartitionError, PartitionHandle, PartitionStats, ResponseRouter};
pub use processor::{ProcessingError, RecordProcessor};
pub use replay::{ReplayError, ReplayOutcome, ReplayPhase, ReplayProgress, replay};
pub use snapshot::{InMemorySnapshotStore, SnapshotError, SnapshotStore};
pub use state::{Job, JobState, JobStatus, ProcessingState, Subscription, SubscriptionState};
pub use stream_processor::{
    CommandRequest, DiscardResponses, Phase, ProcessingStats, RecordingResponseSink, ResponseSink,
    StreamProcessor, StreamProcessorBuilder, StreamProcessorError,
};
pub use writers::{
    CommandWriter, PostCommitTask, ProcessingResponse, ProcessingResultBuilder, RejectionWriter,
    ResponseWriter, StateWriter, WriteError, Writers,
};
