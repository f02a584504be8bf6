//! Stream processor orchestrator.
//!
//! Drives one partition: `READ → DISPATCH → PROCESS → FLUSH | ROLLBACK`.
//!
//! - Commands are read in position order and dispatched by value type. A value type with no
//!   processor is a configuration error and halts the partition.
//! - State changes made while processing run inside a transaction on [`ProcessingState`].
//!   The transaction commits once the batch is durable and rolls back otherwise.
//! - A processor error rolls back and runs the processor's error hook in a fresh attempt,
//!   which rejects the command. Applier failures and failed appends halt the partition;
//!   [`StreamProcessor::recover`] rebuilds state from the log.
//! - Responses, post-commit tasks and record export only see durable outcomes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use logflow_core::{PartitionId, Position, RecordKey, StreamClock, SystemClock};
use logflow_logstream::{
    InMemoryLogStorage, LogStorage, LogStreamError, LogStreamReader, LogStreamWriter,
    RecordBatchBuilder, encode_metadata, encode_value,
};
use logflow_protocol::{
    ExportedRecord, InMemoryRecordExporter, Intent, LoggedRecord, RecordExporter, RecordMetadata,
    RecordValue, RequestId, ValueType,
};

use crate::appliers::EventAppliers;
use crate::config::{ConfigError, EngineConfig};
use crate::processor::{ProcessingError, RecordProcessor};
use crate::replay::{ReplayError, ReplayProgress, replay};
use crate::snapshot::{InMemorySnapshotStore, SnapshotError, SnapshotStore};
use crate::state::ProcessingState;
use crate::writers::{ProcessingResponse, ProcessingResultBuilder, Writers};

#[derive(Debug, Error)]
pub enum StreamProcessorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    LogStream(#[from] LogStreamError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("processing command at position {position} failed: {source}")]
    Processing {
        position: Position,
        #[source]
        source: ProcessingError,
    },

    #[error("no processor registered for value type {0}")]
    NoSuchProcessor(ValueType),

    #[error("more than one processor registered for value type {0}")]
    DuplicateProcessor(ValueType),

    #[error("invalid command request: {0}")]
    InvalidRequest(String),

    #[error("operation not allowed in phase {0:?}")]
    InvalidPhase(Phase),
}

/// Lifecycle phase of a stream processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Built, state not yet rebuilt from the log.
    Replay,
    /// Processing new commands.
    Processing,
    /// Halted; only [`StreamProcessor::recover`] is allowed.
    Failed,
}

/// Receives responses for commands that carried a request id.
pub trait ResponseSink: Send + Sync {
    fn send(&self, response: ProcessingResponse);
}

impl<S> ResponseSink for Arc<S>
where
    S: ResponseSink + ?Sized,
{
    fn send(&self, response: ProcessingResponse) {
        (**self).send(response)
    }
}

/// Drops every response.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardResponses;

impl ResponseSink for DiscardResponses {
    fn send(&self, response: ProcessingResponse) {
        debug!(request = ?response.request, "response discarded");
    }
}

/// Keeps responses in memory, in send order.
#[derive(Debug, Default)]
pub struct RecordingResponseSink {
    responses: Mutex<Vec<ProcessingResponse>>,
}

impl RecordingResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> Vec<ProcessingResponse> {
        self.responses
            .lock()
            .map(|responses| responses.clone())
            .unwrap_or_default()
    }

    pub fn take(&self) -> Vec<ProcessingResponse> {
        self.responses
            .lock()
            .map(|mut responses| std::mem::take(&mut *responses))
            .unwrap_or_default()
    }
}

impl ResponseSink for RecordingResponseSink {
    fn send(&self, response: ProcessingResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(response);
        }
    }
}

/// A command arriving from outside the partition.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub key: RecordKey,
    pub intent: Intent,
    pub value: RecordValue,
    pub request: Option<RequestId>,
}

impl CommandRequest {
    /// A command for a new entity; the key is assigned when it is written.
    pub fn new(intent: impl Into<Intent>, value: impl Into<RecordValue>) -> Self {
        Self {
            key: RecordKey::AutoAssign,
            intent: intent.into(),
            value: value.into(),
            request: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<RecordKey>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }
}

/// Processing counters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProcessingStats {
    pub phase: Phase,
    pub commands_written: u64,
    pub commands_processed: u64,
    pub commands_rejected: u64,
    pub errors_handled: u64,
    pub records_written: u64,
    pub export_failures: u64,
    pub snapshots_taken: u64,
    pub last_processed_position: Option<Position>,
    pub last_written_position: Option<Position>,
}

impl ProcessingStats {
    fn new() -> Self {
        Self {
            phase: Phase::Replay,
            commands_written: 0,
            commands_processed: 0,
            commands_rejected: 0,
            errors_handled: 0,
            records_written: 0,
            export_failures: 0,
            snapshots_taken: 0,
            last_processed_position: None,
            last_written_position: None,
        }
    }
}

type SharedStorage = Arc<dyn LogStorage>;

pub struct StreamProcessorBuilder {
    config: EngineConfig,
    storage: Option<SharedStorage>,
    clock: Option<Arc<dyn StreamClock>>,
    exporter: Option<Arc<dyn RecordExporter>>,
    responses: Option<Arc<dyn ResponseSink>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    appliers: Option<EventAppliers>,
    processors: Vec<Box<dyn RecordProcessor>>,
}

impl StreamProcessorBuilder {
    pub fn storage(mut self, storage: Arc<dyn LogStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn StreamClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn RecordExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn response_sink(mut self, responses: Arc<dyn ResponseSink>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn appliers(mut self, appliers: EventAppliers) -> Self {
        self.appliers = Some(appliers);
        self
    }

    pub fn processor(mut self, processor: Box<dyn RecordProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn processors(mut self, processors: impl IntoIterator<Item = Box<dyn RecordProcessor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    /// Unset collaborators default to in-memory implementations and the system clock.
    pub fn build(self) -> Result<StreamProcessor, StreamProcessorError> {
        self.config.validate()?;

        let mut processors: HashMap<ValueType, Box<dyn RecordProcessor>> = HashMap::new();
        for processor in self.processors {
            let value_type = processor.value_type();
            if processors.insert(value_type, processor).is_some() {
                return Err(StreamProcessorError::DuplicateProcessor(value_type));
            }
        }

        let storage: SharedStorage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryLogStorage::new()));
        let clock: Arc<dyn StreamClock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let writer = LogStreamWriter::new(storage.clone(), clock.clone())?;
        let reader = LogStreamReader::new(storage.clone());

        Ok(StreamProcessor {
            state: ProcessingState::new(self.config.partition_id),
            result: ProcessingResultBuilder::new(self.config.max_fragment_size),
            ingress: RecordBatchBuilder::new(self.config.max_fragment_size),
            config: self.config,
            storage,
            clock,
            reader,
            writer,
            appliers: self.appliers.unwrap_or_default(),
            processors,
            exporter: self
                .exporter
                .unwrap_or_else(|| Arc::new(InMemoryRecordExporter::new())),
            responses: self.responses.unwrap_or_else(|| Arc::new(DiscardResponses)),
            snapshots: self
                .snapshots
                .unwrap_or_else(|| Arc::new(InMemorySnapshotStore::new())),
            phase: Phase::Replay,
            stats: ProcessingStats::new(),
            processed_since_snapshot: 0,
        })
    }
}

pub struct StreamProcessor {
    config: EngineConfig,
    storage: SharedStorage,
    clock: Arc<dyn StreamClock>,
    reader: LogStreamReader<SharedStorage>,
    writer: LogStreamWriter<SharedStorage>,
    state: ProcessingState,
    appliers: EventAppliers,
    processors: HashMap<ValueType, Box<dyn RecordProcessor>>,
    exporter: Arc<dyn RecordExporter>,
    responses: Arc<dyn ResponseSink>,
    snapshots: Arc<dyn SnapshotStore>,
    result: ProcessingResultBuilder,
    ingress: RecordBatchBuilder,
    phase: Phase,
    stats: ProcessingStats,
    processed_since_snapshot: u64,
}

impl StreamProcessor {
    pub fn builder(config: EngineConfig) -> StreamProcessorBuilder {
        StreamProcessorBuilder {
            config,
            storage: None,
            clock: None,
            exporter: None,
            responses: None,
            snapshots: None,
            appliers: None,
            processors: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn partition_id(&self) -> PartitionId {
        self.config.partition_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn clock(&self) -> &Arc<dyn StreamClock> {
        &self.clock
    }

    pub fn exporter(&self) -> &Arc<dyn RecordExporter> {
        &self.exporter
    }

    pub fn stats(&self) -> ProcessingStats {
        let mut stats = self.stats.clone();
        stats.phase = self.phase;
        stats.last_processed_position = self.state.last_processed_position();
        stats.last_written_position = self.state.last_written_position();
        stats
    }

    /// Rebuild state from the latest snapshot and the log, then switch to processing.
    ///
    /// Also the way out of [`Phase::Failed`]: whatever was in memory is discarded.
    pub fn recover(&mut self) -> Result<ReplayProgress, StreamProcessorError> {
        self.phase = Phase::Replay;
        let snapshot = self.snapshots.latest()?;
        let outcome = replay(
            self.storage.clone(),
            &self.appliers,
            self.config.partition_id,
            snapshot,
        )?;

        self.state = outcome.state;
        self.writer = LogStreamWriter::new(self.storage.clone(), self.clock.clone())?;
        self.reader = LogStreamReader::new(self.storage.clone());
        self.reader.seek(
            outcome
                .pending_commands
                .first()
                .copied()
                .unwrap_or_else(|| self.writer.next_position()),
        );
        self.result.reset();
        self.processed_since_snapshot = 0;
        self.phase = Phase::Processing;

        info!(
            partition_id = %self.config.partition_id,
            pending_commands = outcome.pending_commands.len(),
            last_processed_position = ?self.state.last_processed_position(),
            "stream processor recovered"
        );
        Ok(outcome.progress)
    }

    /// Append a command from outside the partition. Its key is assigned here if needed.
    pub fn write_command(&mut self, request: CommandRequest) -> Result<LoggedRecord, StreamProcessorError> {
        self.ensure_processing()?;
        if request.intent.is_event() {
            return Err(StreamProcessorError::InvalidRequest(format!(
                "{} is not a command intent",
                request.intent
            )));
        }
        if request.intent.value_type() != request.value.value_type() {
            return Err(StreamProcessorError::InvalidRequest(format!(
                "{} does not take a {} value",
                request.intent,
                request.value.value_type()
            )));
        }

        let metadata = encode_metadata(&RecordMetadata::command(request.intent).with_request(request.request))
            .map_err(LogStreamError::from)?;
        let value = encode_value(&request.value).map_err(LogStreamError::from)?;
        self.ingress.reset();
        if !self.ingress.can_write_additional_event(metadata.len() + value.len()) {
            return Err(StreamProcessorError::InvalidRequest(format!(
                "command of {} bytes exceeds the batch ceiling of {} bytes",
                metadata.len() + value.len(),
                self.config.max_fragment_size
            )));
        }
        self.ingress
            .event()
            .key(request.key)
            .metadata(metadata)
            .value(value)
            .done()
            .map_err(LogStreamError::from)?;

        let mut records = self
            .writer
            .flush(&self.ingress, None, self.state.key_generator_mut())?;
        self.stats.commands_written += 1;
        self.export(&records);

        records.pop().ok_or_else(|| {
            StreamProcessorError::InvalidRequest("command was not written".to_string())
        })
    }

    /// Process the next unprocessed command. Returns `false` once the log is caught up.
    pub fn process_next(&mut self) -> Result<bool, StreamProcessorError> {
        self.ensure_processing()?;
        while let Some(record) = self.reader.next_record()? {
            let already_processed = self
                .state
                .last_processed_position()
                .is_some_and(|processed| record.position() <= processed);
            if !record.is_command() || already_processed {
                continue;
            }
            self.process_command(&record)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Process commands until the log is caught up; returns how many were processed.
    pub fn process_until_idle(&mut self) -> Result<usize, StreamProcessorError> {
        let mut processed = 0;
        while self.process_next()? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Persist the current state now.
    pub fn take_snapshot(&mut self) -> Result<(), StreamProcessorError> {
        self.snapshots.persist(&self.state)?;
        self.stats.snapshots_taken += 1;
        self.processed_since_snapshot = 0;
        debug!(
            last_processed_position = ?self.state.last_processed_position(),
            "snapshot taken"
        );
        Ok(())
    }

    fn ensure_processing(&self) -> Result<(), StreamProcessorError> {
        match self.phase {
            Phase::Processing => Ok(()),
            phase => Err(StreamProcessorError::InvalidPhase(phase)),
        }
    }

    fn process_command(&mut self, command: &LoggedRecord) -> Result<(), StreamProcessorError> {
        let position = command.position();
        if let Err(err) = self.attempt(command) {
            self.state.rollback();
            self.result.reset();
            self.phase = Phase::Failed;
            error!(
                position = %position,
                intent = %command.intent(),
                error = %err,
                "stream processor halted"
            );
            return Err(err);
        }

        self.state.mark_processed(position);
        let records = match self.writer.flush(
            self.result.batch(),
            Some(position),
            self.state.key_generator_mut(),
        ) {
            Ok(records) => records,
            Err(err) => {
                self.state.rollback();
                self.result.reset();
                self.phase = Phase::Failed;
                error!(position = %position, error = %err, "append failed; stream processor halted");
                return Err(err.into());
            }
        };
        if let Some(last) = records.last() {
            self.state.mark_written(last.position());
        }
        self.state.commit();

        if let Some(response) = self.result.take_response() {
            self.responses.send(response);
        }
        for task in self.result.take_post_commit_tasks() {
            task();
        }
        self.export(&records);

        self.stats.commands_processed += 1;
        self.stats.records_written += records.len() as u64;
        if self.result.is_rejected() {
            self.stats.commands_rejected += 1;
        }
        self.result.reset();
        debug!(
            position = %position,
            intent = %command.intent(),
            follow_ups = records.len(),
            "command processed"
        );

        self.processed_since_snapshot += 1;
        if self.config.snapshot_period > 0
            && self.processed_since_snapshot >= self.config.snapshot_period
            && let Err(err) = self.take_snapshot()
        {
            warn!(error = %err, "snapshot failed");
        }
        Ok(())
    }

    /// Run the processor, falling back to its error hook. Leaves the result staged.
    fn attempt(&mut self, command: &LoggedRecord) -> Result<(), StreamProcessorError> {
        let position = command.position();
        let value_type = command.value_type();
        let Some(processor) = self.processors.get_mut(&value_type) else {
            return Err(StreamProcessorError::NoSuchProcessor(value_type));
        };

        self.result.reset();
        self.state.begin();
        let processed = {
            let mut writers = Writers::new(&mut self.state, &self.appliers, &mut self.result);
            processor.process(command, &mut writers)
        }
        .and_then(|()| {
            if self.result.is_empty() {
                Err(ProcessingError::NoFollowUp)
            } else {
                Ok(())
            }
        });

        let Err(failure) = processed else {
            return Ok(());
        };
        if failure.is_fatal() {
            return Err(StreamProcessorError::Processing {
                position,
                source: failure,
            });
        }

        warn!(
            position = %position,
            intent = %command.intent(),
            error = %failure,
            "processing failed; rejecting command"
        );
        self.state.rollback();
        self.result.reset();
        self.state.begin();
        {
            let mut writers = Writers::new(&mut self.state, &self.appliers, &mut self.result);
            processor.on_error(command, &failure, &mut writers)
        }
        .and_then(|()| {
            if self.result.is_empty() {
                Err(ProcessingError::NoFollowUp)
            } else {
                Ok(())
            }
        })
        .map_err(|source| StreamProcessorError::Processing { position, source })?;

        self.stats.errors_handled += 1;
        Ok(())
    }

    fn export(&mut self, records: &[LoggedRecord]) {
        for record in records {
            let exported = ExportedRecord::from_logged(self.config.partition_id, record);
            if let Err(err) = self.exporter.export(exported) {
                self.stats.export_failures += 1;
                warn!(position = %record.position(), error = %err, "record export failed");
            }
        }
    }
}

impl core::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut value_types: Vec<_> = self.processors.keys().collect();
        value_types.sort();
        f.debug_struct("StreamProcessor")
            .field("partition_id", &self.config.partition_id)
            .field("phase", &self.phase)
            .field("processors", &value_types)
            .field("next_position", &self.writer.next_position())
            .finish_non_exhaustive()
    }
}
