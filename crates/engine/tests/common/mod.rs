#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use logflow_core::{ControlledClock, Key, StreamClock};
use logflow_engine::jobs::{self, InMemoryJobStreamer, ScheduledSweep};
use logflow_engine::{
    CommandRequest, EngineConfig, InMemorySnapshotStore, ProcessingResponse, RecordProcessor,
    RecordingResponseSink, StreamProcessor,
};
use logflow_logstream::{InMemoryLogStorage, LogStreamReader};
use logflow_protocol::{
    InMemoryRecordExporter, Intent, JobBatchIntent, JobBatchRecord, JobIntent, JobRecord,
    JobSubscriptionIntent, JobSubscriptionRecord, LoggedRecord, RequestId,
};

pub fn setup() {
    logflow_observability::init();
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A stream processor over in-memory collaborators, driven synchronously.
pub struct Harness {
    pub config: EngineConfig,
    pub storage: Arc<InMemoryLogStorage>,
    pub clock: Arc<ControlledClock>,
    pub exporter: Arc<InMemoryRecordExporter>,
    pub responses: Arc<RecordingResponseSink>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub streamer: Arc<InMemoryJobStreamer>,
    pub processor: StreamProcessor,
    next_request: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default().with_snapshot_period(0))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let streamer = Arc::new(InMemoryJobStreamer::new());
        Self::with_processors(config, jobs::processors(streamer.clone()), streamer)
    }

    pub fn with_processors(
        config: EngineConfig,
        processors: Vec<Box<dyn RecordProcessor>>,
        streamer: Arc<InMemoryJobStreamer>,
    ) -> Self {
        setup();
        let storage = Arc::new(InMemoryLogStorage::new());
        let clock = Arc::new(ControlledClock::new(start_time()));
        let exporter = Arc::new(InMemoryRecordExporter::new());
        let responses = Arc::new(RecordingResponseSink::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());

        let mut processor = StreamProcessor::builder(config.clone())
            .storage(storage.clone())
            .clock(clock.clone())
            .exporter(exporter.clone())
            .response_sink(responses.clone())
            .snapshot_store(snapshots.clone())
            .processors(processors)
            .build()
            .unwrap();
        processor.recover().unwrap();

        Self {
            config,
            storage,
            clock,
            exporter,
            responses,
            snapshots,
            streamer,
            processor,
            next_request: 0,
        }
    }

    /// A fresh processor over the same log, clock and snapshot store, recovered.
    pub fn restart(&mut self) {
        self.processor = self.rebuilt();
        self.processor.recover().unwrap();
    }

    /// A fresh processor over the same log, not yet recovered.
    pub fn rebuilt(&self) -> StreamProcessor {
        StreamProcessor::builder(self.config.clone())
            .storage(self.storage.clone())
            .clock(self.clock.clone())
            .exporter(self.exporter.clone())
            .response_sink(self.responses.clone())
            .snapshot_store(self.snapshots.clone())
            .processors(jobs::processors(self.streamer.clone()))
            .build()
            .unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Write `request` with a fresh request id, process, and return its response.
    pub fn send(&mut self, request: CommandRequest) -> ProcessingResponse {
        self.next_request += 1;
        let request_id = RequestId::new(1, self.next_request);
        self.processor
            .write_command(request.with_request(request_id))
            .unwrap();
        self.processor.process_until_idle().unwrap();
        self.responses
            .take()
            .into_iter()
            .find(|response| response.request == request_id)
            .expect("no response for request")
    }

    pub fn create_job(&mut self, job_type: &str) -> Key {
        self.create(JobRecord::new(job_type).with_retries(3))
    }

    pub fn create(&mut self, record: JobRecord) -> Key {
        let response = self.send(CommandRequest::new(JobIntent::Create, record));
        assert!(!response.is_rejection(), "create rejected: {response:?}");
        response.key
    }

    pub fn job_command(&mut self, key: Key, intent: JobIntent, record: JobRecord) -> ProcessingResponse {
        self.send(CommandRequest::new(intent, record).with_key(key))
    }

    pub fn activate(&mut self, key: Key, worker: &str, timeout_ms: i64) -> ProcessingResponse {
        let job_type = self
            .processor
            .state()
            .jobs()
            .get(key)
            .map(|job| job.record.job_type.clone())
            .unwrap_or_default();
        self.job_command(
            key,
            JobIntent::Activate,
            JobRecord::new(job_type)
                .with_worker(worker)
                .with_timeout_ms(timeout_ms),
        )
    }

    pub fn activate_batch(&mut self, job_type: &str, max: i32) -> ProcessingResponse {
        self.send(CommandRequest::new(
            JobBatchIntent::Activate,
            JobBatchRecord::new(job_type, "batch-worker", 10_000, max),
        ))
    }

    pub fn open_subscription(&mut self, job_type: &str, credits: i32) -> Key {
        let response = self.send(CommandRequest::new(
            JobSubscriptionIntent::Open,
            JobSubscriptionRecord::new(job_type, "push-worker", 5_000).with_credits(credits),
        ));
        assert!(!response.is_rejection(), "open rejected: {response:?}");
        response.key
    }

    /// Run `sweep` now and process what it produced; returns the number of commands.
    pub fn sweep(&mut self, sweep: &mut dyn ScheduledSweep) -> usize {
        let commands = sweep.check(self.processor.state(), self.now());
        let count = commands.len();
        for command in commands {
            self.processor.write_command(command).unwrap();
        }
        self.processor.process_until_idle().unwrap();
        count
    }

    pub fn records(&self) -> Vec<LoggedRecord> {
        LogStreamReader::new(self.storage.clone())
            .collect::<Result<_, _>>()
            .unwrap()
    }

    pub fn events_of(&self, intent: impl Into<Intent>) -> Vec<LoggedRecord> {
        let intent = intent.into();
        self.records()
            .into_iter()
            .filter(|record| record.is_event() && record.intent() == intent)
            .collect()
    }

    pub fn rejections(&self) -> Vec<LoggedRecord> {
        self.records()
            .into_iter()
            .filter(LoggedRecord::is_rejection)
            .collect()
    }
}
