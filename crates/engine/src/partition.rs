//! Partition runner.
//!
//! One thread owns the [`StreamProcessor`] of a partition. Requests arrive over a channel,
//! are written to the log and processed until the log is caught up. Between requests the
//! loop wakes up every tick to run due sweeps, whose commands go through the same pipeline.
//! Responses are routed back to the submitter by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use logflow_core::PartitionId;
use logflow_protocol::RequestId;

use crate::jobs::ScheduledSweep;
use crate::stream_processor::{
    CommandRequest, Phase, ProcessingStats, ResponseSink, StreamProcessor, StreamProcessorBuilder,
    StreamProcessorError,
};
use crate::writers::ProcessingResponse;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("failed to spawn partition thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("partition is shut down")]
    Closed,

    #[error("partition thread panicked")]
    Panicked,

    #[error(transparent)]
    StreamProcessor(#[from] StreamProcessorError),
}

/// Completes one pending receiver per request id.
#[derive(Debug)]
pub struct ResponseRouter {
    request_stream_id: u32,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ProcessingResponse>>>,
}

impl ResponseRouter {
    pub fn new(request_stream_id: u32) -> Self {
        Self {
            request_stream_id,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request id and the receiver its response will arrive on.
    pub fn register(&self) -> (RequestId, oneshot::Receiver<ProcessingResponse>) {
        let request = RequestId::new(
            self.request_stream_id,
            self.next_request_id.fetch_add(1, Ordering::Relaxed),
        );
        let (sender, receiver) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request, sender);
        }
        (request, receiver)
    }

    /// Forget `request`; its receiver sees the channel closed.
    pub fn cancel(&self, request: RequestId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

impl ResponseSink for ResponseRouter {
    fn send(&self, response: ProcessingResponse) {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&response.request),
            Err(_) => None,
        };
        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("requester went away before the response arrived");
                }
            }
            None => debug!(request = ?response.request, "no pending request for response"),
        }
    }
}

/// Partition runtime statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionStats {
    pub partition_id: PartitionId,
    pub processing: ProcessingStats,
    pub sweep_commands: u64,
    pub recoveries: u64,
    pub uptime_secs: u64,
}

enum Message {
    Command(CommandRequest),
    Shutdown,
}

/// Handle to a running partition.
#[derive(Debug)]
pub struct PartitionHandle {
    messages: mpsc::Sender<Message>,
    router: Arc<ResponseRouter>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PartitionStats>>,
}

impl PartitionHandle {
    /// Submit a command; the receiver completes once its outcome is durable.
    pub fn submit(
        &self,
        request: CommandRequest,
    ) -> Result<oneshot::Receiver<ProcessingResponse>, PartitionError> {
        let (request_id, receiver) = self.router.register();
        if self
            .messages
            .send(Message::Command(request.with_request(request_id)))
            .is_err()
        {
            self.router.cancel(request_id);
            return Err(PartitionError::Closed);
        }
        Ok(receiver)
    }

    /// Submit a command nobody waits for.
    pub fn submit_detached(&self, request: CommandRequest) -> Result<(), PartitionError> {
        self.messages
            .send(Message::Command(request))
            .map_err(|_| PartitionError::Closed)
    }

    pub fn stats(&self) -> Option<PartitionStats> {
        self.stats.lock().ok().map(|stats| stats.clone())
    }

    /// Request graceful shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) -> Result<(), PartitionError> {
        if self.messages.send(Message::Shutdown).is_err() {
            debug!("partition thread already stopped");
        }
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.join().map_err(|_| {
            warn!("partition thread panicked");
            PartitionError::Panicked
        })
    }
}

/// A stream processor plus its sweeps, ready to run on its own thread.
pub struct Partition {
    processor: StreamProcessor,
    sweeps: Vec<Box<dyn ScheduledSweep>>,
    router: Arc<ResponseRouter>,
}

impl Partition {
    /// Build the processor with responses routed to submitters.
    pub fn new(
        builder: StreamProcessorBuilder,
        sweeps: Vec<Box<dyn ScheduledSweep>>,
    ) -> Result<Self, PartitionError> {
        let router = Arc::new(ResponseRouter::new(0));
        let processor = builder.response_sink(router.clone()).build()?;
        Ok(Self {
            processor,
            sweeps,
            router,
        })
    }

    pub fn spawn(self) -> Result<PartitionHandle, PartitionError> {
        let (sender, receiver) = mpsc::channel();
        let stats = Arc::new(Mutex::new(PartitionStats {
            partition_id: self.processor.partition_id(),
            processing: self.processor.stats(),
            sweep_commands: 0,
            recoveries: 0,
            uptime_secs: 0,
        }));
        let router = self.router.clone();
        let name = self.processor.config().name.clone();

        let loop_stats = stats.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || partition_loop(self, receiver, loop_stats))?;

        Ok(PartitionHandle {
            messages: sender,
            router,
            join: Some(join),
            stats,
        })
    }

    fn write(&mut self, request: CommandRequest) {
        let request_id = request.request;
        if let Err(err) = self.processor.write_command(request) {
            warn!(error = %err, "command could not be written");
            if let Some(request_id) = request_id {
                self.router.cancel(request_id);
            }
        }
    }

    fn run_sweeps(&mut self) -> u64 {
        let now = self.processor.clock().now();
        let mut commands = Vec::new();
        for sweep in &mut self.sweeps {
            if sweep.is_due(now) {
                let due = sweep.check(self.processor.state(), now);
                if !due.is_empty() {
                    debug!(sweep = sweep.name(), commands = due.len(), "sweep produced commands");
                }
                commands.extend(due);
            }
        }
        let written = commands.len() as u64;
        for command in commands {
            self.write(command);
        }
        written
    }

    fn ensure_recovered(&mut self, stats: &Mutex<PartitionStats>) -> bool {
        if self.processor.phase() == Phase::Processing {
            return true;
        }
        match self.processor.recover() {
            Ok(progress) => {
                if let Ok(mut stats) = stats.lock() {
                    stats.recoveries += 1;
                }
                info!(
                    records_read = progress.records_read,
                    events_applied = progress.events_applied,
                    "partition recovered"
                );
                true
            }
            Err(err) => {
                error!(error = %err, "partition recovery failed");
                false
            }
        }
    }
}

fn partition_loop(
    mut partition: Partition,
    messages: mpsc::Receiver<Message>,
    stats: Arc<Mutex<PartitionStats>>,
) {
    let tick: Duration = partition.processor.config().tick_interval;
    let partition_id = partition.processor.partition_id();
    info!(partition_id = %partition_id, "partition started");
    let started = Instant::now();

    loop {
        let message = match messages.recv_timeout(tick) {
            Ok(message) => Some(message),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if matches!(message, Some(Message::Shutdown)) {
            break;
        }

        if !partition.ensure_recovered(&stats) {
            // Retried on the next tick. The command in hand is dropped, later ones queue.
            if let Some(Message::Command(request)) = message {
                if let Some(request_id) = request.request {
                    partition.router.cancel(request_id);
                }
            }
            continue;
        }

        if let Some(Message::Command(request)) = message {
            partition.write(request);
        }
        let swept = partition.run_sweeps();

        if let Err(err) = partition.processor.process_until_idle() {
            error!(partition_id = %partition_id, error = %err, "processing halted");
        }

        if let Ok(mut stats) = stats.lock() {
            stats.processing = partition.processor.stats();
            stats.sweep_commands += swept;
            stats.uptime_secs = started.elapsed().as_secs();
        }
    }

    info!(
        partition_id = %partition_id,
        pending_requests = partition.router.pending(),
        "partition stopped"
    );
}

#[cfg(test)]
mod tests {
    use logflow_core::Key;
    use logflow_protocol::{JobIntent, JobRecord, RecordType};

    use super::*;

    fn response(request: RequestId) -> ProcessingResponse {
        ProcessingResponse {
            request,
            key: Key::new(1),
            record_type: RecordType::Event,
            intent: JobIntent::Created.into(),
            rejection_type: None,
            rejection_reason: String::new(),
            value: JobRecord::new("foo").into(),
        }
    }

    #[test]
    fn router_completes_the_matching_receiver_once() {
        let router = ResponseRouter::new(7);
        let (first, mut first_rx) = router.register();
        let (second, mut second_rx) = router.register();
        assert_eq!(first.request_stream_id, 7);
        assert_ne!(first, second);
        assert_eq!(router.pending(), 2);

        router.send(response(second));
        assert_eq!(second_rx.try_recv().unwrap().request, second);
        assert!(first_rx.try_recv().is_err());
        assert_eq!(router.pending(), 1);

        router.send(response(second));
        assert_eq!(router.pending(), 1);
    }

    #[test]
    fn canceled_request_closes_its_receiver() {
        let router = ResponseRouter::new(0);
        let (request, mut receiver) = router.register();

        router.cancel(request);

        assert_eq!(router.pending(), 0);
        assert!(matches!(
            receiver.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
