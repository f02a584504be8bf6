//! Record export stream (publish/subscribe over durable records).
//!
//! The stream processor publishes every record of a batch after the batch is durable, in
//! position order. Consumers get a broadcast copy of the stream through a [`Subscription`].
//! Reprocessing never publishes: the records were exported when they were first written.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use crate::exported::ExportedRecord;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("exporter lock poisoned")]
    Poisoned,

    #[error("exporter unavailable: {0}")]
    Unavailable(String),
}

/// A consumer's view of the export stream.
///
/// Intended for a single consuming thread. Records arrive in the order they were published.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything published so far without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Sink for durable records.
///
/// A failed export does not undo the batch: the log is the source of truth and a consumer
/// can always re-read it.
pub trait RecordExporter: Send + Sync {
    fn export(&self, record: ExportedRecord) -> Result<(), ExportError>;

    fn subscribe(&self) -> Subscription<ExportedRecord>;
}

impl<E> RecordExporter for Arc<E>
where
    E: RecordExporter + ?Sized,
{
    fn export(&self, record: ExportedRecord) -> Result<(), ExportError> {
        (**self).export(record)
    }

    fn subscribe(&self) -> Subscription<ExportedRecord> {
        (**self).subscribe()
    }
}
