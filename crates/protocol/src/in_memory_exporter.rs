//! In-memory export stream for tests and embedded use.

use std::sync::{Mutex, mpsc};

use crate::exported::ExportedRecord;
use crate::exporter::{ExportError, RecordExporter, Subscription};

/// Broadcasts every exported record to all live subscriptions.
///
/// Subscriptions whose receiver was dropped are pruned on the next export.
#[derive(Debug, Default)]
pub struct InMemoryRecordExporter {
    subscribers: Mutex<Vec<mpsc::Sender<ExportedRecord>>>,
}

impl InMemoryRecordExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl RecordExporter for InMemoryRecordExporter {
    fn export(&self, record: ExportedRecord) -> Result<(), ExportError> {
        let mut subs = self.subscribers.lock().map_err(|_| ExportError::Poisoned)?;
        subs.retain(|tx| tx.send(record.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<ExportedRecord> {
        let (tx, rx) = mpsc::channel();
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(tx);
        Subscription::new(rx)
    }
}
