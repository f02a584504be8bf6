//! Record model of the partition log.
//!
//! Everything appended to a partition is a [`LoggedRecord`]: a keyed, intent-tagged,
//! typed value with a link to the record that caused it. Downstream consumers observe the
//! durable log as a stream of [`ExportedRecord`]s published through a [`RecordExporter`].

pub mod exported;
pub mod exporter;
pub mod in_memory_exporter;
pub mod intent;
pub mod record;
pub mod value;

pub use exported::ExportedRecord;
pub use exporter::{ExportError, RecordExporter, Subscription};
pub use in_memory_exporter::InMemoryRecordExporter;
pub use intent::{Intent, JobBatchIntent, JobIntent, JobSubscriptionIntent};
pub use record::{LoggedRecord, RecordMetadata, RecordType, RequestId, ValueType};
pub use value::{JobBatchRecord, JobRecord, JobSubscriptionRecord, RecordValue, Variables};
