//! Append path of a partition log.
//!
//! - [`RecordBatchBuilder`]: stages records for one atomic append, under a byte ceiling
//! - [`LogStorage`]: the durable, append-only store (external collaborator boundary)
//! - [`LogStreamWriter`] / [`LogStreamReader`]: turn batches into positioned records and
//!   read them back in position order

pub mod batch;
pub mod codec;
pub mod error;
pub mod in_memory;
pub mod reader;
pub mod storage;
pub mod writer;

pub use batch::{BatchEntry, EntryBuilder, RecordBatchBuilder};
pub use codec::{
    decode_payload, decode_record, encode_metadata, encode_record, encode_value, stored_timestamp,
};
pub use error::{BatchError, CodecError, LogStreamError};
pub use in_memory::InMemoryLogStorage;
pub use reader::LogStreamReader;
pub use storage::{LogStorage, LogStorageError, StoredFrame, next_position};
pub use writer::LogStreamWriter;

/// Default ceiling of one appended batch (4 MiB).
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 4 * 1024 * 1024;
