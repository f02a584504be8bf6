//! Record batch builder.
//!
//! A batch is the unit of one atomic append. Entries are framed into a single byte buffer
//! as they are finished:
//!
//! ```text
//! +-----------+------------------+----------------+-------------+----------+-------+-----+
//! | key (i64) | source idx (i32) | meta len (u32) | value len   | metadata | value | pad |
//! +-----------+------------------+----------------+-------------+----------+-------+-----+
//! ```
//!
//! All integers are little endian and every frame is padded to [`FRAME_ALIGNMENT`].
//! A key of `-1` asks for a key to be assigned on flush. A source index of `-1` links the
//! entry to the record the batch was produced for; a non-negative index links it to an
//! earlier entry of the same batch.
//!
//! The builder does not enforce the fragment ceiling on write. Callers check
//! [`RecordBatchBuilder::can_write_additional_event`] first.

use logflow_core::RecordKey;

use crate::error::BatchError;

pub const FRAME_HEADER_LENGTH: usize = 8 + 4 + 4 + 4;
pub const FRAME_ALIGNMENT: usize = 8;

/// Source index linking an entry to the record being processed.
pub const SOURCE_INDEX_PROCESSED_RECORD: i32 = -1;

/// Bytes one entry with `payload_length` bytes of metadata and value occupies in a batch.
pub fn framed_length(payload_length: usize) -> usize {
    let unaligned = FRAME_HEADER_LENGTH + payload_length;
    unaligned.div_ceil(FRAME_ALIGNMENT) * FRAME_ALIGNMENT
}

#[derive(Debug, Clone)]
pub struct RecordBatchBuilder {
    buffer: Vec<u8>,
    offsets: Vec<usize>,
    max_fragment_size: usize,
}

impl RecordBatchBuilder {
    pub fn new(max_fragment_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            offsets: Vec::new(),
            max_fragment_size,
        }
    }

    /// Begin a new entry. Nothing is staged until [`EntryBuilder::done`] succeeds.
    pub fn event(&mut self) -> EntryBuilder<'_> {
        EntryBuilder {
            batch: self,
            key: RecordKey::AutoAssign,
            source_index: SOURCE_INDEX_PROCESSED_RECORD,
            metadata: Vec::new(),
            value: None,
        }
    }

    /// Whether an entry of `length` payload bytes still fits under the fragment ceiling,
    /// including its frame header and padding.
    pub fn can_write_additional_event(&self, length: usize) -> bool {
        self.buffer.len() + framed_length(length) <= self.max_fragment_size
    }

    /// Whether entries of all `lengths` fit together under the fragment ceiling.
    pub fn can_write_additional_events(&self, lengths: &[usize]) -> bool {
        let framed: usize = lengths.iter().map(|&length| framed_length(length)).sum();
        self.buffer.len() + framed <= self.max_fragment_size
    }

    /// Discard all staged entries. The buffer keeps its capacity.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    pub fn entry(&self, index: usize) -> Option<Result<BatchEntry<'_>, BatchError>> {
        self.offsets
            .get(index)
            .map(|&offset| BatchEntry::parse(&self.buffer, offset))
    }

    pub fn entries(&self) -> impl Iterator<Item = Result<BatchEntry<'_>, BatchError>> + '_ {
        self.offsets
            .iter()
            .map(move |&offset| BatchEntry::parse(&self.buffer, offset))
    }

    fn push_frame(&mut self, key: RecordKey, source_index: i32, metadata: &[u8], value: &[u8]) {
        let offset = self.buffer.len();
        let framed = framed_length(metadata.len() + value.len());

        self.buffer.reserve(framed);
        self.buffer.extend_from_slice(&key.to_raw().to_le_bytes());
        self.buffer.extend_from_slice(&source_index.to_le_bytes());
        self.buffer
            .extend_from_slice(&(metadata.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(metadata);
        self.buffer.extend_from_slice(value);
        self.buffer.resize(offset + framed, 0);

        self.offsets.push(offset);
    }
}

/// Fields of the entry currently being written.
#[derive(Debug)]
pub struct EntryBuilder<'a> {
    batch: &'a mut RecordBatchBuilder,
    key: RecordKey,
    source_index: i32,
    metadata: Vec<u8>,
    value: Option<Vec<u8>>,
}

impl EntryBuilder<'_> {
    pub fn key(mut self, key: RecordKey) -> Self {
        self.key = key;
        self
    }

    pub fn source_index(mut self, source_index: i32) -> Self {
        self.source_index = source_index;
        self
    }

    pub fn metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Write the value through `writer` instead of passing finished bytes.
    pub fn value_writer<E>(
        mut self,
        writer: impl FnOnce(&mut Vec<u8>) -> Result<(), E>,
    ) -> Result<Self, E> {
        let mut value = Vec::new();
        writer(&mut value)?;
        self.value = Some(value);
        Ok(self)
    }

    /// Frame the entry into the batch and return its index.
    pub fn done(self) -> Result<usize, BatchError> {
        let value = self.value.ok_or(BatchError::MissingValue)?;
        self.batch
            .push_frame(self.key, self.source_index, &self.metadata, &value);
        Ok(self.batch.offsets.len() - 1)
    }
}

/// A framed entry, borrowed from the batch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    pub key: RecordKey,
    pub source_index: i32,
    pub metadata: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> BatchEntry<'a> {
    fn parse(buffer: &'a [u8], offset: usize) -> Result<Self, BatchError> {
        let malformed = || BatchError::MalformedFrame { offset };
        let header = buffer
            .get(offset..offset + FRAME_HEADER_LENGTH)
            .ok_or_else(malformed)?;

        let key = i64::from_le_bytes(header[0..8].try_into().map_err(|_| malformed())?);
        let source_index = i32::from_le_bytes(header[8..12].try_into().map_err(|_| malformed())?);
        let metadata_len =
            u32::from_le_bytes(header[12..16].try_into().map_err(|_| malformed())?) as usize;
        let value_len =
            u32::from_le_bytes(header[16..20].try_into().map_err(|_| malformed())?) as usize;

        let metadata_start = offset + FRAME_HEADER_LENGTH;
        let value_start = metadata_start + metadata_len;
        let metadata = buffer
            .get(metadata_start..value_start)
            .ok_or_else(malformed)?;
        let value = buffer
            .get(value_start..value_start + value_len)
            .ok_or_else(malformed)?;

        Ok(Self {
            key: RecordKey::from_raw(key),
            source_index,
            metadata,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use logflow_core::Key;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn entries_keep_their_fields_and_order() {
        let mut batch = RecordBatchBuilder::new(1024);
        batch
            .event()
            .key(Key::new(5).into())
            .metadata(b"meta-1".to_vec())
            .value(b"value-1".to_vec())
            .done()
            .unwrap();
        batch
            .event()
            .source_index(0)
            .metadata(b"m2".to_vec())
            .value(b"v2".to_vec())
            .done()
            .unwrap();

        let entries: Vec<_> = batch.entries().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, RecordKey::Explicit(Key::new(5)));
        assert_eq!(entries[0].source_index, SOURCE_INDEX_PROCESSED_RECORD);
        assert_eq!(entries[0].metadata, b"meta-1");
        assert_eq!(entries[0].value, b"value-1");
        assert_eq!(entries[1].key, RecordKey::AutoAssign);
        assert_eq!(entries[1].source_index, 0);
    }

    #[test]
    fn done_without_value_is_rejected_and_stages_nothing() {
        let mut batch = RecordBatchBuilder::new(1024);
        let err = batch.event().metadata(b"m".to_vec()).done().unwrap_err();

        assert_eq!(err, BatchError::MissingValue);
        assert!(batch.is_empty());
        assert_eq!(batch.byte_len(), 0);
    }

    #[test]
    fn frames_are_aligned() {
        assert_eq!(framed_length(0), 24);
        assert_eq!(framed_length(4), 24);
        assert_eq!(framed_length(5), 32);

        let mut batch = RecordBatchBuilder::new(1024);
        batch.event().value(vec![1, 2, 3]).done().unwrap();
        assert_eq!(batch.byte_len() % FRAME_ALIGNMENT, 0);
    }

    #[test]
    fn reset_discards_entries_but_keeps_buffer() {
        let mut batch = RecordBatchBuilder::new(4096);
        batch.event().value(vec![0; 512]).done().unwrap();
        let capacity = batch.capacity();

        batch.reset();

        assert!(batch.is_empty());
        assert_eq!(batch.byte_len(), 0);
        assert_eq!(batch.capacity(), capacity);
        assert!(batch.entry(0).is_none());
    }

    #[test]
    fn ceiling_check_accounts_for_header_overhead() {
        let batch = RecordBatchBuilder::new(64);
        assert!(batch.can_write_additional_event(64 - FRAME_HEADER_LENGTH));
        assert!(!batch.can_write_additional_event(64 - FRAME_HEADER_LENGTH + 1));
        assert!(batch.can_write_additional_events(&[4, 4]));
        assert!(!batch.can_write_additional_events(&[4, 4, 4]));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

        #[test]
        fn checked_writes_never_exceed_ceiling(
            ceiling in 64usize..2048,
            lengths in proptest::collection::vec(0usize..300, 0..32),
        ) {
            let mut batch = RecordBatchBuilder::new(ceiling);
            for length in lengths {
                if batch.can_write_additional_event(length) {
                    batch.event().value(vec![7u8; length]).done().unwrap();
                }
                prop_assert!(batch.byte_len() <= ceiling);
            }
        }
    }
}
