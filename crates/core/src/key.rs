//! Keys, log positions and the partition-scoped key generator.

use serde::{Deserialize, Serialize};

/// Number of low bits of a key that hold the per-partition counter.
///
/// The partition id lives in the bits above, so keys are unique across partitions
/// without coordination.
pub const PARTITION_KEY_SHIFT: u32 = 51;

const COUNTER_MASK: u64 = (1 << PARTITION_KEY_SHIFT) - 1;

/// Identifier of a log partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(u16);

impl PartitionId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl core::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Key of an entity (job, batch, subscription) or of a record on the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(u64);

impl Key {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Build the key for `counter` on `partition`.
    pub fn encode(partition: PartitionId, counter: u64) -> Self {
        Self(((partition.get() as u64) << PARTITION_KEY_SHIFT) | (counter & COUNTER_MASK))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn partition_id(self) -> PartitionId {
        PartitionId((self.0 >> PARTITION_KEY_SHIFT) as u16)
    }

    fn counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }
}

impl core::fmt::Display for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Position of a record in the log. Assigned on flush, strictly increasing per partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    /// Position of the first record of an empty log.
    pub const FIRST: Position = Position(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Key of a record that is not yet durable.
///
/// Follow-up records referencing an existing entity carry its key; everything else asks
/// for a fresh key, which is resolved from the [`KeyGenerator`] when the batch is flushed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Explicit(Key),
    AutoAssign,
}

impl RecordKey {
    /// Wire sentinel for [`RecordKey::AutoAssign`].
    pub const AUTO_ASSIGN_RAW: i64 = -1;

    pub fn to_raw(self) -> i64 {
        match self {
            RecordKey::Explicit(key) => key.get() as i64,
            RecordKey::AutoAssign => Self::AUTO_ASSIGN_RAW,
        }
    }

    /// Decode a framed key. Any negative value means "assign on flush".
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            RecordKey::AutoAssign
        } else {
            RecordKey::Explicit(Key::new(raw as u64))
        }
    }

    pub fn resolve(self, generator: &mut KeyGenerator) -> Key {
        match self {
            RecordKey::Explicit(key) => key,
            RecordKey::AutoAssign => generator.next_key(),
        }
    }
}

impl From<Key> for RecordKey {
    fn from(value: Key) -> Self {
        RecordKey::Explicit(value)
    }
}

/// Monotonic key sequence of one partition.
///
/// The generator is part of the processing state: reprocessing restores it by observing
/// every replayed key, so keys handed out after recovery never collide with durable ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenerator {
    partition_id: PartitionId,
    last_counter: u64,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            last_counter: 0,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn next_key(&mut self) -> Key {
        self.last_counter += 1;
        Key::encode(self.partition_id, self.last_counter)
    }

    /// The most recently issued key, if any.
    pub fn last_key(&self) -> Option<Key> {
        (self.last_counter > 0).then(|| Key::encode(self.partition_id, self.last_counter))
    }

    /// Advance the sequence past `key` if it belongs to this partition and is newer.
    pub fn set_key_if_higher(&mut self, key: Key) {
        if key.partition_id() == self.partition_id && key.counter() > self.last_counter {
            self.last_counter = key.counter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_embed_partition_id() {
        let key = Key::encode(PartitionId::new(3), 17);
        assert_eq!(key.partition_id(), PartitionId::new(3));
        assert_eq!(key.counter(), 17);
    }

    #[test]
    fn generator_is_monotonic() {
        let mut generator = KeyGenerator::new(PartitionId::new(1));
        let first = generator.next_key();
        let second = generator.next_key();
        assert!(second > first);
        assert_eq!(generator.last_key(), Some(second));
    }

    #[test]
    fn generator_skips_past_observed_keys() {
        let mut generator = KeyGenerator::new(PartitionId::new(1));
        generator.set_key_if_higher(Key::encode(PartitionId::new(1), 10));
        assert_eq!(generator.next_key(), Key::encode(PartitionId::new(1), 11));

        // Older keys and keys of other partitions are ignored.
        generator.set_key_if_higher(Key::encode(PartitionId::new(1), 5));
        generator.set_key_if_higher(Key::encode(PartitionId::new(2), 500));
        assert_eq!(generator.next_key(), Key::encode(PartitionId::new(1), 12));
    }

    #[test]
    fn record_key_raw_round_trip_uses_sentinel() {
        assert_eq!(RecordKey::AutoAssign.to_raw(), -1);
        assert_eq!(RecordKey::from_raw(-1), RecordKey::AutoAssign);
        assert_eq!(RecordKey::from_raw(7), RecordKey::Explicit(Key::new(7)));
    }

    #[test]
    fn auto_assign_resolves_from_generator() {
        let mut generator = KeyGenerator::new(PartitionId::new(1));
        let explicit = Key::new(99);
        assert_eq!(RecordKey::from(explicit).resolve(&mut generator), explicit);
        assert_eq!(generator.last_key(), None);

        let assigned = RecordKey::AutoAssign.resolve(&mut generator);
        assert_eq!(generator.last_key(), Some(assigned));
    }
}
