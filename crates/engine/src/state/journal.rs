use std::collections::BTreeMap;

use logflow_core::Key;

/// Undo log of one state transaction.
///
/// Records the value an entity had before its first change inside the transaction, so a
/// rollback can restore it. Outside a transaction nothing is recorded.
#[derive(Debug, Clone)]
pub(crate) struct Journal<V> {
    entries: Option<BTreeMap<Key, Option<V>>>,
}

impl<V> Default for Journal<V> {
    fn default() -> Self {
        Self { entries: None }
    }
}

impl<V: Clone> Journal<V> {
    pub fn begin(&mut self) {
        self.entries = Some(BTreeMap::new());
    }

    pub fn is_active(&self) -> bool {
        self.entries.is_some()
    }

    /// Remember `prior` as the value of `key` unless it was already touched.
    pub fn record(&mut self, key: Key, prior: Option<&V>) {
        if let Some(entries) = self.entries.as_mut() {
            entries.entry(key).or_insert_with(|| prior.cloned());
        }
    }

    pub fn commit(&mut self) {
        self.entries = None;
    }

    /// End the transaction, returning the values to restore.
    pub fn take(&mut self) -> BTreeMap<Key, Option<V>> {
        self.entries.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct NoDefault(u32);

    #[test]
    fn default_does_not_need_a_default_value() {
        let mut journal: Journal<NoDefault> = Journal::default();
        assert!(!journal.is_active());

        journal.begin();
        journal.record(Key::new(1), Some(&NoDefault(3)));
        assert_eq!(journal.take().get(&Key::new(1)), Some(&Some(NoDefault(3))));
    }

    #[test]
    fn first_touch_wins() {
        let mut journal: Journal<&str> = Journal::default();
        journal.record(Key::new(1), Some(&"ignored"));
        assert!(journal.take().is_empty());

        journal.begin();
        journal.record(Key::new(1), Some(&"before"));
        journal.record(Key::new(1), Some(&"after"));
        journal.record(Key::new(2), None);

        let undo = journal.take();
        assert_eq!(undo.get(&Key::new(1)), Some(&Some("before")));
        assert_eq!(undo.get(&Key::new(2)), Some(&None));
        assert!(!journal.is_active());
    }
}
