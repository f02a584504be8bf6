use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use logflow_core::Key;
use logflow_protocol::JobSubscriptionRecord;

use super::journal::Journal;

/// A worker subscription that receives pushed jobs while it has credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub key: Key,
    pub record: JobSubscriptionRecord,
}

impl Subscription {
    pub fn credits(&self) -> i32 {
        self.record.credits
    }

    pub fn has_credits(&self) -> bool {
        self.record.credits > 0
    }
}

/// Registry of open subscriptions, keyed by subscriber, with a per-type index.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    subscriptions: BTreeMap<Key, Subscription>,
    by_type: BTreeMap<String, BTreeSet<Key>>,
    journal: Journal<Subscription>,
}

impl SubscriptionState {
    pub fn get(&self, key: Key) -> Option<&Subscription> {
        self.subscriptions.get(&key)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn put(&mut self, subscription: Subscription) {
        let key = subscription.key;
        self.journal.record(key, self.subscriptions.get(&key));
        self.unindex(key);
        self.by_type
            .entry(subscription.record.job_type.clone())
            .or_default()
            .insert(key);
        self.subscriptions.insert(key, subscription);
    }

    pub fn remove(&mut self, key: Key) -> Option<Subscription> {
        self.journal.record(key, self.subscriptions.get(&key));
        self.unindex(key);
        self.subscriptions.remove(&key)
    }

    pub fn subscribers(&self, job_type: &str) -> impl Iterator<Item = &Subscription> {
        self.by_type
            .get(job_type)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|key| self.subscriptions.get(key))
    }

    /// The subscriber of `job_type` with the most credits; ties go to the oldest.
    pub fn best_subscriber(&self, job_type: &str) -> Option<&Subscription> {
        self.subscribers(job_type)
            .filter(|s| s.has_credits())
            .fold(None, |best: Option<&Subscription>, candidate| match best {
                Some(b) if b.credits() >= candidate.credits() => Some(b),
                _ => Some(candidate),
            })
    }

    pub(crate) fn begin(&mut self) {
        self.journal.begin();
    }

    pub(crate) fn commit(&mut self) {
        self.journal.commit();
    }

    pub(crate) fn rollback(&mut self) {
        for (key, prior) in self.journal.take() {
            self.unindex(key);
            self.subscriptions.remove(&key);
            if let Some(prior) = prior {
                self.by_type
                    .entry(prior.record.job_type.clone())
                    .or_default()
                    .insert(key);
                self.subscriptions.insert(key, prior);
            }
        }
    }

    fn unindex(&mut self, key: Key) {
        let Some(existing) = self.subscriptions.get(&key) else {
            return;
        };
        if let Some(keys) = self.by_type.get_mut(&existing.record.job_type) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_type.remove(&existing.record.job_type);
            }
        }
    }
}

impl PartialEq for SubscriptionState {
    fn eq(&self, other: &Self) -> bool {
        self.subscriptions == other.subscriptions
    }
}

impl Serialize for SubscriptionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.subscriptions.values())
    }
}

impl<'de> Deserialize<'de> for SubscriptionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut state = Self::default();
        for subscription in Vec::<Subscription>::deserialize(deserializer)? {
            state.put(subscription);
        }
        Ok(state)
    }
}
