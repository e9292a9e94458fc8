use std::collections::BTreeMap;

use common::model::{Record, RecordHandle};

/// A published instance: its identity, the catalog handle and the record sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration<K> {
    pub key: K,
    pub handle: RecordHandle,
    pub record: Record,
}

/// Registrations of the bridge, keyed by instance identity.
#[derive(Debug)]
pub struct RegistrationIndex<K> {
    entries: BTreeMap<K, Registration<K>>,
}

impl<K> Default for RegistrationIndex<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> RegistrationIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a registration, returning the one it replaced
    pub fn insert(&mut self, registration: Registration<K>) -> Option<Registration<K>> {
        self.entries.insert(registration.key.clone(), registration)
    }

    pub fn remove(&mut self, key: &K) -> Option<Registration<K>> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration<K>> {
        self.entries.values()
    }

    /// Remove and return every registration, in key order
    pub fn drain(&mut self) -> Vec<Registration<K>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
