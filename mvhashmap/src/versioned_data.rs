// SPDX-License-Identifier: Apache-2.0

use crate::types::{Incarnation, MVReadResult, TxnIndex, Version};
use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use std::{
    collections::BTreeMap,
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const FLAG_DONE: bool = false;
const FLAG_ESTIMATE: bool = true;

/// Every entry in the shared multi-version data-structure is the content of
/// a write together with an "estimate" flag.
struct Entry<V> {
    /// Incarnation of the transaction that produced the write (the writer's
    /// index is the key the entry is stored under).
    incarnation: Incarnation,
    value: Arc<V>,

    /// Marks the entry as a write estimate. Stored as an atomic so marking
    /// an estimate can proceed under shared access to the key.
    flag: AtomicBool,
}

impl<V> Entry<V> {
    fn new(incarnation: Incarnation, value: Arc<V>) -> Entry<V> {
        Entry {
            incarnation,
            value,
            flag: AtomicBool::new(FLAG_DONE),
        }
    }

    fn is_estimate(&self) -> bool {
        self.flag.load(Ordering::Relaxed) == FLAG_ESTIMATE
    }

    fn mark_estimate(&self) {
        self.flag.store(FLAG_ESTIMATE, Ordering::Relaxed);
    }
}

/// A versioned value internally is represented as a BTreeMap from indices of
/// transactions that update the given access path to the entries they wrote.
struct VersionedValue<V> {
    versioned_map: BTreeMap<TxnIndex, CachePadded<Entry<V>>>,
}

impl<V> Default for VersionedValue<V> {
    fn default() -> Self {
        Self {
            versioned_map: BTreeMap::new(),
        }
    }
}

impl<V> VersionedValue<V> {
    fn read(&self, txn_idx: TxnIndex) -> MVReadResult<V> {
        match self.versioned_map.range(..txn_idx).next_back() {
            Some((idx, entry)) => {
                if entry.is_estimate() {
                    MVReadResult::Dependency(*idx)
                } else {
                    MVReadResult::Done {
                        version: Version::new(*idx, entry.incarnation),
                        value: entry.value.clone(),
                    }
                }
            },
            None => MVReadResult::None,
        }
    }
}

/// Maps each access path to an internal versioned value representation.
pub struct VersionedData<K, V> {
    values: DashMap<K, VersionedValue<V>>,
}

impl<K: Hash + Clone + Debug + Eq, V> VersionedData<K, V> {
    pub(crate) fn empty() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub(crate) fn num_keys(&self) -> usize {
        self.values.len()
    }

    /// Insert or replace the entry at `(key, version.txn_index)`. Replacing
    /// clears an estimate flag left by a previous incarnation.
    pub fn write(&self, key: K, version: Version, value: Arc<V>) {
        debug_assert!(version.txn_index >= 0 && version.incarnation >= 0);

        let mut v = self.values.entry(key).or_default();
        let prev_entry = v.versioned_map.insert(
            version.txn_index,
            CachePadded::new(Entry::new(version.incarnation, value)),
        );

        // A replaced entry must come from a lower incarnation of the same
        // transaction (estimates keep the incarnation that wrote them).
        assert!(
            prev_entry.map_or(true, |entry| entry.incarnation < version.incarnation),
            "Entry overwritten by a non-increasing incarnation"
        );
    }

    /// Mark the entry from transaction `txn_idx` at `key` as an estimated
    /// write for its future incarnation. Panics if the entry is missing.
    pub fn mark_estimate(&self, key: &K, txn_idx: TxnIndex) {
        let v = self.values.get(key).expect("Path must exist");
        v.versioned_map
            .get(&txn_idx)
            .expect("Entry by the txn must exist to mark estimate")
            .mark_estimate();
    }

    /// Remove the entry from transaction `txn_idx` at `key`, if present.
    pub fn remove(&self, key: &K, txn_idx: TxnIndex) {
        if let Some(mut v) = self.values.get_mut(key) {
            v.versioned_map.remove(&txn_idx);
        }
    }

    /// Return the entry under `key` with the largest index strictly below
    /// `txn_idx`. The shard access held for the duration of the lookup keeps
    /// the predecessor search consistent under concurrent mutation.
    pub fn read(&self, key: &K, txn_idx: TxnIndex) -> MVReadResult<V> {
        self.values
            .get(key)
            .map_or(MVReadResult::None, |v| v.read(txn_idx))
    }
}
