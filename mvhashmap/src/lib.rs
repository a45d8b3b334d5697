// SPDX-License-Identifier: Apache-2.0

use crate::{
    types::{MVReadResult, TxnIndex, Version, WriteDescriptor},
    versioned_data::VersionedData,
};
use std::{fmt::Debug, hash::Hash, sync::Arc};

pub mod types;
pub mod versioned_data;

#[cfg(test)]
mod unit_tests;

/// Main multi-version data-structure used by threads to read/write during
/// parallel execution.
///
/// Concurrency is managed by DashMap, i.e. when a method accesses the version
/// history at a given key, it holds shard access and doesn't need to
/// explicitly synchronize with other readers/writers. The estimate flag of an
/// entry is atomic so marking proceeds under shared access.
pub struct MVHashMap<K, V> {
    data: VersionedData<K, V>,
}

impl<K: Hash + Clone + Debug + Eq, V> MVHashMap<K, V> {
    pub fn new() -> MVHashMap<K, V> {
        MVHashMap {
            data: VersionedData::empty(),
        }
    }

    /// Insert or replace the entry for `version.txn_index` at `key`. An
    /// existing estimate at the same index is overwritten.
    pub fn write(&self, key: K, version: Version, value: V) {
        self.data.write(key, version, Arc::new(value));
    }

    /// Return the entry under `key` with the largest stored index strictly
    /// below `txn_idx`.
    pub fn read(&self, key: &K, txn_idx: TxnIndex) -> MVReadResult<V> {
        self.data.read(key, txn_idx)
    }

    /// Convert the entry written by `txn_idx` at `key` into an estimate,
    /// preserving its incarnation and value for early dependency detection.
    /// A prior write at `(key, txn_idx)` must exist.
    pub fn mark_estimate(&self, key: &K, txn_idx: TxnIndex) {
        self.data.mark_estimate(key, txn_idx);
    }

    /// Remove the entry written by `txn_idx` at `key`, if present.
    pub fn remove(&self, key: &K, txn_idx: TxnIndex) {
        self.data.remove(key, txn_idx);
    }

    pub fn num_keys(&self) -> usize {
        self.data.num_keys()
    }
}

impl<K: Hash + Clone + Debug + Eq, V: Clone> MVHashMap<K, V> {
    /// Apply every write of an incarnation's full write list.
    pub fn flush_write_set(&self, writes: &[WriteDescriptor<K, V>]) {
        for w in writes {
            self.data
                .write(w.path.clone(), w.version, Arc::new(w.value.clone()));
        }
    }
}

impl<K: Hash + Clone + Debug + Eq, V> Default for MVHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
