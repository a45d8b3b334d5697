// SPDX-License-Identifier: Apache-2.0

use blockstm_mvhashmap::types::{ReadDescriptor, TxnIndex, WriteDescriptor};
use std::{collections::HashSet, hash::Hash};

/// Per-transaction input and output sets from the last successful
/// incarnations, recorded by the coordinator and returned to the caller at
/// termination.
#[derive(Debug)]
pub struct TxnInputOutput<K, V> {
    inputs: Vec<Vec<ReadDescriptor<K>>>, // txn_idx -> read set.

    /// Write sets that are checked during validation.
    outputs: Vec<Vec<WriteDescriptor<K, V>>>,
    /// Entire write sets applied to the multi-version map; always a superset
    /// of `outputs`, consulted to detect writes dropped between incarnations.
    all_outputs: Vec<Vec<WriteDescriptor<K, V>>>,
}

impl<K, V> TxnInputOutput<K, V> {
    pub(crate) fn new(num_txns: usize) -> Self {
        Self {
            inputs: (0..num_txns).map(|_| Vec::new()).collect(),
            outputs: (0..num_txns).map(|_| Vec::new()).collect(),
            all_outputs: (0..num_txns).map(|_| Vec::new()).collect(),
        }
    }

    pub fn num_txns(&self) -> usize {
        self.inputs.len()
    }

    pub fn read_set(&self, txn_idx: TxnIndex) -> &[ReadDescriptor<K>] {
        &self.inputs[txn_idx as usize]
    }

    pub fn write_set(&self, txn_idx: TxnIndex) -> &[WriteDescriptor<K, V>] {
        &self.outputs[txn_idx as usize]
    }

    pub fn all_write_set(&self, txn_idx: TxnIndex) -> &[WriteDescriptor<K, V>] {
        &self.all_outputs[txn_idx as usize]
    }

    pub(crate) fn record(
        &mut self,
        txn_idx: TxnIndex,
        input: Vec<ReadDescriptor<K>>,
        output: Vec<WriteDescriptor<K, V>>,
        all_output: Vec<WriteDescriptor<K, V>>,
    ) {
        self.inputs[txn_idx as usize] = input;
        self.outputs[txn_idx as usize] = output;
        self.all_outputs[txn_idx as usize] = all_output;
    }
}

/// True when `new_set` writes at least one path absent from `prev_set`.
pub(crate) fn has_new_write<K: Eq + Hash, V>(
    new_set: &[WriteDescriptor<K, V>],
    prev_set: &[WriteDescriptor<K, V>],
) -> bool {
    if new_set.is_empty() {
        return false;
    }
    if prev_set.is_empty() || new_set.len() > prev_set.len() {
        return true;
    }

    let prev_paths: HashSet<&K> = prev_set.iter().map(|w| &w.path).collect();
    new_set.iter().any(|w| !prev_paths.contains(&w.path))
}
