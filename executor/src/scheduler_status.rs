// SPDX-License-Identifier: Apache-2.0

use blockstm_mvhashmap::types::TxnIndex;
use std::collections::{BTreeMap, BTreeSet};

/// Per-transaction execution state machine plus the dependency graph edges
/// between transactions. At any point a transaction is in at most one of the
/// pending, in-progress or complete sets; a transaction in none of them is
/// blocked behind outstanding dependencies (or idle between transitions).
///
/// Only the coordinator thread calls these methods, so no synchronisation is
/// required. Queues are ordered by transaction index ascending so earlier
/// transactions always preempt later ones; re-execution stays bounded only
/// under this discipline.
pub(crate) struct StatusManager {
    pending: BTreeSet<TxnIndex>,
    in_progress: BTreeSet<TxnIndex>,
    complete: BTreeSet<TxnIndex>,

    /// Blocker index -> transactions that may not make progress until the
    /// blocker completes.
    dependency: BTreeMap<TxnIndex, BTreeSet<TxnIndex>>,
    /// Outstanding blockers per transaction, -1 once the transaction is
    /// complete. The -1 encoding is observed by the scheduler.
    block_count: Vec<i32>,
}

impl StatusManager {
    /// A manager with every transaction initially pending (execution tasks).
    pub(crate) fn with_all_pending(num_txns: usize) -> Self {
        Self {
            pending: (0..num_txns as TxnIndex).collect(),
            ..Self::with_no_pending(num_txns)
        }
    }

    /// A manager with an empty queue (validation tasks).
    pub(crate) fn with_no_pending(num_txns: usize) -> Self {
        Self {
            pending: BTreeSet::new(),
            in_progress: BTreeSet::new(),
            complete: BTreeSet::new(),
            dependency: BTreeMap::new(),
            block_count: vec![0; num_txns],
        }
    }

    pub(crate) fn push_pending(&mut self, txn_idx: TxnIndex) {
        self.pending.insert(txn_idx);
    }

    pub(crate) fn push_pending_set(&mut self, ixs: &[TxnIndex]) {
        self.pending.extend(ixs.iter().copied());
    }

    /// Pop the smallest pending index into in-progress, -1 if none pending.
    pub(crate) fn take_next_pending(&mut self) -> TxnIndex {
        match self.pending.pop_first() {
            Some(txn_idx) => {
                self.in_progress.insert(txn_idx);
                txn_idx
            },
            None => -1,
        }
    }

    pub(crate) fn mark_complete(&mut self, txn_idx: TxnIndex) {
        self.in_progress.remove(&txn_idx);
        self.complete.insert(txn_idx);
        self.block_count[txn_idx as usize] = -1;
    }

    pub(crate) fn clear_in_progress(&mut self, txn_idx: TxnIndex) {
        self.in_progress.remove(&txn_idx);
    }

    pub(crate) fn clear_complete(&mut self, txn_idx: TxnIndex) {
        self.complete.remove(&txn_idx);
        self.block_count[txn_idx as usize] = 0;
    }

    pub(crate) fn clear_pending(&mut self, txn_idx: TxnIndex) {
        self.pending.remove(&txn_idx);
    }

    pub(crate) fn check_pending(&self, txn_idx: TxnIndex) -> bool {
        self.pending.contains(&txn_idx)
    }

    pub(crate) fn check_complete(&self, txn_idx: TxnIndex) -> bool {
        self.complete.contains(&txn_idx)
    }

    /// Record the edge blocker -> txn_idx. Returns false (and records
    /// nothing) when the blocker is already complete, true when txn_idx is
    /// now blocked behind it.
    pub(crate) fn add_dependencies(&mut self, blocker: TxnIndex, txn_idx: TxnIndex) -> bool {
        if self.check_complete(blocker) {
            return false;
        }
        debug_assert!(
            self.block_count[txn_idx as usize] >= 0,
            "A complete transaction cannot acquire new blockers"
        );
        if self.dependency.entry(blocker).or_default().insert(txn_idx) {
            self.block_count[txn_idx as usize] += 1;
        }
        true
    }

    /// Treat `blocker` as now-complete: decrement the block count of every
    /// transaction waiting on it and push the fully released ones pending.
    pub(crate) fn remove_dependency(&mut self, blocker: TxnIndex) {
        if let Some(deps) = self.dependency.remove(&blocker) {
            for txn_idx in deps {
                let count = &mut self.block_count[txn_idx as usize];
                *count -= 1;
                if *count == 0 {
                    self.pending.insert(txn_idx);
                }
            }
        }
    }

    pub(crate) fn block_count(&self, txn_idx: TxnIndex) -> i32 {
        self.block_count[txn_idx as usize]
    }

    /// Smallest pending index, -1 if none.
    pub(crate) fn min_pending(&self) -> TxnIndex {
        self.pending.first().copied().unwrap_or(-1)
    }

    /// Largest k such that every index in 0..=k is complete, -1 if 0 is not.
    pub(crate) fn max_all_complete(&self) -> TxnIndex {
        let mut expected = 0;
        for &txn_idx in &self.complete {
            if txn_idx != expected {
                break;
            }
            expected += 1;
        }
        expected - 1
    }

    pub(crate) fn count_complete(&self) -> usize {
        self.complete.len()
    }

    /// Complete indices in [from..=max_all_complete], scheduled for
    /// re-validation after a write-set shape change.
    pub(crate) fn revalidation_range(&self, from: TxnIndex) -> Vec<TxnIndex> {
        let max = self.max_all_complete();
        if from > max {
            Vec::new()
        } else {
            (from..=max).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_queue_pops_smallest_first() {
        let mut m = StatusManager::with_no_pending(5);
        m.push_pending(3);
        m.push_pending(1);
        m.push_pending_set(&[4, 2]);

        assert_eq!(1, m.min_pending());
        assert!(m.check_pending(3));
        assert_eq!(1, m.take_next_pending());
        assert_eq!(2, m.take_next_pending());

        m.clear_pending(3);
        assert_eq!(4, m.take_next_pending());
        assert_eq!(-1, m.take_next_pending());
        assert_eq!(-1, m.min_pending());
    }

    #[test]
    fn push_pending_deduplicates() {
        let mut m = StatusManager::with_no_pending(3);
        m.push_pending(2);
        m.push_pending(2);
        assert_eq!(2, m.take_next_pending());
        assert_eq!(-1, m.take_next_pending());
    }

    #[test]
    fn complete_prefix_tracking() {
        let mut m = StatusManager::with_all_pending(4);
        assert_eq!(-1, m.max_all_complete());

        for _ in 0..4 {
            m.take_next_pending();
        }
        m.mark_complete(1);
        m.mark_complete(3);
        // 0 is not complete yet.
        assert_eq!(-1, m.max_all_complete());
        assert_eq!(2, m.count_complete());

        m.mark_complete(0);
        assert_eq!(1, m.max_all_complete());
        m.mark_complete(2);
        assert_eq!(3, m.max_all_complete());

        // Invalidation reopens the prefix.
        m.clear_complete(2);
        assert_eq!(1, m.max_all_complete());
        assert_eq!(0, m.block_count(2));
        assert_eq!(-1, m.block_count(1));
    }

    #[test]
    fn revalidation_range_spans_complete_prefix() {
        let mut m = StatusManager::with_all_pending(5);
        for _ in 0..5 {
            m.take_next_pending();
        }
        for txn_idx in 0..4 {
            m.mark_complete(txn_idx);
        }

        assert_eq!(vec![1, 2, 3], m.revalidation_range(1));
        assert_eq!(vec![3], m.revalidation_range(3));
        assert!(m.revalidation_range(4).is_empty());
    }

    #[test]
    fn dependencies_block_until_release() {
        let mut m = StatusManager::with_all_pending(4);

        // Serialise 2 behind 0, as for a shared sender.
        assert!(m.add_dependencies(0, 2));
        m.clear_pending(2);
        assert_eq!(1, m.block_count(2));

        assert_eq!(0, m.take_next_pending());
        assert_eq!(1, m.take_next_pending());
        // 2 was cleared from pending, so 3 is next.
        assert_eq!(3, m.take_next_pending());
        assert_eq!(-1, m.take_next_pending());

        m.mark_complete(0);
        m.remove_dependency(0);
        assert_eq!(0, m.block_count(2));
        assert!(m.check_pending(2));

        // A complete blocker no longer accepts edges.
        assert!(!m.add_dependencies(0, 3));
        assert_eq!(0, m.block_count(3));
    }

    #[test]
    fn multiple_blockers_release_one_by_one() {
        let mut m = StatusManager::with_no_pending(5);
        assert!(m.add_dependencies(1, 4));
        assert!(m.add_dependencies(2, 4));
        assert_eq!(2, m.block_count(4));

        m.remove_dependency(1);
        assert_eq!(1, m.block_count(4));
        assert!(!m.check_pending(4));

        m.remove_dependency(2);
        assert_eq!(0, m.block_count(4));
        assert!(m.check_pending(4));
    }

    #[test]
    fn duplicate_edges_count_once() {
        let mut m = StatusManager::with_no_pending(3);
        assert!(m.add_dependencies(0, 2));
        assert!(m.add_dependencies(0, 2));
        assert_eq!(1, m.block_count(2));

        m.remove_dependency(0);
        assert_eq!(0, m.block_count(2));
    }
}
