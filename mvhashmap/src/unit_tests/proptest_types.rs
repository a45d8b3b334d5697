// SPDX-License-Identifier: Apache-2.0

use crate::{
    types::{MVReadResult, TxnIndex, Version},
    MVHashMap,
};
use proptest::{collection::vec, prelude::*, sample::Index};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicUsize, Ordering},
};

const DEFAULT_TIMEOUT: u64 = 30;

#[derive(Debug, Clone)]
enum Operator {
    Write(u64),
    Read,
}

#[derive(Debug, PartialEq, Eq)]
enum ExpectedOutput {
    NotInMap,
    Value(u64),
}

struct Baseline<K>(HashMap<K, BTreeMap<TxnIndex, u64>>);

impl<K: Hash + Eq + Clone + Debug> Baseline<K> {
    fn new(txns: &[(K, Operator)]) -> Self {
        let mut baseline: HashMap<K, BTreeMap<TxnIndex, u64>> = HashMap::new();
        for (idx, (k, op)) in txns.iter().enumerate() {
            if let Operator::Write(v) = op {
                baseline
                    .entry(k.clone())
                    .or_default()
                    .insert(idx as TxnIndex, *v);
            }
        }
        Self(baseline)
    }

    fn get(&self, key: &K, txn_idx: TxnIndex) -> ExpectedOutput {
        self.0
            .get(key)
            .and_then(|tree| tree.range(..txn_idx).next_back())
            .map_or(ExpectedOutput::NotInMap, |(_, v)| ExpectedOutput::Value(*v))
    }
}

fn operator_strategy() -> impl Strategy<Value = Operator> {
    prop_oneof![
        2 => any::<u64>().prop_map(Operator::Write),
        1 => Just(Operator::Read),
    ]
}

fn run_and_assert<K>(
    universe: Vec<K>,
    transaction_gens: Vec<(Index, Operator)>,
) -> Result<(), TestCaseError>
where
    K: Send + Sync + Clone + Hash + Eq + Debug,
{
    let transactions: Vec<(K, Operator)> = transaction_gens
        .into_iter()
        .map(|(idx, op)| (idx.get(&universe).clone(), op))
        .collect();

    let baseline = Baseline::new(&transactions);
    let map = MVHashMap::<K, u64>::new();

    // Make estimate placeholders for all versions to be written, so reads
    // racing the writer threads observe a dependency instead of a miss, and
    // the correct values appear at the end of the concurrent execution.
    for (idx, (key, op)) in transactions.iter().enumerate() {
        if let Operator::Write(_) = op {
            map.write(key.clone(), Version::new(idx as TxnIndex, 0), 0);
            map.mark_estimate(key, idx as TxnIndex);
        }
    }

    let current_idx = AtomicUsize::new(0);

    // Spawn a few threads in parallel to commit each operator.
    rayon::scope(|s| {
        for _ in 0..universe.len() {
            s.spawn(|_| loop {
                // Each thread will eagerly fetch an Operator to execute.
                let idx = current_idx.fetch_add(1, Ordering::Relaxed);
                if idx >= transactions.len() {
                    // Abort when all transactions are processed.
                    break;
                }
                let key = &transactions[idx].0;
                match &transactions[idx].1 {
                    Operator::Read => {
                        let expected = baseline.get(key, idx as TxnIndex);

                        let mut retry_attempts = 0;
                        loop {
                            match map.read(key, idx as TxnIndex) {
                                MVReadResult::Done { value, .. } => {
                                    assert_eq!(
                                        expected,
                                        ExpectedOutput::Value(*value),
                                        "{:?}",
                                        idx
                                    );
                                    break;
                                },
                                MVReadResult::None => {
                                    assert_eq!(expected, ExpectedOutput::NotInMap, "{:?}", idx);
                                    break;
                                },
                                MVReadResult::Dependency(_) => (),
                            }
                            retry_attempts += 1;
                            if retry_attempts > DEFAULT_TIMEOUT {
                                panic!("Failed to get value for {:?}", idx);
                            }
                            std::thread::sleep(std::time::Duration::from_millis(100));
                        }
                    },
                    Operator::Write(v) => {
                        map.write(key.clone(), Version::new(idx as TxnIndex, 1), *v);
                    },
                }
            })
        }
    });

    Ok(())
}

proptest! {
    #[test]
    fn single_key_proptest(
        universe in vec(any::<[u8; 32]>(), 1),
        transactions in vec((any::<Index>(), operator_strategy()), 100),
    ) {
        run_and_assert(universe, transactions)?;
    }

    #[test]
    fn multi_key_proptest(
        universe in vec(any::<[u8; 32]>(), 10),
        transactions in vec((any::<Index>(), operator_strategy()), 100),
    ) {
        run_and_assert(universe, transactions)?;
    }
}
