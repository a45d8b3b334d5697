// SPDX-License-Identifier: Apache-2.0

use crate::{
    key::{Address, Key, NONCE_SUBPATH},
    task::{ExecTask, ExecutionStatus, TaskOutput},
};
use blockstm_mvhashmap::{
    types::{Incarnation, MVReadResult, ReadDescriptor, ReadKind, TxnIndex, Version,
        WriteDescriptor},
    MVHashMap,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

// Burn wall-clock like the simulated workloads do; thread sleeping is too
// coarse at microsecond granularity.
pub(crate) fn spin(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    NonIo,
}

#[derive(Clone, Debug)]
pub(crate) struct Op {
    pub(crate) kind: OpKind,
    pub(crate) key: Key,
    pub(crate) duration: Duration,
    pub(crate) value: u64,
}

/// A simulated transaction: reads and checks its sender's nonce, writes the
/// incremented nonce back, then performs a shuffled mix of reads, writes and
/// non-IO work against generated paths.
pub(crate) struct TestExecTask {
    pub(crate) txn_idx: TxnIndex,
    pub(crate) ops: Vec<Op>,
    pub(crate) sender: Address,
    pub(crate) nonce: u64,
}

impl ExecTask for TestExecTask {
    type Error = String;
    type Key = Key;
    type Sender = Address;
    type Value = u64;

    fn execute(
        &self,
        mvh: &MVHashMap<Key, u64>,
        incarnation: Incarnation,
    ) -> ExecutionStatus<TaskOutput<Key, u64>, String> {
        // Simulated setup time.
        spin(Duration::from_micros(50));

        let version = Version::new(self.txn_idx, incarnation);
        let mut read_map: HashMap<Key, ReadDescriptor<Key>> = HashMap::new();
        let mut write_map: HashMap<Key, WriteDescriptor<Key, u64>> = HashMap::new();
        let mut dep: TxnIndex = -1;

        for (op_idx, op) in self.ops.iter().enumerate() {
            match op.kind {
                OpKind::Read => {
                    // Reads of own writes are served locally.
                    if write_map.contains_key(&op.key) {
                        spin(op.duration);
                        continue;
                    }

                    match mvh.read(&op.key, self.txn_idx) {
                        MVReadResult::Done {
                            version: write_version,
                            value,
                        } => {
                            // The first op is always the nonce read; seeing
                            // a wrong nonce means a same-sender predecessor
                            // is still in flight somewhere below.
                            if op_idx == 0 && *value != self.nonce {
                                return ExecutionStatus::SpeculativeAbort(None);
                            }
                            spin(op.duration);
                            read_map.insert(op.key, ReadDescriptor {
                                path: op.key,
                                kind: ReadKind::Map,
                                version: write_version,
                            });
                        },
                        MVReadResult::None => {
                            spin(op.duration);
                            read_map.insert(op.key, ReadDescriptor {
                                path: op.key,
                                kind: ReadKind::Storage,
                                version: Version::storage(),
                            });
                        },
                        MVReadResult::Dependency(dep_idx) => {
                            dep = dep.max(dep_idx);
                        },
                    }
                },
                OpKind::Write => {
                    write_map.insert(op.key, WriteDescriptor {
                        path: op.key,
                        version,
                        value: op.value,
                    });
                },
                OpKind::NonIo => spin(op.duration),
            }
        }

        if dep != -1 {
            return ExecutionStatus::SpeculativeAbort(Some(dep));
        }

        let writes: Vec<_> = write_map.into_values().collect();
        ExecutionStatus::Success(TaskOutput {
            reads: read_map.into_values().collect(),
            writes: writes.clone(),
            all_writes: writes,
        })
    }

    fn sender(&self) -> Address {
        self.sender
    }
}

/// The final write set the task produces regardless of scheduling: later ops
/// to the same key win, exactly as in `execute`.
pub(crate) fn expected_writes(task: &TestExecTask) -> HashMap<Key, u64> {
    let mut writes = HashMap::new();
    for op in &task.ops {
        if op.kind == OpKind::Write {
            writes.insert(op.key, op.value);
        }
    }
    writes
}

pub(crate) type Timer = Box<dyn FnMut(usize, usize) -> Duration>;

pub(crate) fn rand_timer(seed: u64, min_us: u64, max_us: u64) -> Timer {
    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move |_, _| Duration::from_micros(rng.gen_range(min_us..max_us)))
}

/// Every `i`-th transaction's `j`-th op takes 100x the maximum duration.
pub(crate) fn long_tail_timer(seed: u64, min_us: u64, max_us: u64, i: usize, j: usize) -> Timer {
    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move |txn_idx, op_idx| {
        if txn_idx % i == 0 && op_idx == j {
            Duration::from_micros(max_us * 100)
        } else {
            Duration::from_micros(rng.gen_range(min_us..max_us))
        }
    })
}

pub(crate) fn read_timer(seed: u64) -> Timer {
    rand_timer(seed, 4, 12)
}

pub(crate) fn write_timer(seed: u64) -> Timer {
    rand_timer(seed, 2, 6)
}

pub(crate) fn non_io_timer(seed: u64) -> Timer {
    rand_timer(seed, 1, 2)
}

/// Build `num_txns` simulated transactions. The first two ops of every
/// transaction read and bump the sender's nonce; the remaining reads, writes
/// and non-IO ops are shuffled and pointed at generated paths. Returns the
/// tasks and the summed duration of the shuffled tail, i.e. the serial cost
/// of everything past the nonce handling.
#[allow(clippy::too_many_arguments)]
pub(crate) fn task_factory(
    num_txns: usize,
    mut sender: impl FnMut(usize) -> Address,
    num_reads: usize,
    num_writes: usize,
    num_non_io: usize,
    path_generator: impl Fn(&Address, usize) -> Key,
    mut read_time: Timer,
    mut write_time: Timer,
    mut non_io_time: Timer,
    rng: &mut StdRng,
) -> (Vec<TestExecTask>, Duration) {
    let mut tasks = Vec::with_capacity(num_txns);
    let mut serial_duration = Duration::ZERO;
    let mut sender_nonces: HashMap<Address, u64> = HashMap::new();

    for i in 0..num_txns {
        let s = sender(i);
        let nonce_key = Key::for_subpath(&s, NONCE_SUBPATH);
        let nonce = *sender_nonces.get(&s).unwrap_or(&0);
        sender_nonces.insert(s, nonce + 1);

        let mut ops = Vec::with_capacity(num_reads + num_writes + num_non_io);
        ops.push(Op {
            kind: OpKind::Read,
            key: nonce_key,
            duration: read_time(i, 0),
            value: nonce,
        });
        ops.push(Op {
            kind: OpKind::Write,
            key: nonce_key,
            duration: write_time(i, 1),
            value: nonce + 1,
        });

        let placeholder = |kind| Op {
            kind,
            key: nonce_key,
            duration: Duration::ZERO,
            value: 0,
        };
        for _ in 0..num_reads.saturating_sub(1) {
            ops.push(placeholder(OpKind::Read));
        }
        for _ in 0..num_writes.saturating_sub(1) {
            ops.push(placeholder(OpKind::Write));
        }
        for _ in 0..num_non_io {
            ops.push(placeholder(OpKind::NonIo));
        }

        // Shuffle everything but the leading nonce ops.
        for j in 2..ops.len() {
            let k = rng.gen_range(j..ops.len());
            ops.swap(j, k);
        }

        for j in 2..ops.len() {
            let op = &mut ops[j];
            match op.kind {
                OpKind::Read => {
                    op.key = path_generator(&s, j);
                    op.duration = read_time(i, j);
                },
                OpKind::Write => {
                    op.key = path_generator(&s, j);
                    op.duration = write_time(i, j);
                    op.value = (i * 1000 + j) as u64;
                },
                OpKind::NonIo => {
                    op.duration = non_io_time(i, j);
                },
            }
            serial_duration += op.duration;
        }

        tasks.push(TestExecTask {
            txn_idx: i as TxnIndex,
            ops,
            sender: s,
            nonce,
        });
    }

    (tasks, serial_duration)
}
