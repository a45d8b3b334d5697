// SPDX-License-Identifier: Apache-2.0

use crate::{
    executor::{validate_version, ParallelExecutor},
    key::{address_from_u64, hash_from_u64, Address, Key, NONCE_SUBPATH},
    task::{ExecTask, ExecutionStatus, TaskOutput},
    txn_last_input_output::TxnInputOutput,
};
use blockstm_mvhashmap::{
    types::{Incarnation, ReadDescriptor, ReadKind, TxnIndex, Version},
    MVHashMap,
};
use claims::{assert_err, assert_ok};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::HashSet, time::Instant};
use tracing::info;

mod types;
use types::{
    expected_writes, long_tail_timer, non_io_timer, read_timer, task_factory, write_timer,
    TestExecTask,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn state_path(sender: &Address, j: usize) -> Key {
    Key::for_storage_slot(sender, &hash_from_u64(j as u64))
}

// Every transaction hammers the same hot subpath.
fn dex_path(_sender: &Address, _j: usize) -> Key {
    Key::for_subpath(&address_from_u64(0), 1)
}

fn run_parallel(tasks: &[TestExecTask]) -> TxnInputOutput<Key, u64> {
    init_logging();
    let executor = ParallelExecutor::default();

    let start = Instant::now();
    let io = assert_ok!(executor.execute(tasks));
    info!(
        num_txns = tasks.len(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "scenario finished"
    );
    io
}

/// Committed reads must match what strictly serial execution would observe:
/// every map read names an earlier writer whose final validation write set
/// still contains the path, storage reads carry the sentinel version, and
/// the full write set contains the validation write set.
fn check_serial_equivalence(io: &TxnInputOutput<Key, u64>, tasks: &[TestExecTask]) {
    for i in 0..tasks.len() as TxnIndex {
        for r in io.read_set(i) {
            match r.kind {
                ReadKind::Map => {
                    let writer = r.version.txn_index;
                    assert!(
                        (0..i).contains(&writer),
                        "txn {} recorded writer {} outside 0..{}",
                        i,
                        writer,
                        i
                    );
                    assert!(
                        io.write_set(writer).iter().any(|w| w.path == r.path),
                        "write set of txn {} lost the path read by txn {}",
                        writer,
                        i
                    );
                },
                ReadKind::Storage => assert!(r.version.is_storage()),
            }
        }

        let all_paths: HashSet<Key> = io.all_write_set(i).iter().map(|w| w.path).collect();
        for w in io.write_set(i) {
            assert!(
                all_paths.contains(&w.path),
                "all_writes of txn {} must contain its validation writes",
                i
            );
        }
    }
}

/// The recorded outputs must be exactly the final incarnation's write set,
/// which for these tasks is statically known from their op lists.
fn check_outputs_match_tasks(io: &TxnInputOutput<Key, u64>, tasks: &[TestExecTask]) {
    for (i, task) in tasks.iter().enumerate() {
        let i = i as TxnIndex;
        let expected = expected_writes(task);
        let got: std::collections::HashMap<Key, u64> =
            io.write_set(i).iter().map(|w| (w.path, w.value)).collect();
        assert_eq!(expected, got, "outputs of txn {} do not match its writes", i);

        for w in io.write_set(i) {
            assert_eq!(i, w.version.txn_index);
        }
    }
}

/// For batches alternating over a fixed sender cycle, the recorded nonce
/// read of txn i must come from the previous same-sender transaction.
fn check_nonce_chain(io: &TxnInputOutput<Key, u64>, tasks: &[TestExecTask], stride: usize) {
    for (i, task) in tasks.iter().enumerate() {
        let nonce_key = Key::for_subpath(&task.sender, NONCE_SUBPATH);
        let r = io
            .read_set(i as TxnIndex)
            .iter()
            .find(|r| r.path == nonce_key)
            .expect("The nonce read must be recorded");
        if i >= stride {
            assert_eq!(ReadKind::Map, r.kind, "txn {} nonce read", i);
            assert_eq!((i - stride) as TxnIndex, r.version.txn_index);
        } else {
            assert_eq!(ReadKind::Storage, r.kind, "txn {} nonce read", i);
        }
    }
}

#[test]
fn less_conflicts() {
    let mut rng = StdRng::seed_from_u64(0x1e55);
    let mut sender_rng = StdRng::seed_from_u64(0x1e55 ^ 0xff);
    let sender = move |i: usize| {
        let spread = sender_rng.gen_range(10..20);
        address_from_u64((i % spread) as u64)
    };

    let (tasks, serial_duration) = task_factory(
        100,
        sender,
        20,
        20,
        100,
        state_path,
        read_timer(1),
        write_timer(2),
        non_io_timer(3),
        &mut rng,
    );

    let start = Instant::now();
    let io = run_parallel(&tasks);
    info!(
        parallel_us = start.elapsed().as_micros() as u64,
        serial_us = serial_duration.as_micros() as u64,
        "less_conflicts timings"
    );

    check_serial_equivalence(&io, &tasks);
    check_outputs_match_tasks(&io, &tasks);
}

#[test]
fn alternating_tx() {
    let mut rng = StdRng::seed_from_u64(0xa17e);
    let sender = |i: usize| address_from_u64((i % 2) as u64);

    let (tasks, _) = task_factory(
        200,
        sender,
        20,
        20,
        100,
        state_path,
        read_timer(4),
        write_timer(5),
        non_io_timer(6),
        &mut rng,
    );

    let io = run_parallel(&tasks);
    check_serial_equivalence(&io, &tasks);
    check_outputs_match_tasks(&io, &tasks);
    // Strict pairwise ordering per sender.
    check_nonce_chain(&io, &tasks, 2);
}

#[test]
fn more_conflicts() {
    let mut rng = StdRng::seed_from_u64(0x302e);
    let mut sender_rng = StdRng::seed_from_u64(0x302e ^ 0xff);
    let sender = move |i: usize| {
        let spread = sender_rng.gen_range(10..20);
        address_from_u64((i / spread) as u64)
    };

    let (tasks, _) = task_factory(
        300,
        sender,
        20,
        20,
        100,
        state_path,
        read_timer(7),
        write_timer(8),
        non_io_timer(9),
        &mut rng,
    );

    let io = run_parallel(&tasks);
    check_serial_equivalence(&io, &tasks);
    check_outputs_match_tasks(&io, &tasks);
}

#[test]
fn random_tx() {
    let mut rng = StdRng::seed_from_u64(0x7a4d);
    let mut sender_rng = StdRng::seed_from_u64(0x7a4d ^ 0xff);
    let sender = move |_i: usize| address_from_u64(sender_rng.gen_range(0..10));

    let (tasks, _) = task_factory(
        100,
        sender,
        20,
        20,
        100,
        state_path,
        read_timer(10),
        write_timer(11),
        non_io_timer(12),
        &mut rng,
    );

    let io = run_parallel(&tasks);
    check_serial_equivalence(&io, &tasks);
    check_outputs_match_tasks(&io, &tasks);
}

#[test]
fn long_tail_read() {
    let mut rng = StdRng::seed_from_u64(0x7a11);
    let mut sender_rng = StdRng::seed_from_u64(0x7a11 ^ 0xff);
    let sender = move |i: usize| {
        let spread = sender_rng.gen_range(10..20);
        address_from_u64((i / spread) as u64)
    };

    // Every 7th transaction's 10th read takes 100x longer; head-of-line
    // stalls must not keep the rest from completing and validating.
    let (tasks, _) = task_factory(
        140,
        sender,
        20,
        20,
        100,
        state_path,
        long_tail_timer(13, 4, 12, 7, 10),
        write_timer(14),
        non_io_timer(15),
        &mut rng,
    );

    let io = run_parallel(&tasks);
    check_serial_equivalence(&io, &tasks);
    check_outputs_match_tasks(&io, &tasks);
}

#[test]
fn dex_scenario() {
    let mut rng = StdRng::seed_from_u64(0xde11);
    let sender = |i: usize| address_from_u64(i as u64);

    let (tasks, _) = task_factory(
        100,
        sender,
        20,
        20,
        100,
        dex_path,
        read_timer(16),
        write_timer(17),
        non_io_timer(18),
        &mut rng,
    );

    let io = run_parallel(&tasks);
    check_serial_equivalence(&io, &tasks);
    check_outputs_match_tasks(&io, &tasks);

    // Every read of the hot (non-nonce) subpath must observe exactly the
    // previous transaction: the hot path forms a strict chain.
    for i in 0..tasks.len() as TxnIndex {
        for r in io.read_set(i) {
            if r.path.is_subpath() && r.path.subpath() != NONCE_SUBPATH {
                assert_eq!(i - 1, r.version.txn_index, "hot-path read of txn {}", i);
            }
        }
    }
}

fn deterministic_batch(seed: u64) -> Vec<TestExecTask> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sender_rng = StdRng::seed_from_u64(seed ^ 0xff);
    let sender = move |_i: usize| address_from_u64(sender_rng.gen_range(0..10));

    let (tasks, _) = task_factory(
        60,
        sender,
        20,
        20,
        100,
        state_path,
        read_timer(seed + 1),
        write_timer(seed + 2),
        non_io_timer(seed + 3),
        &mut rng,
    );
    tasks
}

// Path, served-from-map flag and writer index per read; path and value per
// write. Incarnation numbers are timing-dependent and excluded.
type NormalizedIo = (Vec<Vec<(Key, bool, TxnIndex)>>, Vec<Vec<(Key, u64)>>);

fn normalize(io: &TxnInputOutput<Key, u64>) -> NormalizedIo {
    let mut reads = Vec::with_capacity(io.num_txns());
    let mut writes = Vec::with_capacity(io.num_txns());
    for i in 0..io.num_txns() as TxnIndex {
        let mut r: Vec<(Key, bool, TxnIndex)> = io
            .read_set(i)
            .iter()
            .map(|r| (r.path, r.kind == ReadKind::Map, r.version.txn_index))
            .collect();
        r.sort();
        reads.push(r);

        let mut w: Vec<(Key, u64)> = io.write_set(i).iter().map(|w| (w.path, w.value)).collect();
        w.sort();
        writes.push(w);
    }
    (reads, writes)
}

#[test]
fn deterministic_outputs() {
    let first = normalize(&run_parallel(&deterministic_batch(0xd0d0)));
    let second = normalize(&run_parallel(&deterministic_batch(0xd0d0)));
    assert_eq!(first, second);
}

#[test]
fn empty_batch() {
    let executor = ParallelExecutor::new(1, 1);
    let io = assert_ok!(executor.execute::<TestExecTask>(&[]));
    assert_eq!(0, io.num_txns());
}

struct FailingTask {
    txn_idx: TxnIndex,
    fail_at: TxnIndex,
}

impl ExecTask for FailingTask {
    type Error = String;
    type Key = Key;
    type Sender = Address;
    type Value = u64;

    fn execute(
        &self,
        _mvh: &MVHashMap<Key, u64>,
        _incarnation: Incarnation,
    ) -> ExecutionStatus<TaskOutput<Key, u64>, String> {
        if self.txn_idx == self.fail_at {
            ExecutionStatus::Abort("simulated task failure".to_string())
        } else {
            ExecutionStatus::Success(TaskOutput {
                reads: vec![],
                writes: vec![],
                all_writes: vec![],
            })
        }
    }

    fn sender(&self) -> Address {
        address_from_u64(self.txn_idx as u64)
    }
}

#[test]
fn fatal_error_aborts_the_batch() {
    let tasks: Vec<FailingTask> = (0..20)
        .map(|txn_idx| FailingTask { txn_idx, fail_at: 3 })
        .collect();

    let executor = ParallelExecutor::new(4, 2);
    let err = assert_err!(executor.execute(&tasks));
    assert_eq!("simulated task failure", err);
}

#[test]
fn validate_version_against_map_state() {
    let mvh: MVHashMap<Key, u64> = MVHashMap::new();
    let mut io: TxnInputOutput<Key, u64> = TxnInputOutput::new(3);
    let path = Key::for_subpath(&address_from_u64(1), NONCE_SUBPATH);

    let map_read = |version| {
        vec![ReadDescriptor {
            path,
            kind: ReadKind::Map,
            version,
        }]
    };

    mvh.write(path, Version::new(0, 0), 7);
    io.record(2, map_read(Version::new(0, 0)), vec![], vec![]);
    assert!(validate_version(2, &io, &mvh));

    // A higher incarnation of the writer invalidates the read...
    mvh.write(path, Version::new(0, 1), 8);
    assert!(!validate_version(2, &io, &mvh));
    io.record(2, map_read(Version::new(0, 1)), vec![], vec![]);
    assert!(validate_version(2, &io, &mvh));

    // ...as does an estimate...
    mvh.mark_estimate(&path, 0);
    assert!(!validate_version(2, &io, &mvh));

    // ...and a removed entry.
    mvh.remove(&path, 0);
    assert!(!validate_version(2, &io, &mvh));

    // Storage reads stay valid only while no writer below the reader exists.
    io.record(2, vec![ReadDescriptor {
        path,
        kind: ReadKind::Storage,
        version: Version::storage(),
    }], vec![], vec![]);
    assert!(validate_version(2, &io, &mvh));
    mvh.write(path, Version::new(1, 0), 9);
    assert!(!validate_version(2, &io, &mvh));
}
