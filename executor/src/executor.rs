// SPDX-License-Identifier: Apache-2.0

use crate::{
    scheduler_status::StatusManager,
    task::{ExecTask, ExecutionStatus, TaskOutput},
    txn_last_input_output::{has_new_write, TxnInputOutput},
};
use blockstm_mvhashmap::{
    types::{Incarnation, MVReadResult, ReadKind, TxnIndex, Version},
    MVHashMap,
};
use crossbeam::channel::{bounded, Receiver, Sender};
use rayon::ThreadPool;
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
};
use tracing::info;

/// Default number of workers serving the speculative queue.
pub const DEFAULT_SPECULATIVE_WORKERS: usize = 16;
/// Default number of workers serving the non-speculative queue.
pub const DEFAULT_WORKERS: usize = 8;

/// How far beyond the validated prefix a task may still be handed to the
/// non-speculative queue. Caps the speculative frontier relative to the
/// validated prefix so failed speculation is not amplified.
const DISPATCH_LOOKAHEAD: TxnIndex = 20;

/// One dispatched incarnation.
struct ExecutionJob<'a, T> {
    version: Version,
    task: &'a T,
}

struct ExecutionResult<K, V, E> {
    version: Version,
    status: ExecutionStatus<TaskOutput<K, V>, E>,
}

fn run_worker<'a, T: ExecTask>(
    mvh: &MVHashMap<T::Key, T::Value>,
    task_rx: Receiver<ExecutionJob<'a, T>>,
    result_tx: Sender<ExecutionResult<T::Key, T::Value, T::Error>>,
) {
    while let Ok(job) = task_rx.recv() {
        let status = job.task.execute(mvh, job.version.incarnation);

        // The write set must be visible to any subsequent read or
        // validation by the time the coordinator sees this result.
        if let ExecutionStatus::Success(output) = &status {
            mvh.flush_write_set(&output.all_writes);
        }

        let result = ExecutionResult {
            version: job.version,
            status,
        };
        if result_tx.send(result).is_err() {
            // The coordinator exited early; drop the remaining work.
            break;
        }
    }
}

/// Revalidate the recorded read set of `txn_idx` against the current state
/// of the multi-version map.
///
/// Only called once every transaction below `txn_idx` has completed
/// execution and flushed its current write set, so a read that misses the
/// map also proves that no completed writer below the reader touches the
/// path (a completed writer's entry only leaves the map when the writer
/// stops writing the path altogether).
pub(crate) fn validate_version<K, V>(
    txn_idx: TxnIndex,
    last_io: &TxnInputOutput<K, V>,
    mvh: &MVHashMap<K, V>,
) -> bool
where
    K: Eq + Hash + Clone + Debug,
{
    last_io
        .read_set(txn_idx)
        .iter()
        .all(|r| match mvh.read(&r.path, txn_idx) {
            MVReadResult::Done { version, .. } => r.kind == ReadKind::Map && version == r.version,
            MVReadResult::None => r.kind == ReadKind::Storage,
            MVReadResult::Dependency(_) => false,
        })
}

/// Executes ordered batches of tasks across a pool of speculative and
/// non-speculative workers, producing the same per-transaction input/output
/// sets as strictly serial execution.
pub struct ParallelExecutor {
    num_speculative_workers: usize,
    num_workers: usize,
    worker_pool: ThreadPool,
}

impl ParallelExecutor {
    pub fn new(num_speculative_workers: usize, num_workers: usize) -> Self {
        assert!(
            num_speculative_workers > 0 && num_workers > 0,
            "Both worker pools must be non-empty"
        );
        let worker_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_speculative_workers + num_workers)
            .thread_name(|index| format!("blockstm-worker-{}", index))
            .build()
            .expect("Worker pool must be available");
        Self {
            num_speculative_workers,
            num_workers,
            worker_pool,
        }
    }

    /// Execute the batch, returning the recorded input/output table, or the
    /// first non-recoverable task error. Speculative aborts and validation
    /// failures are handled internally and never surface.
    pub fn execute<T: ExecTask>(
        &self,
        tasks: &[T],
    ) -> Result<TxnInputOutput<T::Key, T::Value>, T::Error> {
        let num_txns = tasks.len();
        if num_txns == 0 {
            return Ok(TxnInputOutput::new(0));
        }

        let mvh = MVHashMap::new();

        // Each index has at most one in-flight incarnation, so queues of
        // batch capacity can never block a send.
        let (task_tx, task_rx) = bounded(num_txns);
        let (spec_task_tx, spec_task_rx) = bounded(num_txns);
        let (result_tx, result_rx) = bounded(num_txns);
        let (spec_result_tx, spec_result_rx) = bounded(num_txns);

        self.worker_pool.in_place_scope(|s| {
            for _ in 0..self.num_speculative_workers {
                let task_rx = spec_task_rx.clone();
                let result_tx = spec_result_tx.clone();
                let mvh = &mvh;
                s.spawn(move |_| run_worker(mvh, task_rx, result_tx));
            }
            for _ in 0..self.num_workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let mvh = &mvh;
                s.spawn(move |_| run_worker(mvh, task_rx, result_tx));
            }
            // The coordinator now holds the only task senders and result
            // receivers; dropping them on return shuts the workers down
            // once their queues drain.
            drop(task_rx);
            drop(spec_task_rx);
            drop(result_tx);
            drop(spec_result_tx);

            Coordinator::new(tasks, &mvh, self.num_speculative_workers, Queues {
                task_tx,
                spec_task_tx,
                result_rx,
                spec_result_rx,
            })
            .run()
        })
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_SPECULATIVE_WORKERS, DEFAULT_WORKERS)
    }
}

struct Queues<'a, T: ExecTask> {
    task_tx: Sender<ExecutionJob<'a, T>>,
    spec_task_tx: Sender<ExecutionJob<'a, T>>,
    result_rx: Receiver<ExecutionResult<T::Key, T::Value, T::Error>>,
    spec_result_rx: Receiver<ExecutionResult<T::Key, T::Value, T::Error>>,
}

/// Single-threaded owner of all scheduling state: consumes results, records
/// input/output sets, reshapes dependencies, drives validation and hands
/// out execution jobs until every index is complete in both execution and
/// validation.
struct Coordinator<'a, T: ExecTask> {
    tasks: &'a [T],
    mvh: &'a MVHashMap<T::Key, T::Value>,
    queues: Queues<'a, T>,

    exec_tasks: StatusManager,
    validate_tasks: StatusManager,
    last_io: TxnInputOutput<T::Key, T::Value>,
    txn_incarnations: Vec<Incarnation>,
    /// Speculative blocker chains per transaction, grown on aborts whose
    /// dependency source is unknown.
    estimate_deps: Vec<Vec<TxnIndex>>,
    bootstrap_width: usize,

    num_execs: u64,
    num_success: u64,
    num_aborts: u64,
    num_validations: u64,
    num_validation_fails: u64,
}

impl<'a, T: ExecTask> Coordinator<'a, T> {
    fn new(
        tasks: &'a [T],
        mvh: &'a MVHashMap<T::Key, T::Value>,
        bootstrap_width: usize,
        queues: Queues<'a, T>,
    ) -> Self {
        let num_txns = tasks.len();
        Self {
            tasks,
            mvh,
            queues,
            exec_tasks: StatusManager::with_all_pending(num_txns),
            validate_tasks: StatusManager::with_no_pending(num_txns),
            last_io: TxnInputOutput::new(num_txns),
            txn_incarnations: vec![0; num_txns],
            estimate_deps: vec![Vec::new(); num_txns],
            bootstrap_width,
            num_execs: 0,
            num_success: 0,
            num_aborts: 0,
            num_validations: 0,
            num_validation_fails: 0,
        }
    }

    fn run(mut self) -> Result<TxnInputOutput<T::Key, T::Value>, T::Error> {
        self.serialize_senders();
        self.bootstrap();

        loop {
            let ExecutionResult { version, status } = self.next_result();
            match status {
                ExecutionStatus::Success(output) => self.on_success(version, output),
                ExecutionStatus::SpeculativeAbort(dep) => self.on_abort(version, dep),
                ExecutionStatus::Abort(err) => return Err(err),
            }

            self.drain_validations();
            self.dispatch_pending();

            let num_txns = self.tasks.len();
            if self.validate_tasks.count_complete() == num_txns
                && self.exec_tasks.count_complete() == num_txns
            {
                info!(
                    execs = self.num_execs,
                    success = self.num_success,
                    aborts = self.num_aborts,
                    validations = self.num_validations,
                    failures = self.num_validation_fails,
                    tasks_to_execs = num_txns as f64 / self.num_execs as f64,
                    "parallel execution summary"
                );
                return Ok(self.last_io);
            }
        }
    }

    /// Chain each sender's transactions in block order: a transaction with
    /// an earlier same-sender transaction starts blocked behind it.
    fn serialize_senders(&mut self) {
        let mut prev_sender_txn: HashMap<T::Sender, TxnIndex> = HashMap::new();
        for (idx, task) in self.tasks.iter().enumerate() {
            let idx = idx as TxnIndex;
            let sender = task.sender();
            if let Some(&prev) = prev_sender_txn.get(&sender) {
                self.exec_tasks.add_dependencies(prev, idx);
                self.exec_tasks.clear_pending(idx);
            }
            prev_sender_txn.insert(sender, idx);
        }
    }

    fn bootstrap(&mut self) {
        for _ in 0..self.bootstrap_width {
            let txn_idx = self.exec_tasks.take_next_pending();
            if txn_idx != -1 {
                self.dispatch_job(txn_idx, true);
            }
        }
    }

    fn dispatch_job(&mut self, txn_idx: TxnIndex, speculative: bool) {
        self.num_execs += 1;
        let job = ExecutionJob {
            version: Version::new(txn_idx, self.txn_incarnations[txn_idx as usize]),
            task: &self.tasks[txn_idx as usize],
        };
        let sender = if speculative {
            &self.queues.spec_task_tx
        } else {
            &self.queues.task_tx
        };
        sender.send(job).expect("Workers must be available");
    }

    /// Prefer results from the non-speculative queue, then speculative, and
    /// only block when neither is ready.
    fn next_result(&self) -> ExecutionResult<T::Key, T::Value, T::Error> {
        if let Ok(result) = self.queues.result_rx.try_recv() {
            return result;
        }
        if let Ok(result) = self.queues.spec_result_rx.try_recv() {
            return result;
        }

        let result_rx = &self.queues.result_rx;
        let spec_result_rx = &self.queues.spec_result_rx;
        crossbeam::select! {
            recv(result_rx) -> result => {
                result.expect("Workers hold the result sender")
            },
            recv(spec_result_rx) -> result => {
                result.expect("Workers hold the result sender")
            },
        }
    }

    fn on_success(&mut self, version: Version, output: TaskOutput<T::Key, T::Value>) {
        let txn_idx = version.txn_index;
        let TaskOutput {
            reads,
            writes,
            all_writes,
        } = output;

        if version.incarnation == 0 {
            self.last_io.record(txn_idx, reads, writes, all_writes);
        } else {
            // A write outside the previous write set may invalidate any
            // complete transaction above this one.
            if has_new_write(&all_writes, self.last_io.all_write_set(txn_idx)) {
                let range = self.exec_tasks.revalidation_range(txn_idx + 1);
                self.validate_tasks.push_pending_set(&range);
            }

            // Remove entries that were previously written but are no longer
            // written by the latest incarnation.
            {
                let new_paths: HashSet<&T::Key> = all_writes.iter().map(|w| &w.path).collect();
                for prev in self.last_io.all_write_set(txn_idx) {
                    if !new_paths.contains(&prev.path) {
                        self.mvh.remove(&prev.path, txn_idx);
                    }
                }
            }

            self.last_io.record(txn_idx, reads, writes, all_writes);
        }

        self.validate_tasks.push_pending(txn_idx);
        self.exec_tasks.mark_complete(txn_idx);
        self.num_success += 1;

        self.exec_tasks.remove_dependency(txn_idx);
    }

    fn on_abort(&mut self, version: Version, dep: Option<TxnIndex>) {
        let txn_idx = version.txn_index;

        let mut blocked = false;
        match dep {
            Some(dep_idx) => {
                // Speculative blockers above the concrete dependency are
                // released before waiting on the real one.
                while let Some(&est) = self.estimate_deps[txn_idx as usize].last() {
                    if est <= dep_idx {
                        break;
                    }
                    self.exec_tasks.remove_dependency(est);
                    self.estimate_deps[txn_idx as usize].pop();
                }
                blocked = self.exec_tasks.add_dependencies(dep_idx, txn_idx);
            },
            None => {
                if self.exec_tasks.block_count(txn_idx) >= 0 {
                    // Unknown dependency source: block on a guessed
                    // predecessor and widen the guess on every retry.
                    let estimate = self.estimate_deps[txn_idx as usize]
                        .last()
                        .copied()
                        .unwrap_or(0);
                    blocked = self.exec_tasks.add_dependencies(estimate, txn_idx);
                    let next_estimate = (estimate + 1).min(txn_idx - 1);
                    self.estimate_deps[txn_idx as usize].push(next_estimate);
                } else {
                    // An abort for an already-complete index was only ever
                    // reachable through scheduler races that are closed with
                    // a single coordinator; nothing to reshape.
                    debug_assert!(
                        self.exec_tasks.check_complete(txn_idx),
                        "A negative block count must mean the index is complete"
                    );
                }
            },
        }

        self.exec_tasks.clear_in_progress(txn_idx);
        if !blocked {
            self.exec_tasks.push_pending(txn_idx);
        }
        self.txn_incarnations[txn_idx as usize] += 1;
        self.num_aborts += 1;
    }

    /// Validate every pending candidate inside the fully-executed prefix.
    fn drain_validations(&mut self) {
        let max_complete = self.exec_tasks.max_all_complete();

        let mut to_validate = Vec::new();
        loop {
            let min_pending = self.validate_tasks.min_pending();
            if min_pending < 0 || min_pending > max_complete {
                break;
            }
            to_validate.push(self.validate_tasks.take_next_pending());
        }

        for txn_idx in to_validate {
            self.num_validations += 1;

            if validate_version(txn_idx, &self.last_io, self.mvh) {
                self.validate_tasks.mark_complete(txn_idx);
            } else {
                self.num_validation_fails += 1;

                // The recorded writes may be stale: expose them as estimates
                // so later readers block on this transaction instead of
                // consuming them.
                for w in self.last_io.all_write_set(txn_idx) {
                    self.mvh.mark_estimate(&w.path, txn_idx);
                }

                // Every complete transaction above becomes a re-validation
                // candidate.
                let range = self.exec_tasks.revalidation_range(txn_idx + 1);
                self.validate_tasks.push_pending_set(&range);
                self.validate_tasks.clear_in_progress(txn_idx);

                if self.exec_tasks.check_pending(txn_idx) {
                    // Already queued to re-execute; the next completion
                    // schedules the validation again.
                } else if self.exec_tasks.block_count(txn_idx) == -1 {
                    self.exec_tasks.push_pending(txn_idx);
                    self.exec_tasks.clear_complete(txn_idx);
                    self.txn_incarnations[txn_idx as usize] += 1;
                }
            }
        }
    }

    fn dispatch_pending(&mut self) {
        // One task close to the validated frontier goes to the
        // non-speculative queue, whose workers are reserved for attempts
        // that are unlikely to abort.
        let max_validated = self.validate_tasks.max_all_complete();
        let min_pending = self.exec_tasks.min_pending();
        if min_pending != -1 && min_pending <= max_validated + DISPATCH_LOOKAHEAD {
            let txn_idx = self.exec_tasks.take_next_pending();
            if txn_idx != -1 {
                self.dispatch_job(txn_idx, false);
            }
        }

        // Everything else still pending runs speculatively.
        while self.exec_tasks.min_pending() != -1 {
            let txn_idx = self.exec_tasks.take_next_pending();
            if txn_idx != -1 {
                self.dispatch_job(txn_idx, true);
            }
        }
    }
}
