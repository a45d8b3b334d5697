// SPDX-License-Identifier: Apache-2.0

use blockstm_mvhashmap::{
    types::{Incarnation, ReadDescriptor, TxnIndex, WriteDescriptor},
    MVHashMap,
};
use std::{fmt::Debug, hash::Hash};

/// The execution result of a single incarnation.
#[derive(Debug)]
pub enum ExecutionStatus<O, E> {
    /// The incarnation ran to completion.
    Success(O),
    /// The incarnation read another transaction's estimate and must be
    /// retried. Carries the blocking transaction's index when known.
    SpeculativeAbort(Option<TxnIndex>),
    /// The transaction hit a non-recoverable error; the whole batch halts
    /// and the error is propagated back to the caller.
    Abort(E),
}

/// Read and write sets captured by one incarnation. `writes` is the subset
/// checked during validation; `all_writes` is everything applied to the
/// multi-version map and always contains `writes`.
#[derive(Debug)]
pub struct TaskOutput<K, V> {
    pub reads: Vec<ReadDescriptor<K>>,
    pub writes: Vec<WriteDescriptor<K, V>>,
    pub all_writes: Vec<WriteDescriptor<K, V>>,
}

/// A transaction executable by the parallel scheduler, provided by the
/// embedder. Implementations run their logic against the multi-version map,
/// buffering writes into the returned output. Reads must not block: a read
/// that hits an estimate surfaces as `SpeculativeAbort` with the writer's
/// index as the dependency.
pub trait ExecTask: Sync {
    /// Type of the access paths the transaction reads and writes.
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    /// Type of the written values. Opaque to the engine.
    type Value: Clone + Debug + Send + Sync;

    /// Identity used to serialise transactions of the same sender in block
    /// order.
    type Sender: Eq + Hash;

    /// Type of non-recoverable errors, surfaced to the caller.
    type Error: Debug + Send;

    /// Execute the transaction logic for the given incarnation.
    fn execute(
        &self,
        mvh: &MVHashMap<Self::Key, Self::Value>,
        incarnation: Incarnation,
    ) -> ExecutionStatus<TaskOutput<Self::Key, Self::Value>, Self::Error>;

    fn sender(&self) -> Self::Sender;
}
