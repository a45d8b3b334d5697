// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

pub type TxnIndex = i32;
pub type Incarnation = i32;

/// Sentinel transaction index carried by reads that found no writer and fell
/// through to the pre-block storage state.
pub const STORAGE_TXN_IDX: TxnIndex = -1;

/// A single execution attempt: the transaction's position in the block and
/// the (per-index monotone) incarnation number of the attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    pub txn_index: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_index: TxnIndex, incarnation: Incarnation) -> Self {
        Self {
            txn_index,
            incarnation,
        }
    }

    /// The version recorded for reads served by pre-block storage.
    pub fn storage() -> Self {
        Self {
            txn_index: STORAGE_TXN_IDX,
            incarnation: -1,
        }
    }

    pub fn is_storage(&self) -> bool {
        self.txn_index == STORAGE_TXN_IDX
    }
}

/// Where a recorded read was served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadKind {
    /// Served by a prior transaction's write in the multi-version map.
    Map,
    /// No writer below the reader; served by pre-block storage.
    Storage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDescriptor<K> {
    pub path: K,
    pub kind: ReadKind,
    pub version: Version,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteDescriptor<K, V> {
    pub path: K,
    pub version: Version,
    pub value: V,
}

/// Outcome of reading a path on behalf of a transaction: the entry with the
/// largest index strictly below the reader, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MVReadResult<V> {
    /// No entry below the reader; the caller observes storage.
    None,
    /// The closest write below the reader.
    Done { version: Version, value: Arc<V> },
    /// The closest entry below the reader is an estimate left behind by an
    /// aborted incarnation; the reader must abort with this dependency.
    Dependency(TxnIndex),
}

impl<V> MVReadResult<V> {
    pub fn is_dependency(&self) -> bool {
        matches!(self, MVReadResult::Dependency(_))
    }
}
