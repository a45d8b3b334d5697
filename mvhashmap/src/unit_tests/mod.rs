// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::types::{Incarnation, MVReadResult, TxnIndex, Version, WriteDescriptor};
use std::sync::Arc;
use test_case::test_case;

mod proptest_types;

// Generate a value deterministically based on txn_idx and incarnation.
fn value_for(txn_idx: TxnIndex, incarnation: Incarnation) -> u64 {
    (txn_idx * 5 + incarnation) as u64
}

fn done_for(txn_idx: TxnIndex, incarnation: Incarnation) -> MVReadResult<u64> {
    MVReadResult::Done {
        version: Version::new(txn_idx, incarnation),
        value: Arc::new(value_for(txn_idx, incarnation)),
    }
}

#[test]
fn create_write_read_placeholder_struct() {
    let ap1 = b"/foo/b".to_vec();
    let ap2 = b"/foo/c".to_vec();
    let ap3 = b"/foo/d".to_vec();

    let mvtbl: MVHashMap<Vec<u8>, u64> = MVHashMap::new();

    // Reads that should go to storage return None.
    assert_eq!(MVReadResult::None, mvtbl.read(&ap1, 5));

    // Write by txn 10.
    mvtbl.write(ap1.clone(), Version::new(10, 1), value_for(10, 1));

    // Reads below the write still go to storage.
    assert_eq!(MVReadResult::None, mvtbl.read(&ap1, 9));
    // Reads return entries from smaller txns, not txn 10 itself.
    assert_eq!(MVReadResult::None, mvtbl.read(&ap1, 10));

    // Reads for a higher txn return the entry written by txn 10.
    assert_eq!(done_for(10, 1), mvtbl.read(&ap1, 15));

    // More writes.
    mvtbl.write(ap1.clone(), Version::new(12, 0), value_for(12, 0));
    mvtbl.write(ap1.clone(), Version::new(8, 3), value_for(8, 3));

    // Verify predecessor lookups.
    assert_eq!(done_for(12, 0), mvtbl.read(&ap1, 15));
    assert_eq!(done_for(10, 1), mvtbl.read(&ap1, 11));
    assert_eq!(done_for(8, 3), mvtbl.read(&ap1, 10));

    // Mark the entry written by 10 as an estimate.
    mvtbl.mark_estimate(&ap1, 10);

    // Reads for txns 11 and 12 must observe a dependency on txn 10.
    assert_eq!(MVReadResult::Dependency(10), mvtbl.read(&ap1, 11));
    assert_eq!(MVReadResult::Dependency(10), mvtbl.read(&ap1, 12));

    // Delete the entry written by 10, write to a different ap.
    mvtbl.remove(&ap1, 10);
    mvtbl.write(ap2.clone(), Version::new(10, 2), value_for(10, 2));

    // Read by txn 11 no longer observes the entry from txn 10.
    assert_eq!(done_for(8, 3), mvtbl.read(&ap1, 11));

    // Reads, writes for ap2 and ap3.
    mvtbl.write(ap2.clone(), Version::new(5, 0), value_for(5, 0));
    mvtbl.write(ap3.clone(), Version::new(20, 4), value_for(20, 4));
    assert_eq!(done_for(5, 0), mvtbl.read(&ap2, 10));
    assert_eq!(done_for(20, 4), mvtbl.read(&ap3, 21));

    // Clear ap1 and ap3.
    mvtbl.remove(&ap1, 12);
    mvtbl.remove(&ap1, 8);
    mvtbl.remove(&ap3, 20);

    // Reads from ap1 and ap3 go to storage.
    assert_eq!(MVReadResult::None, mvtbl.read(&ap1, 30));
    assert_eq!(MVReadResult::None, mvtbl.read(&ap3, 30));

    // Read entry by txn 10 at ap2.
    assert_eq!(done_for(10, 2), mvtbl.read(&ap2, 15));

    assert_eq!(3, mvtbl.num_keys());
}

#[test_case(0, MVReadResult::None; "read below every entry")]
#[test_case(1, MVReadResult::None; "read at the lowest entry")]
#[test_case(2, done_for(1, 0); "read right above the lowest entry")]
#[test_case(4, done_for(3, 1); "read between entries")]
#[test_case(7, done_for(3, 1); "read at an entry")]
#[test_case(8, done_for(7, 2); "read right above the highest entry")]
#[test_case(30, done_for(7, 2); "read far above the highest entry")]
fn predecessor_lookup(txn_idx: TxnIndex, expected: MVReadResult<u64>) {
    let ap = b"/foo/b".to_vec();
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();

    map.write(ap.clone(), Version::new(1, 0), value_for(1, 0));
    map.write(ap.clone(), Version::new(3, 1), value_for(3, 1));
    map.write(ap.clone(), Version::new(7, 2), value_for(7, 2));

    assert_eq!(expected, map.read(&ap, txn_idx));
}

#[test]
fn estimate_preserves_value_and_incarnation() {
    let ap = b"/foo/b".to_vec();
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();

    map.write(ap.clone(), Version::new(3, 2), value_for(3, 2));
    map.mark_estimate(&ap, 3);
    assert!(map.read(&ap, 5).is_dependency());

    // The re-execution overwrites the estimate and clears the flag.
    map.write(ap.clone(), Version::new(3, 3), value_for(3, 3));
    assert_eq!(done_for(3, 3), map.read(&ap, 5));
}

#[test]
fn flush_write_set_applies_all_writes() {
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();
    let version = Version::new(4, 0);

    let writes = vec![
        WriteDescriptor {
            path: b"/foo/a".to_vec(),
            version,
            value: 11,
        },
        WriteDescriptor {
            path: b"/foo/b".to_vec(),
            version,
            value: 12,
        },
    ];
    map.flush_write_set(&writes);

    for w in &writes {
        match map.read(&w.path, 5) {
            MVReadResult::Done { version, value } => {
                assert_eq!(Version::new(4, 0), version);
                assert_eq!(w.value, *value);
            },
            other => panic!("Flushed write must be visible, got {:?}", other),
        }
    }
}

#[test]
#[should_panic(expected = "Path must exist")]
fn mark_estimate_without_path() {
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();
    map.mark_estimate(&b"/foo/b".to_vec(), 1);
}

#[test]
#[should_panic(expected = "Entry by the txn must exist to mark estimate")]
fn mark_estimate_without_entry() {
    let ap = b"/foo/b".to_vec();
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();
    map.write(ap.clone(), Version::new(3, 0), value_for(3, 0));
    map.mark_estimate(&ap, 5);
}

#[test]
#[should_panic(expected = "non-increasing incarnation")]
fn write_must_raise_incarnation() {
    let ap = b"/foo/b".to_vec();
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();
    map.write(ap.clone(), Version::new(3, 1), value_for(3, 1));
    map.write(ap, Version::new(3, 1), value_for(3, 1));
}

#[test]
fn remove_missing_entry_is_noop() {
    let ap = b"/foo/b".to_vec();
    let map: MVHashMap<Vec<u8>, u64> = MVHashMap::new();

    // Neither the missing path nor the missing entry panics.
    map.remove(&ap, 3);
    map.write(ap.clone(), Version::new(3, 0), value_for(3, 0));
    map.remove(&ap, 7);
    assert_eq!(done_for(3, 0), map.read(&ap, 5));
}
