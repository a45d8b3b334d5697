// SPDX-License-Identifier: Apache-2.0

//! Concrete access-path keys for embedders executing account-model
//! transactions. The engine itself is generic over the key type; these
//! helpers exist so consumers can build per-account storage-slot paths and
//! the small fixed "subpath" paths (nonce, balance, ...) that higher-level
//! validation predicates inspect.

use std::fmt;

pub const ADDRESS_LEN: usize = 20;
pub const HASH_LEN: usize = 32;

pub type Address = [u8; ADDRESS_LEN];
pub type Hash = [u8; HASH_LEN];

/// Subpath tag for an account's nonce.
pub const NONCE_SUBPATH: u8 = 2;

const KEY_LEN: usize = ADDRESS_LEN + HASH_LEN + 1;
const SUBPATH_FLAG: usize = KEY_LEN - 1;

/// A fixed-width access path: an address followed by either a 32-byte slot
/// hash (state key) or a one-byte subpath tag, with a trailing flavour
/// marker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Path of a storage slot under `address`.
    pub fn for_storage_slot(address: &Address, slot_hash: &Hash) -> Key {
        let mut bytes = [0u8; KEY_LEN];
        bytes[..ADDRESS_LEN].copy_from_slice(address);
        bytes[ADDRESS_LEN..ADDRESS_LEN + HASH_LEN].copy_from_slice(slot_hash);
        Key(bytes)
    }

    /// Path of a small fixed account field, identified by a subpath tag.
    pub fn for_subpath(address: &Address, subpath: u8) -> Key {
        let mut bytes = [0u8; KEY_LEN];
        bytes[..ADDRESS_LEN].copy_from_slice(address);
        bytes[ADDRESS_LEN] = subpath;
        bytes[SUBPATH_FLAG] = 1;
        Key(bytes)
    }

    pub fn is_subpath(&self) -> bool {
        self.0[SUBPATH_FLAG] == 1
    }

    /// The subpath tag. Only meaningful when `is_subpath()` holds.
    pub fn subpath(&self) -> u8 {
        self.0[ADDRESS_LEN]
    }

    pub fn address(&self) -> Address {
        let mut address = [0u8; ADDRESS_LEN];
        address.copy_from_slice(&self.0[..ADDRESS_LEN]);
        address
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_subpath() {
            write!(f, "Key(addr={:02x?}, subpath={})", self.address(), self.subpath())
        } else {
            write!(
                f,
                "Key(addr={:02x?}, slot={:02x?})",
                self.address(),
                &self.0[ADDRESS_LEN..ADDRESS_LEN + HASH_LEN]
            )
        }
    }
}

/// An address from a small integer, for tests and examples.
pub fn address_from_u64(seed: u64) -> Address {
    let mut address = [0u8; ADDRESS_LEN];
    address[ADDRESS_LEN - 8..].copy_from_slice(&seed.to_be_bytes());
    address
}

/// A slot hash from a small integer, for tests and examples.
pub fn hash_from_u64(seed: u64) -> Hash {
    let mut hash = [0u8; HASH_LEN];
    hash[HASH_LEN - 8..].copy_from_slice(&seed.to_be_bytes());
    hash
}
