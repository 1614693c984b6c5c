//! Pluggable key hashing.
//!
//! The table does not own a hasher; every operation takes a plain function
//! value mapping a key to a 32-bit hash. A returned hash of `0` is legal and
//! is remapped to `1` by the engine, since `0` doubles as the empty-cell
//! sentinel in the meta word.

use core::hash::Hasher as _;
use hash32::{FnvHasher, Hasher as _, Murmur3Hasher};

use crate::Key;

/// A pure key → 32-bit hash function, supplied per call.
pub type HashFn = fn(&Key) -> u32;

/// 32-bit Murmur3 over the full key.
#[must_use]
pub fn murmur3(key: &Key) -> u32 {
    let mut hasher = Murmur3Hasher::default();
    hasher.write(key);
    hasher.finish32()
}

/// 32-bit FNV-1a over the full key. Cheaper mixing than [`murmur3`], decent
/// distribution for short fixed-width keys.
#[must_use]
pub fn fnv(key: &Key) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish32()
}
