#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod bucket;
pub mod hash;
#[cfg(test)]
mod test;
mod util;

use atomic::Ordering;
use core::fmt::Debug;

use crate::bucket::BucketArray;
pub use crate::hash::HashFn;

/// Bytes per key.
pub const KEY_SIZE: usize = 64;
/// Bytes per value.
pub const VALUE_SIZE: usize = 128;
/// Neighborhood width: every entry lives within this many cells of its home.
pub const HOP_RANGE: usize = 32;
/// The displacement search may roam up to `HOP_RANGE * MAX_RELOCATION_FACTOR`
/// cells past an entry's home before an insert gives up.
pub const MAX_RELOCATION_FACTOR: usize = 5;

const PROBE_RANGE: usize = HOP_RANGE * MAX_RELOCATION_FACTOR;

// The hop bitmap occupies the lower half of the 64-bit meta word.
const _: () = assert!(HOP_RANGE <= 32);

pub type Key = [u8; KEY_SIZE];
pub type Value = [u8; VALUE_SIZE];

/// Outcome of [`Map::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Insert {
    /// The key was new and has been placed.
    Inserted,
    /// The key already existed; its value was overwritten in place.
    Updated,
    /// No empty cell exists within the relocation bound of the key's home.
    /// The raw load factor may still be below 100%.
    Full,
}

/// Construction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Capacity was zero, not a power of two, or smaller than [`HOP_RANGE`].
    InvalidCapacity,
    /// The backing allocation failed.
    OutOfMemory,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidCapacity => {
                write!(f, "capacity must be a power of two and at least {HOP_RANGE}")
            }
            Self::OutOfMemory => write!(f, "table allocation failed"),
        }
    }
}

/// One round of the hop-shuffle.
enum Shuffle {
    /// An entry was pulled forward; the freed cell is at this index.
    Moved(usize),
    /// Another thread interfered; re-probe for an empty cell.
    Contended,
    /// No entry in the window can be moved; the insert fails.
    Exhausted,
}

/// A lock-less concurrent hopscotch hash table with a fixed capacity,
/// mapping 64-byte keys to 128-byte values.
///
/// All operations take the hash function by value; the table neither owns
/// nor caches it. Lookups are wait-free up to the probe bound; insert and
/// remove are lock-free except for bounded CAS retries.
pub struct Map {
    cells: BucketArray,
}

impl Map {
    /// Creates an empty table with room for `capacity` cells.
    ///
    /// # Errors
    /// [`Error::InvalidCapacity`] unless `capacity` is a power of two no
    /// smaller than [`HOP_RANGE`]; [`Error::OutOfMemory`] if the allocator
    /// refuses the backing array.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        if capacity < HOP_RANGE {
            return Err(Error::InvalidCapacity);
        }
        Ok(Self { cells: BucketArray::new(capacity)? })
    }

    /// Insert or overwrite. See [`Insert`] for the three outcomes.
    ///
    /// Overwriting is best-effort: concurrent readers of the same key may
    /// observe a mix of old and new value bytes. Callers that need atomic
    /// replacement should remove and re-insert.
    pub fn insert(&self, hash_fn: HashFn, key: &Key, value: &Value) -> Insert {
        let hash = key_hash(hash_fn, key);
        let home = self.home_of(hash);

        // A prior copy may sit anywhere in the probe window, including the
        // displacement tail, so the duplicate scan covers all of it.
        if let Some(index) = self.find(hash, home, key) {
            let bucket = self.cells.get(index);
            unsafe { bucket.write_value(value) };
            bucket.publish();
            return Insert::Updated;
        }

        // Fast path: claim an empty cell inside the home neighborhood. The
        // claim makes the hash visible before the key bytes exist; readers
        // that hash-match fail the key compare and keep scanning until the
        // publish below.
        for i in 0..HOP_RANGE {
            let bucket = self.cells.get(home + i);
            let meta = bucket.meta(Ordering::Relaxed);
            if !meta.is_occupied() && bucket.try_claim(meta, hash) {
                unsafe {
                    bucket.write_key(key);
                    bucket.write_value(value);
                }
                bucket.publish();
                self.cells.get(home).set_hop_bit(i);
                self.cells.incr_len();
                return Insert::Inserted;
            }
        }

        self.insert_displaced(hash, home, key, value)
    }

    /// Copy of the value stored for `key`, if present.
    #[must_use]
    pub fn get(&self, hash_fn: HashFn, key: &Key) -> Option<Value> {
        let hash = key_hash(hash_fn, key);
        let index = self.find(hash, self.home_of(hash), key)?;
        Some(unsafe { self.cells.get(index).read_value() })
    }

    /// Whether `key` is present. As expensive as [`Map::get`] minus the copy.
    #[must_use]
    pub fn contains_key(&self, hash_fn: HashFn, key: &Key) -> bool {
        let hash = key_hash(hash_fn, key);
        self.find(hash, self.home_of(hash), key).is_some()
    }

    /// Remove `key`'s entry. Returns whether an entry was removed.
    pub fn remove(&self, hash_fn: HashFn, key: &Key) -> bool {
        let hash = key_hash(hash_fn, key);
        let home = self.home_of(hash);
        loop {
            let Some(index) = self.find(hash, home, key) else {
                return false;
            };
            // Retire the hop bit first so the displacement search stops
            // offering this entry, then empty the cell itself. Entries
            // parked past the neighborhood have no bit to clear.
            let dist = self.distance(home, index);
            if dist < HOP_RANGE {
                self.cells.get(home).clear_hop_bit(dist);
            }
            let bucket = self.cells.get(index);
            if bucket.try_release(hash) {
                unsafe { bucket.zero_payload() };
                self.cells.decr_len();
                return true;
            }
            // The cell changed occupants between the scan and the release:
            // either a concurrent remove won (the rescan reports missing) or
            // a displacement moved the entry (the rescan finds its new cell).
        }
    }

    /// Number of occupied cells. Relaxed; exact only in quiescence.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cells.capacity()
    }

    /// Reset the table to empty. Exclusive access makes this safe without
    /// any per-cell synchronization.
    pub fn clear(&mut self) {
        self.cells.zero();
    }

    /// Scan the probe window for a published entry with this hash and key.
    fn find(&self, hash: u32, home: usize, key: &Key) -> Option<usize> {
        for i in 0..self.probe_len() {
            let index = (home + i) & self.cells.mask();
            let bucket = self.cells.get(index);
            if bucket.meta(Ordering::Acquire).hash == hash && unsafe { bucket.key_eq(key) } {
                return Some(index);
            }
        }
        None
    }

    /// Slow path: find an empty cell anywhere in the probe window and
    /// hop-shuffle it back into the home neighborhood.
    #[cold]
    fn insert_displaced(&self, hash: u32, home: usize, key: &Key, value: &Value) -> Insert {
        'probe: loop {
            let Some(mut free) = self.probe_for_empty(home) else {
                return Insert::Full;
            };
            // Pull the empty cell into the neighborhood while entries are
            // movable.
            while self.distance(home, free) >= HOP_RANGE {
                match self.shuffle_back(free) {
                    Shuffle::Moved(slot) => free = slot,
                    Shuffle::Contended => continue 'probe,
                    // Nothing in the window can move (a single-home
                    // pile-up): park the entry past its neighborhood, where
                    // only the linear scan finds it. It carries no hop bit
                    // and is never offered as a displacement donor.
                    Shuffle::Exhausted => break,
                }
            }
            let bucket = self.cells.get(free);
            let meta = bucket.meta(Ordering::Relaxed);
            if meta.is_occupied() || !bucket.try_claim(meta, hash) {
                // A racing insert took the cell we freed.
                continue 'probe;
            }
            unsafe {
                bucket.write_key(key);
                bucket.write_value(value);
            }
            bucket.publish();
            let dist = self.distance(home, free);
            if dist < HOP_RANGE {
                self.cells.get(home).set_hop_bit(dist);
            }
            self.cells.incr_len();
            return Insert::Inserted;
        }
    }

    /// First unoccupied cell in the probe window, if any.
    fn probe_for_empty(&self, home: usize) -> Option<usize> {
        for i in 0..self.probe_len() {
            let index = (home + i) & self.cells.mask();
            if !self.cells.get(index).meta(Ordering::Relaxed).is_occupied() {
                return Some(index);
            }
        }
        None
    }

    /// Move one entry from the window before `free` into `free`, so the
    /// empty cell migrates towards the crowded home.
    fn shuffle_back(&self, free: usize) -> Shuffle {
        // Farthest candidate home first: it frees the most distance per move.
        for back in (1..HOP_RANGE).rev() {
            let cand = free.wrapping_sub(back) & self.cells.mask();
            let cand_bucket = self.cells.get(cand);
            let mut tried: u32 = 0;
            loop {
                let hop = cand_bucket.meta(Ordering::Acquire).hop;
                // Bits below `back` name entries living between `cand` and
                // `free`; anything higher would move an entry forward.
                let eligible = hop & ((1 << back) - 1) & !tried;
                if eligible == 0 {
                    break;
                }
                let j = eligible.trailing_zeros() as usize;
                tried |= 1 << j;
                let donor = (cand + j) & self.cells.mask();
                let donor_bucket = self.cells.get(donor);
                let donor_hash = donor_bucket.meta(Ordering::Acquire).hash;
                if donor_hash == 0 {
                    // Hop bit ran ahead of a publication or behind a
                    // removal; try the next donor.
                    continue;
                }
                let free_bucket = self.cells.get(free);
                let free_meta = free_bucket.meta(Ordering::Relaxed);
                if free_meta.is_occupied() || !free_bucket.try_claim(free_meta, donor_hash) {
                    return Shuffle::Contended;
                }
                unsafe { free_bucket.copy_payload_from(donor_bucket) };
                if donor_bucket.meta(Ordering::Acquire).hash != donor_hash {
                    // The donor changed occupants mid-copy; the bytes in
                    // `free` are not trustworthy.
                    self.rollback(free, donor_hash);
                    return Shuffle::Contended;
                }
                free_bucket.publish();
                if !cand_bucket.retarget_hop_bit(j, back) {
                    // The donor was removed after we copied it; un-publish
                    // the copy so the key does not resurrect.
                    self.rollback(free, donor_hash);
                    return Shuffle::Contended;
                }
                // The entry is visible at `free`; retire the donor cell.
                // Readers may briefly see it at both indices.
                if donor_bucket.try_release(donor_hash) {
                    unsafe { donor_bucket.zero_payload() };
                }
                return Shuffle::Moved(donor);
            }
        }
        Shuffle::Exhausted
    }

    /// Back out a half-finished displacement copy at `index`.
    fn rollback(&self, index: usize, hash: u32) {
        let bucket = self.cells.get(index);
        if bucket.try_release(hash) {
            unsafe { bucket.zero_payload() };
        }
    }

    fn home_of(&self, hash: u32) -> usize {
        hash as usize & self.cells.mask()
    }

    /// Forward distance from `home` to `index`, modulo capacity.
    fn distance(&self, home: usize, index: usize) -> usize {
        index.wrapping_sub(home) & self.cells.mask()
    }

    /// The scan window, clamped so minimum-size tables are walked once.
    fn probe_len(&self) -> usize {
        PROBE_RANGE.min(self.cells.capacity())
    }
}

impl Debug for Map {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Map")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Zero is the empty-cell sentinel, so a raw hash of zero is remapped here
/// rather than outlawed for callers.
fn key_hash(hash_fn: HashFn, key: &Key) -> u32 {
    match hash_fn(key) {
        0 => 1,
        hash => hash,
    }
}
