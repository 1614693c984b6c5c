use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use core::cell::UnsafeCell;
use core::sync::atomic::AtomicUsize;

use crate::{util, Error, Key, Value, HOP_RANGE};

/// The per-cell metadata word: the occupant's hash and the hop bitmap of the
/// neighborhood that starts at this cell, packed into one 8-byte atomic.
///
/// `hash == 0` means the cell is unoccupied. `hop` bit `i` means the cell at
/// `self + i (mod capacity)` holds an entry whose home is `self`; the bitmap
/// belongs to the *index*, not to the occupant, so it survives the occupant
/// being moved or removed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C, align(8))]
pub(crate) struct Meta {
    pub hash: u32,
    pub hop: u32,
}

// Two u32 fields, no padding.
unsafe impl NoUninit for Meta {}

impl Meta {
    pub fn is_occupied(self) -> bool {
        self.hash != 0
    }

    pub fn with_hash(self, hash: u32) -> Self {
        Self { hash, ..self }
    }

    pub fn with_hop_set(self, i: usize) -> Self {
        Self { hop: self.hop | (1 << i), ..self }
    }

    pub fn with_hop_cleared(self, i: usize) -> Self {
        Self { hop: self.hop & !(1 << i), ..self }
    }

    pub fn hop_bit(self, i: usize) -> bool {
        self.hop & (1 << i) != 0
    }
}

/// One storage cell. The meta word is the sole synchronization variable; the
/// key and value bytes are plain memory whose visibility piggy-backs on
/// release/acquire traffic on `meta`.
#[repr(align(64))]
pub(crate) struct Bucket {
    meta: Atomic<Meta>,
    key: UnsafeCell<Key>,
    value: UnsafeCell<Value>,
}

impl Bucket {
    pub fn meta(&self, order: Ordering) -> Meta {
        self.meta.load(order)
    }

    /// Try to take ownership of this cell for an entry with `hash`. The CAS
    /// only flips the hash half of the word; the cell's resident hop bitmap
    /// is carried over untouched, since it describes a different neighborhood
    /// than the one the new occupant belongs to.
    pub fn try_claim(&self, current: Meta, hash: u32) -> bool {
        debug_assert!(!current.is_occupied());
        self.meta
            .compare_exchange(current, current.with_hash(hash), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Re-store the current meta word with release ordering, making every
    /// preceding payload write visible to readers that acquire-load it.
    /// An identity compare-exchange rather than a blind store: another
    /// inserter may be ORing hop bits into this word concurrently.
    pub fn publish(&self) {
        let _ = self.meta.fetch_update(Ordering::Release, Ordering::Relaxed, Some);
    }

    pub fn set_hop_bit(&self, i: usize) {
        debug_assert!(i < HOP_RANGE);
        let _ = self
            .meta
            .fetch_update(Ordering::Release, Ordering::Relaxed, |meta| Some(meta.with_hop_set(i)));
    }

    /// Idempotent: clearing a bit that is not set is a no-op.
    pub fn clear_hop_bit(&self, i: usize) {
        debug_assert!(i < HOP_RANGE);
        let _ = self.meta.fetch_update(Ordering::Release, Ordering::Relaxed, |meta| {
            Some(meta.with_hop_cleared(i))
        });
    }

    /// Move this cell's hop bit `from` to `to` in one CAS, on behalf of a
    /// displaced entry. Fails if bit `from` vanished in the meantime (the
    /// donor was removed from under us).
    pub fn retarget_hop_bit(&self, from: usize, to: usize) -> bool {
        debug_assert!(from < HOP_RANGE && to < HOP_RANGE);
        self.meta
            .fetch_update(Ordering::Release, Ordering::Acquire, |meta| {
                meta.hop_bit(from).then(|| meta.with_hop_cleared(from).with_hop_set(to))
            })
            .is_ok()
    }

    /// Clear the hash half if it still equals `hash`, keeping the resident
    /// hop bitmap. Returns false if the occupant changed in the meantime.
    pub fn try_release(&self, hash: u32) -> bool {
        self.meta
            .fetch_update(Ordering::Release, Ordering::Acquire, |meta| {
                (meta.hash == hash).then(|| meta.with_hash(0))
            })
            .is_ok()
    }

    /// Write the key bytes.
    ///
    /// # Safety
    /// The caller must have claimed this cell and not yet published it, so no
    /// other thread writes the payload concurrently.
    pub unsafe fn write_key(&self, key: &Key) {
        self.key.get().write(*key);
    }

    /// Write the value bytes.
    ///
    /// # Safety
    /// Either the cell is claimed and unpublished (initial insert), or this
    /// is the documented best-effort in-place update, where concurrent
    /// readers may observe a mix of old and new bytes.
    pub unsafe fn write_value(&self, value: &Value) {
        self.value.get().write(*value);
    }

    /// Compare the stored key bytes against `key`.
    ///
    /// # Safety
    /// Racy by contract: a concurrent writer may be filling this cell, in
    /// which case the comparison may fail spuriously and the caller keeps
    /// scanning. The bytes are always initialized (cells start zeroed).
    pub unsafe fn key_eq(&self, key: &Key) -> bool {
        *self.key.get() == *key
    }

    /// Copy the value bytes out.
    ///
    /// # Safety
    /// Same contract as [`Bucket::key_eq`]; torn reads against an in-place
    /// update are allowed by the lookup contract.
    pub unsafe fn read_value(&self) -> Value {
        self.value.get().read()
    }

    /// Copy another cell's payload into this one, as part of a displacement.
    ///
    /// # Safety
    /// `self` must be claimed and unpublished. `donor` must be published;
    /// its bytes may only be zeroed after `self` is published, which the
    /// displacement protocol guarantees.
    pub unsafe fn copy_payload_from(&self, donor: &Bucket) {
        self.key.get().write(donor.key.get().read());
        self.value.get().write(donor.value.get().read());
    }

    /// Zero the payload of a cell that was just released.
    ///
    /// # Safety
    /// The cell's hash must already be cleared, so matches can no longer
    /// land here; late readers comparing against the zeroed bytes simply
    /// fail the key test.
    pub unsafe fn zero_payload(&self) {
        self.key.get().write([0; crate::KEY_SIZE]);
        self.value.get().write([0; crate::VALUE_SIZE]);
    }
}

/// The contiguous, power-of-two-sized backing array of cells, plus the
/// cached index mask and the (relaxed, informational) occupancy counter.
pub(crate) struct BucketArray {
    buckets: *mut Bucket,
    capacity: usize,
    mask: usize,
    len: AtomicUsize,
}

impl BucketArray {
    /// Allocate `capacity` zeroed cells. Zeroed memory is a valid empty
    /// table: `Meta::EMPTY` and all-zero payloads.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity);
        }
        let buckets = util::allocate_zeroed::<Bucket>(capacity).ok_or(Error::OutOfMemory)?;
        Ok(Self { buckets, capacity, mask: capacity - 1, len: AtomicUsize::new(0) })
    }

    /// The cell at `index`, wrapped to the table.
    pub fn get(&self, index: usize) -> &Bucket {
        &self.as_slice()[index & self.mask]
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mask(&self) -> usize {
        self.mask
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn incr_len(&self) {
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_len(&self) {
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reset every cell and the counter. `&mut self` guarantees quiescence.
    pub fn zero(&mut self) {
        unsafe { core::ptr::write_bytes(self.buckets, 0, self.capacity) };
        *self.len.get_mut() = 0;
    }

    fn as_slice(&self) -> &[Bucket] {
        unsafe { core::slice::from_raw_parts(self.buckets, self.capacity) }
    }
}

impl Drop for BucketArray {
    fn drop(&mut self) {
        util::deallocate(self.buckets, self.capacity);
    }
}

// All mutation of shared cells goes through the atomic meta word; payload
// writes are confined to the thread that claimed the cell.
unsafe impl Send for BucketArray {}
unsafe impl Sync for BucketArray {}

#[test]
fn claim_sets_hash_and_keeps_hop() {
    let array = BucketArray::new(64).unwrap();
    let bucket = array.get(3);
    bucket.set_hop_bit(5);
    let meta = bucket.meta(Ordering::Acquire);
    assert!(bucket.try_claim(meta, 0xDEAD_BEEF));
    let meta = bucket.meta(Ordering::Acquire);
    assert_eq!(meta.hash, 0xDEAD_BEEF);
    assert_eq!(meta.hop, 1 << 5);
}

#[test]
fn claim_fails_on_stale_meta() {
    let array = BucketArray::new(64).unwrap();
    let bucket = array.get(0);
    let stale = bucket.meta(Ordering::Acquire);
    bucket.set_hop_bit(1);
    assert!(!bucket.try_claim(stale, 7));
}

#[test]
fn retarget_moves_one_bit() {
    let array = BucketArray::new(64).unwrap();
    let bucket = array.get(9);
    bucket.set_hop_bit(0);
    bucket.set_hop_bit(7);
    assert!(bucket.retarget_hop_bit(0, 12));
    assert_eq!(bucket.meta(Ordering::Acquire).hop, (1 << 7) | (1 << 12));
    // bit 0 is gone now, a second retarget must refuse
    assert!(!bucket.retarget_hop_bit(0, 3));
}

#[test]
fn release_only_matching_hash() {
    let array = BucketArray::new(64).unwrap();
    let bucket = array.get(31);
    let meta = bucket.meta(Ordering::Acquire);
    assert!(bucket.try_claim(meta, 42));
    bucket.set_hop_bit(2);
    assert!(!bucket.try_release(41));
    assert!(bucket.try_release(42));
    let meta = bucket.meta(Ordering::Acquire);
    assert_eq!(meta.hash, 0);
    assert_eq!(meta.hop, 1 << 2);
}
