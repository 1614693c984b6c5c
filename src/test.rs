use alloc::vec::Vec;
use atomic::Ordering;

use crate::{hash, Error, Insert, Key, Map, Value, HOP_RANGE, KEY_SIZE, VALUE_SIZE};

fn key(seed: u32) -> Key {
    let mut key = [0; KEY_SIZE];
    key[..4].copy_from_slice(&seed.to_le_bytes());
    key[KEY_SIZE - 1] = !seed.to_le_bytes()[0];
    key
}

fn value(seed: u32) -> Value {
    let mut value = [seed as u8; VALUE_SIZE];
    value[..4].copy_from_slice(&seed.to_le_bytes());
    value
}

/// The first four key bytes, little-endian.
fn first_word(key: &Key) -> u32 {
    u32::from_le_bytes(key[..4].try_into().unwrap())
}

/// Sends every key to home 1.
fn clustered(_: &Key) -> u32 {
    1
}

fn zeroed(_: &Key) -> u32 {
    0
}

impl Map {
    /// Whole-table consistency sweep; only meaningful in quiescence.
    fn check_consistency(&self) {
        let mut occupied = 0;
        for index in 0..self.capacity() {
            let meta = self.cells.get(index).meta(Ordering::Acquire);
            if meta.is_occupied() {
                occupied += 1;
                let home = self.home_of(meta.hash);
                let dist = self.distance(home, index);
                assert!(dist < self.probe_len(), "cell {index} strayed past the probe window");
                if dist < HOP_RANGE {
                    assert!(
                        self.cells.get(home).meta(Ordering::Acquire).hop_bit(dist),
                        "cell {index} has no hop bit in its home {home}"
                    );
                }
            }
            for i in 0..HOP_RANGE {
                if meta.hop_bit(i) {
                    let neighbor = self.cells.get(index + i).meta(Ordering::Acquire);
                    assert!(neighbor.is_occupied(), "hop bit {i} of cell {index} points nowhere");
                    assert_eq!(
                        self.home_of(neighbor.hash),
                        index,
                        "hop bit {i} of cell {index} points at a foreign entry"
                    );
                }
            }
        }
        assert_eq!(self.len(), occupied);
    }

    fn hop_bits(&self, index: usize) -> u32 {
        self.cells.get(index).meta(Ordering::Acquire).hop
    }
}

#[test]
fn capacity_must_be_power_of_two() {
    assert_eq!(Map::with_capacity(0).unwrap_err(), Error::InvalidCapacity);
    assert_eq!(Map::with_capacity(48).unwrap_err(), Error::InvalidCapacity);
    assert_eq!(Map::with_capacity(HOP_RANGE / 2).unwrap_err(), Error::InvalidCapacity);
    // the smallest legal table is one neighborhood wide
    assert_eq!(Map::with_capacity(HOP_RANGE).unwrap().capacity(), HOP_RANGE);
}

#[test]
fn insert_get_remove_single() {
    let map = Map::with_capacity(32).unwrap();
    let mut k = [0; KEY_SIZE];
    k[0] = 0x01;
    let mut v = [0; VALUE_SIZE];
    v[0] = 0xAA;

    assert_eq!(map.insert(first_word, &k, &v), Insert::Inserted);
    let got = map.get(first_word, &k).unwrap();
    assert_eq!(got[0], 0xAA);
    assert!(got[1..].iter().all(|&b| b == 0));
    assert_eq!(map.len(), 1);

    assert!(map.remove(first_word, &k));
    assert_eq!(map.get(first_word, &k), None);
    assert_eq!(map.len(), 0);
    map.check_consistency();
}

#[test]
fn insert_duplicate_updates_in_place() {
    let map = Map::with_capacity(64).unwrap();
    let k = key(7);
    assert_eq!(map.insert(hash::murmur3, &k, &value(1)), Insert::Inserted);
    assert_eq!(map.insert(hash::murmur3, &k, &value(2)), Insert::Updated);
    assert_eq!(map.get(hash::murmur3, &k), Some(value(2)));
    assert_eq!(map.len(), 1);
    map.check_consistency();
}

#[test]
fn zero_hash_is_remapped() {
    let map = Map::with_capacity(32).unwrap();
    let k = key(9);
    assert_eq!(map.insert(zeroed, &k, &value(9)), Insert::Inserted);
    assert!(map.contains_key(zeroed, &k));
    assert!(map.remove(zeroed, &k));
    map.check_consistency();
}

#[test]
fn neighborhood_fills_then_overflows() {
    let map = Map::with_capacity(256).unwrap();
    for i in 0..32 {
        assert_eq!(map.insert(clustered, &key(i), &value(i)), Insert::Inserted);
    }
    // every neighborhood cell of home 1 is both occupied and registered
    assert_eq!(map.hop_bits(1), u32::MAX);

    // the 33rd same-home entry is parked past the neighborhood and stays
    // unregistered; the home bitmap keeps covering exactly the 32 in-window
    // entries
    assert_eq!(map.insert(clustered, &key(32), &value(32)), Insert::Inserted);
    assert_eq!(map.hop_bits(1), u32::MAX);
    assert_eq!(map.len(), 33);
    assert_eq!(map.get(clustered, &key(32)), Some(value(32)));
    map.check_consistency();
}

#[test]
fn duplicate_in_displacement_tail_is_updated_not_duplicated() {
    let map = Map::with_capacity(256).unwrap();
    for i in 0..40 {
        assert_eq!(map.insert(clustered, &key(i), &value(i)), Insert::Inserted);
    }
    // key 35 lives past the neighborhood; the duplicate scan must reach it
    assert_eq!(map.insert(clustered, &key(35), &value(100)), Insert::Updated);
    assert_eq!(map.len(), 40);
    assert_eq!(map.get(clustered, &key(35)), Some(value(100)));
    map.check_consistency();
}

#[test]
fn remove_tail_entry() {
    let map = Map::with_capacity(256).unwrap();
    for i in 0..40 {
        assert_eq!(map.insert(clustered, &key(i), &value(i)), Insert::Inserted);
    }
    assert!(map.remove(clustered, &key(36)));
    assert_eq!(map.get(clustered, &key(36)), None);
    assert_eq!(map.len(), 39);
    map.check_consistency();
}

#[test]
fn remove_clears_only_its_own_hop_bit() {
    let map = Map::with_capacity(64).unwrap();
    let (k1, k2) = (key(1), key(2));
    assert_eq!(map.insert(clustered, &k1, &value(1)), Insert::Inserted);
    assert_eq!(map.insert(clustered, &k2, &value(2)), Insert::Inserted);
    // k1 sits at the home itself, k2 one past it
    assert_eq!(map.hop_bits(1), 0b11);

    assert!(map.remove(clustered, &k1));
    assert_eq!(map.hop_bits(1), 0b10);
    assert_eq!(map.get(clustered, &k2), Some(value(2)));
    map.check_consistency();
}

#[test]
fn displacement_pulls_movable_neighbor_forward() {
    let map = Map::with_capacity(256).unwrap();

    // A lone entry homed at 40 sits in the middle of home 9's neighborhood.
    let blocker = key(40);
    assert_eq!(map.insert(first_word, &blocker, &value(40)), Insert::Inserted);

    // 31 entries homed at 9 fill the rest of the window [9, 41)...
    let homed_at_9: Vec<Key> = (0..32).map(|n| key(9 + 256 * n)).collect();
    for (k, n) in homed_at_9.iter().zip(0..31) {
        assert_eq!(map.insert(first_word, k, &value(n)), Insert::Inserted);
    }
    assert_eq!(map.hop_bits(40), 1);

    // ...so the 32nd must hop-shuffle the blocker one cell forward to make
    // room inside the neighborhood.
    assert_eq!(map.insert(first_word, &homed_at_9[31], &value(31)), Insert::Inserted);
    assert_eq!(map.hop_bits(9), u32::MAX, "home 9 should own its whole neighborhood");
    assert_eq!(map.hop_bits(40), 0b10, "the blocker's hop bit should follow it to cell 41");

    assert_eq!(map.get(first_word, &blocker), Some(value(40)));
    for (n, k) in homed_at_9.iter().enumerate() {
        assert_eq!(map.get(first_word, k), Some(value(n as u32)), "lost key {n}");
    }
    map.check_consistency();
}

#[test]
fn clear_resets_everything() {
    let mut map = Map::with_capacity(128).unwrap();
    for i in 0..50 {
        assert_eq!(map.insert(hash::fnv, &key(i), &value(i)), Insert::Inserted);
    }
    map.clear();
    assert_eq!(map.len(), 0);
    assert!(!map.contains_key(hash::fnv, &key(3)));
    map.check_consistency();

    assert_eq!(map.insert(hash::fnv, &key(3), &value(3)), Insert::Inserted);
    assert_eq!(map.get(hash::fnv, &key(3)), Some(value(3)));
}

#[test]
fn mixed_workload_stays_consistent() {
    let map = Map::with_capacity(2048).unwrap();
    let keys: Vec<Key> = (0..1000).map(key).collect();

    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.insert(hash::murmur3, k, &value(i as u32)), Insert::Inserted);
    }
    map.check_consistency();

    for k in keys.iter().step_by(2) {
        assert!(map.remove(hash::murmur3, k));
    }
    map.check_consistency();
    assert_eq!(map.len(), 500);

    for (i, k) in keys.iter().enumerate() {
        let expected = if i % 2 == 0 { None } else { Some(value(i as u32)) };
        assert_eq!(map.get(hash::murmur3, k), expected);
    }
}

#[test]
fn hashers_differ_and_are_stable() {
    let k = key(0xF00D);
    assert_eq!(hash::murmur3(&k), hash::murmur3(&k));
    assert_eq!(hash::fnv(&k), hash::fnv(&k));
    assert_ne!(hash::murmur3(&k), hash::murmur3(&key(0xF00E)));
}
