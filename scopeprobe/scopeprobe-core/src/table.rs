//! Fixed-capacity keyed state table.
//!
//! This is the host counterpart of a preallocated BPF hash map. All storage
//! is allocated once in [`FixedTable::new`]; no operation allocates, blocks
//! or takes a lock afterwards, so every method is safe to call from a hook.
//!
//! # Layout
//!
//! Open addressing with linear probing over `2 * capacity` slots (rounded up
//! to a power of two). A probe sequence never visits more than
//! [`MAX_PROBE_SLOTS`] slots, so a lookup miss costs the same on a table that
//! has churned through millions of keys as on a fresh one. A key whose window
//! holds no free slot is rejected as [`TableError::Full`]. Each slot owns one key word and `ceil(size_of::<V>() / 8)`
//! value words, all atomics. A key is claimed by a single compare-and-swap on
//! its key word, which makes [`FixedTable::get_or_insert_with`] a true
//! insert-if-absent: two racing inserters of the same key agree on one slot.
//!
//! # Consistency
//!
//! Individual words are atomic; whole values are not. A reader racing a
//! writer may observe a mix of old and new words, exactly as with a BPF map
//! value updated field by field. Counter fields are only ever touched through
//! [`Entry::fetch_add`] and so never lose increments once the entry exists.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytemuck::Pod;
use log::debug;
use thiserror::Error;

use crate::error::ProbeError;

/// Slot has never held a key; terminates probe sequences.
const EMPTY: u64 = u64::MAX;
/// Slot held a key that was removed; skipped by lookups, reusable by inserts.
const TOMBSTONE: u64 = u64::MAX - 1;

/// Bound on compare-and-swap retries when claiming a slot under contention.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Longest probe sequence. Removed keys leave tombstones that never revert
/// to empty, so this is what bounds the work of a miss.
pub const MAX_PROBE_SLOTS: usize = 128;

/// Keys are stored as a single 64-bit word. The two largest bit patterns are
/// reserved slot markers.
pub trait TableKey: Copy + Eq {
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl TableKey for u32 {
    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as u32
    }
}

impl TableKey for u64 {
    fn to_bits(self) -> u64 {
        self
    }

    fn from_bits(bits: u64) -> Self {
        bits
    }
}

/// Mirrors `BPF_ANY`, `BPF_NOEXIST` and `BPF_EXIST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Any,
    NoExist,
    Exist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("table is full ({capacity} entries)")]
    Full { capacity: usize },
    #[error("key already present")]
    Exists,
    #[error("key not present")]
    NotFound,
    #[error("key collides with a reserved slot marker")]
    ReservedKey,
}

enum Claim {
    Inserted(usize),
    Existing(usize),
}

enum ClaimAttempt {
    Done(Claim),
    Retry,
    NoSlot,
}

pub struct FixedTable<K, V> {
    name: &'static str,
    keys: Box<[AtomicU64]>,
    values: Box<[AtomicU64]>,
    value_words: usize,
    mask: usize,
    probe_limit: usize,
    capacity: usize,
    len: AtomicUsize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: TableKey, V: Pod> FixedTable<K, V> {
    /// Allocate a table holding at most `capacity` live entries.
    pub fn new(name: &'static str, capacity: usize) -> Result<Self, ProbeError> {
        if capacity == 0 {
            return Err(ProbeError::ZeroCapacity { what: name });
        }
        let slots = capacity
            .checked_mul(2)
            .and_then(usize::checked_next_power_of_two)
            .ok_or(ProbeError::CapacityOverflow {
                what: name,
                value: capacity,
            })?;
        let value_words = std::mem::size_of::<V>().div_ceil(8).max(1);
        let total_words = slots
            .checked_mul(value_words)
            .ok_or(ProbeError::CapacityOverflow {
                what: name,
                value: capacity,
            })?;

        debug!(
            "table {}: capacity {} ({} slots, {} bytes per value)",
            name,
            capacity,
            slots,
            value_words * 8
        );

        Ok(Self {
            name,
            keys: (0..slots).map(|_| AtomicU64::new(EMPTY)).collect(),
            values: (0..total_words).map(|_| AtomicU64::new(0)).collect(),
            value_words,
            mask: slots - 1,
            probe_limit: slots.min(MAX_PROBE_SLOTS),
            capacity,
            len: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: K) -> Option<Entry<'_, V>> {
        let bits = checked_bits(key).ok()?;
        self.find(bits).map(|idx| self.entry(idx))
    }

    /// Create, overwrite or update an entry according to `mode`.
    pub fn insert(&self, key: K, value: &V, mode: UpdateMode) -> Result<(), TableError> {
        let bits = checked_bits(key)?;
        if let Some(idx) = self.find(bits) {
            if mode == UpdateMode::NoExist {
                return Err(TableError::Exists);
            }
            self.entry(idx).store(value);
            return Ok(());
        }
        if mode == UpdateMode::Exist {
            return Err(TableError::NotFound);
        }
        match self.claim(bits)? {
            Claim::Inserted(idx) => self.entry(idx).store(value),
            Claim::Existing(_) if mode == UpdateMode::NoExist => return Err(TableError::Exists),
            Claim::Existing(idx) => self.entry(idx).store(value),
        }
        Ok(())
    }

    /// Return the entry for `key`, inserting `init()` first if it is absent.
    ///
    /// `init` runs only when this call wins the slot. A racing caller that
    /// loses sees the winner's slot and never re-initialises it.
    pub fn get_or_insert_with(
        &self,
        key: K,
        init: impl FnOnce() -> V,
    ) -> Result<Entry<'_, V>, TableError> {
        let bits = checked_bits(key)?;
        if let Some(idx) = self.find(bits) {
            return Ok(self.entry(idx));
        }
        match self.claim(bits)? {
            Claim::Inserted(idx) => {
                let entry = self.entry(idx);
                entry.store(&init());
                Ok(entry)
            }
            Claim::Existing(idx) => Ok(self.entry(idx)),
        }
    }

    pub fn remove(&self, key: K) -> Result<(), TableError> {
        let bits = checked_bits(key)?;
        let idx = self.find(bits).ok_or(TableError::NotFound)?;
        self.release(idx, bits)
    }

    /// Remove `key` and return the value it held.
    pub fn take(&self, key: K) -> Option<V> {
        let bits = checked_bits(key).ok()?;
        let idx = self.find(bits)?;
        let value = self.entry(idx).load();
        self.release(idx, bits).ok().map(|()| value)
    }

    /// Non-destructive snapshot of every live entry.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.keys.iter().enumerate().filter_map(move |(idx, key)| {
            let bits = key.load(Ordering::Acquire);
            (bits < TOMBSTONE).then(|| (K::from_bits(bits), self.entry(idx).load()))
        })
    }

    fn entry(&self, idx: usize) -> Entry<'_, V> {
        let start = idx * self.value_words;
        Entry {
            words: &self.values[start..start + self.value_words],
            _marker: PhantomData,
        }
    }

    fn home(&self, bits: u64) -> usize {
        let mut x = bits;
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
        x ^= x >> 33;
        x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        x ^= x >> 33;
        (x as usize) & self.mask
    }

    fn find(&self, bits: u64) -> Option<usize> {
        self.locate(bits).0
    }

    /// Slot holding `bits`, if any, and the number of slots visited.
    fn locate(&self, bits: u64) -> (Option<usize>, usize) {
        let mut idx = self.home(bits);
        for visited in 1..=self.probe_limit {
            match self.keys[idx].load(Ordering::Acquire) {
                current if current == bits => return (Some(idx), visited),
                EMPTY => return (None, visited),
                _ => idx = (idx + 1) & self.mask,
            }
        }
        (None, self.probe_limit)
    }

    fn claim(&self, bits: u64) -> Result<Claim, TableError> {
        if !self.reserve_len() {
            return Err(TableError::Full {
                capacity: self.capacity,
            });
        }
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match self.try_claim(bits) {
                ClaimAttempt::Done(claim) => {
                    if let Claim::Existing(_) = claim {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                    }
                    return Ok(claim);
                }
                ClaimAttempt::Retry => continue,
                ClaimAttempt::NoSlot => break,
            }
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        Err(TableError::Full {
            capacity: self.capacity,
        })
    }

    /// Walk the probe sequence once, looking for the key and remembering the
    /// first reusable tombstone, then claim that tombstone or the terminating
    /// empty slot.
    fn try_claim(&self, bits: u64) -> ClaimAttempt {
        let mut idx = self.home(bits);
        let mut reusable = None;
        for _ in 0..self.probe_limit {
            match self.keys[idx].load(Ordering::Acquire) {
                current if current == bits => return ClaimAttempt::Done(Claim::Existing(idx)),
                TOMBSTONE if reusable.is_none() => reusable = Some(idx),
                EMPTY => {
                    return match reusable {
                        Some(tomb) => self.claim_slot(tomb, TOMBSTONE, bits),
                        None => self.claim_slot(idx, EMPTY, bits),
                    };
                }
                _ => {}
            }
            idx = (idx + 1) & self.mask;
        }
        match reusable {
            Some(tomb) => self.claim_slot(tomb, TOMBSTONE, bits),
            None => ClaimAttempt::NoSlot,
        }
    }

    fn claim_slot(&self, idx: usize, expected: u64, bits: u64) -> ClaimAttempt {
        match self.keys[idx].compare_exchange(expected, bits, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => ClaimAttempt::Done(Claim::Inserted(idx)),
            Err(actual) if actual == bits => ClaimAttempt::Done(Claim::Existing(idx)),
            Err(_) => ClaimAttempt::Retry,
        }
    }

    fn reserve_len(&self) -> bool {
        let mut current = self.len.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.len.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, idx: usize, bits: u64) -> Result<(), TableError> {
        self.keys[idx]
            .compare_exchange(bits, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TableError::NotFound)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

impl<K, V> fmt::Debug for FixedTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedTable")
            .field("name", &self.name)
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn checked_bits<K: TableKey>(key: K) -> Result<u64, TableError> {
    let bits = key.to_bits();
    if bits >= TOMBSTONE {
        Err(TableError::ReservedKey)
    } else {
        Ok(bits)
    }
}

/// Borrowed view of one live value.
pub struct Entry<'a, V> {
    words: &'a [AtomicU64],
    _marker: PhantomData<V>,
}

impl<V: Pod> Entry<'_, V> {
    pub fn load(&self) -> V {
        read_words(self.words)
    }

    pub fn store(&self, value: &V) {
        write_words(self.words, value);
    }

    /// Atomically add `delta` to the `u64` field at `byte_offset`.
    /// Returns the previous value, or `None` for an out-of-range offset.
    pub fn fetch_add(&self, byte_offset: usize, delta: u64) -> Option<u64> {
        debug_assert_eq!(byte_offset % 8, 0, "counter fields are word aligned");
        self.words
            .get(byte_offset / 8)
            .map(|word| word.fetch_add(delta, Ordering::Relaxed))
    }
}

pub(crate) fn read_words<V: Pod>(words: &[AtomicU64]) -> V {
    let mut value = V::zeroed();
    let bytes = bytemuck::bytes_of_mut(&mut value);
    for (chunk, word) in bytes.chunks_mut(8).zip(words) {
        let raw = word.load(Ordering::Relaxed).to_ne_bytes();
        chunk.copy_from_slice(&raw[..chunk.len()]);
    }
    value
}

pub(crate) fn write_words<V: Pod>(words: &[AtomicU64], value: &V) {
    for (chunk, word) in bytemuck::bytes_of(value).chunks(8).zip(words) {
        let mut raw = [0u8; 8];
        raw[..chunk.len()].copy_from_slice(chunk);
        word.store(u64::from_ne_bytes(raw), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopeprobe_common::{CounterKind, PerfStats};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_get_remove() {
        let table: FixedTable<u64, u64> = FixedTable::new("spans", 4).unwrap();
        assert!(table.get(1).is_none());

        table.insert(1, &100, UpdateMode::Any).unwrap();
        assert_eq!(table.get(1).unwrap().load(), 100);
        assert_eq!(table.len(), 1);

        table.insert(1, &200, UpdateMode::Any).unwrap();
        assert_eq!(table.get(1).unwrap().load(), 200);
        assert_eq!(table.len(), 1);

        table.remove(1).unwrap();
        assert!(table.get(1).is_none());
        assert!(table.is_empty());
        assert_eq!(table.remove(1), Err(TableError::NotFound));
    }

    #[test]
    fn update_modes() {
        let table: FixedTable<u32, u64> = FixedTable::new("modes", 4).unwrap();
        assert_eq!(table.insert(5, &1, UpdateMode::Exist), Err(TableError::NotFound));
        table.insert(5, &1, UpdateMode::NoExist).unwrap();
        assert_eq!(table.insert(5, &2, UpdateMode::NoExist), Err(TableError::Exists));
        assert_eq!(table.get(5).unwrap().load(), 1);
        table.insert(5, &3, UpdateMode::Exist).unwrap();
        assert_eq!(table.get(5).unwrap().load(), 3);
    }

    #[test]
    fn full_table_rejects_new_keys_but_updates_existing() {
        let table: FixedTable<u32, u64> = FixedTable::new("tiny", 2).unwrap();
        table.insert(1, &1, UpdateMode::Any).unwrap();
        table.insert(2, &2, UpdateMode::Any).unwrap();
        assert_eq!(
            table.insert(3, &3, UpdateMode::Any),
            Err(TableError::Full { capacity: 2 })
        );
        table.insert(2, &20, UpdateMode::Any).unwrap();
        assert_eq!(table.get(2).unwrap().load(), 20);

        table.remove(1).unwrap();
        table.insert(3, &3, UpdateMode::Any).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn tombstones_are_reused() {
        let table: FixedTable<u64, u64> = FixedTable::new("churn", 3).unwrap();
        for key in 0..10_000u64 {
            table.insert(key, &key, UpdateMode::Any).unwrap();
            assert_eq!(table.take(key), Some(key));
        }
        assert!(table.is_empty());
        table.insert(77, &1, UpdateMode::NoExist).unwrap();
        assert!(table.contains_key(77));
    }

    #[test]
    fn misses_stay_cheap_after_heavy_churn() {
        let table: FixedTable<u64, u64> = FixedTable::new("churn", 1024).unwrap();
        for key in 0..50_000u64 {
            table.insert(key, &key, UpdateMode::Any).unwrap();
            table.remove(key).unwrap();
        }
        assert!(table.keys.len() > MAX_PROBE_SLOTS);

        for key in 1_000_000..1_001_000u64 {
            let (slot, visited) = table.locate(key);
            assert!(slot.is_none());
            assert!(visited <= MAX_PROBE_SLOTS, "miss visited {} slots", visited);
        }

        for key in 1_000_000..1_001_024u64 {
            table.insert(key, &key, UpdateMode::NoExist).unwrap();
        }
        assert_eq!(table.len(), 1024);
        for key in 1_000_000..1_001_024u64 {
            let (slot, visited) = table.locate(key);
            assert!(slot.is_some());
            assert!(visited <= MAX_PROBE_SLOTS);
        }
    }

    #[test]
    fn get_or_insert_initialises_once() {
        let table: FixedTable<u32, PerfStats> = FixedTable::new("stats", 4).unwrap();
        let entry = table
            .get_or_insert_with(9, || PerfStats {
                cycles: 5,
                ..PerfStats::default()
            })
            .unwrap();
        entry.fetch_add(CounterKind::Cycles.field_offset(), 10);

        let again = table
            .get_or_insert_with(9, || panic!("must not re-initialise"))
            .unwrap();
        assert_eq!(again.load().cycles, 15);
    }

    #[test]
    fn fetch_add_targets_one_field() {
        let table: FixedTable<u32, PerfStats> = FixedTable::new("stats", 1).unwrap();
        table.insert(1, &PerfStats::default(), UpdateMode::Any).unwrap();
        let entry = table.get(1).unwrap();
        entry.fetch_add(CounterKind::LlcLoadMisses.field_offset(), 3);
        let stats = entry.load();
        assert_eq!(stats.llc_load_misses, 3);
        assert_eq!(stats.llc_loads, 0);
        assert_eq!(entry.fetch_add(4096, 1), None);
    }

    #[test]
    fn small_values_round_trip() {
        let table: FixedTable<u32, u8> = FixedTable::new("flags", 2).unwrap();
        table.insert(3, &1u8, UpdateMode::Any).unwrap();
        assert_eq!(table.get(3).unwrap().load(), 1u8);
        let snapshot: Vec<_> = table.iter().collect();
        assert_eq!(snapshot, vec![(3, 1u8)]);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let table: FixedTable<u64, u64> = FixedTable::new("reserved", 2).unwrap();
        assert_eq!(
            table.insert(u64::MAX, &1, UpdateMode::Any),
            Err(TableError::ReservedKey)
        );
        assert!(table.get(u64::MAX - 1).is_none());
    }

    #[test]
    fn zero_capacity_is_an_error() {
        assert!(FixedTable::<u32, u64>::new("none", 0).is_err());
    }

    #[test]
    fn concurrent_first_touch_yields_one_entry() {
        let table: Arc<FixedTable<u64, PerfStats>> =
            Arc::new(FixedTable::new("race", 16).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for key in 0..16u64 {
                        table.get_or_insert_with(key, PerfStats::default).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 16);
        assert_eq!(table.iter().count(), 16);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let table: Arc<FixedTable<u32, PerfStats>> =
            Arc::new(FixedTable::new("adds", 1).unwrap());
        table.insert(1, &PerfStats::default(), UpdateMode::Any).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Some(entry) = table.get(1) {
                            entry.fetch_add(CounterKind::Instructions.field_offset(), 2);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.get(1).unwrap().load().instructions, 8 * 10_000 * 2);
    }

    #[test]
    fn concurrent_churn_leaves_table_empty() {
        let table: Arc<FixedTable<u64, u64>> = Arc::new(FixedTable::new("churn", 64).unwrap());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..5_000u64 {
                        let key = (t << 32) | (i % 16);
                        table.insert(key, &i, UpdateMode::Any).unwrap();
                        table.remove(key).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
