// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! An incrementally-resized hash table used as the primary keyspace
//! container. Tables are always a power of two in size and collisions are
//! handled by chaining. When the load factor requires it, the table grows
//! into a second, larger table one bucket at a time, so no single operation
//! ever pays the full O(N) migration cost.
//!
//! Keys are opaque byte strings owned by the table. Values are generic.
//! Hashing and key equality come from a [`KeyDiscipline`], which defaults to
//! SipHash-1-3 keyed with a process-wide random seed to resist
//! hash-flooding.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use log::{debug, trace};
use rand::rngs::OsRng;
use rand::RngCore;
use siphasher::sip::SipHasher13;

use crate::metrics::*;

mod iter;
pub mod metrics;
mod sample;
mod scan;
mod stats;

pub use iter::{Iter, SafeIter};

/// The initial size of every table.
pub const INITIAL_SIZE: usize = 4;

/// Load factor above which growth happens even while resizing is disabled.
const FORCE_RESIZE_RATIO: usize = 5;

/// Using [`enable_resize`] / [`disable_resize`] it is possible to
/// enable/disable resizing of the tables as needed. This matters when a
/// fork-based snapshot is in progress and copy-on-write pressure must be
/// kept low. Even while resizing is disabled, a table is still allowed to
/// grow once the ratio between elements and buckets exceeds
/// `FORCE_RESIZE_RATIO`.
static RESIZE_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn enable_resize() {
    RESIZE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_resize() {
    RESIZE_ENABLED.store(false, Ordering::Relaxed);
}

fn resize_enabled() -> bool {
    RESIZE_ENABLED.load(Ordering::Relaxed)
}

static HASH_SEED: OnceLock<[u8; 16]> = OnceLock::new();

/// Sets the process-wide hash seed. Returns false if hashing has already
/// begun and the seed can no longer change.
pub fn set_hash_seed(seed: [u8; 16]) -> bool {
    HASH_SEED.set(seed).is_ok()
}

/// The process-wide hash seed, generated from the OS entropy source on
/// first use unless it was set explicitly at startup.
pub fn hash_seed() -> &'static [u8; 16] {
    HASH_SEED.get_or_init(|| {
        let mut seed = [0; 16];
        OsRng.fill_bytes(&mut seed);
        seed
    })
}

fn seed_keys() -> (u64, u64) {
    let seed = hash_seed();
    let k0 = u64::from_le_bytes(seed[0..8].try_into().unwrap());
    let k1 = u64::from_le_bytes(seed[8..16].try_into().unwrap());
    (k0, k1)
}

/// Hashes a byte string with the seeded default hash function.
pub fn default_hash(key: &[u8]) -> u64 {
    use std::hash::Hasher;
    let (k0, k1) = seed_keys();
    let mut hasher = SipHasher13::new_with_keys(k0, k1);
    hasher.write(key);
    hasher.finish()
}

/// The type descriptor for a [`Dict`]: how keys hash and compare. Value
/// duplication and destruction are expressed through ownership and `Drop`.
pub trait KeyDiscipline {
    fn hash(&self, key: &[u8]) -> u64;

    fn key_eq(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// Default discipline: seeded SipHash-1-3 over the raw bytes, byte-wise
/// equality.
#[derive(Clone, Copy, Debug, Default)]
pub struct SipKeys;

impl KeyDiscipline for SipKeys {
    fn hash(&self, key: &[u8]) -> u64 {
        default_hash(key)
    }
}

/// Case-insensitive discipline for command-table style users: ASCII case is
/// folded both for hashing and equality.
#[derive(Clone, Copy, Debug, Default)]
pub struct CaseInsensitiveKeys;

impl KeyDiscipline for CaseInsensitiveKeys {
    fn hash(&self, key: &[u8]) -> u64 {
        use std::hash::Hasher;
        let (k0, k1) = seed_keys();
        let mut hasher = SipHasher13::new_with_keys(k0, k1);
        for byte in key {
            hasher.write_u8(byte.to_ascii_lowercase());
        }
        hasher.finish()
    }

    fn key_eq(&self, a: &[u8], b: &[u8]) -> bool {
        a.eq_ignore_ascii_case(b)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("key already exists")]
    AlreadyExists,
    #[error("key not found")]
    NotFound,
    #[error("resize rejected")]
    ResizeRejected,
}

/// A single key/value pair. Entries are owned by their table; [`Dict::unlink`]
/// detaches one so the caller can inspect it before dropping it.
pub struct Entry<V> {
    key: Box<[u8]>,
    value: V,
    next: Option<Box<Entry<V>>>,
}

impl<V> Entry<V> {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn into_parts(self) -> (Box<[u8]>, V) {
        (self.key, self.value)
    }
}

/// One of the two bucket tables inside a [`Dict`].
pub(crate) struct Table<V> {
    pub(crate) buckets: Vec<Option<Box<Entry<V>>>>,
    pub(crate) used: usize,
}

impl<V> Table<V> {
    fn unallocated() -> Self {
        Self {
            buckets: Vec::new(),
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        let mut buckets = Vec::new();
        buckets.resize_with(size, || None);
        Self { buckets, used: 0 }
    }

    pub(crate) fn size(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn mask(&self) -> usize {
        self.buckets.len().wrapping_sub(1)
    }
}

/// The keyspace container: a pair of bucket tables with a migration cursor.
/// While rehashing, `ht[0]` drains into `ht[1]` one bucket per mutating
/// operation; lookups probe both tables and insertions target `ht[1]`.
pub struct Dict<V, D: KeyDiscipline = SipKeys> {
    pub(crate) discipline: D,
    pub(crate) ht: [Table<V>; 2],
    /// Index of the next `ht[0]` bucket to migrate, -1 when not rehashing.
    pub(crate) rehash_idx: isize,
    /// Number of live safe iterators; rehash steps are suppressed while
    /// nonzero.
    pub(crate) pause: usize,
}

impl<V> Dict<V> {
    pub fn new() -> Self {
        Self::with_discipline(SipKeys)
    }
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, D: KeyDiscipline> Dict<V, D> {
    pub fn with_discipline(discipline: D) -> Self {
        Self {
            discipline,
            ht: [Table::unallocated(), Table::unallocated()],
            rehash_idx: -1,
            pause: 0,
        }
    }

    /// Number of elements across both tables.
    pub fn len(&self) -> usize {
        self.ht[0].used + self.ht[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets across both tables.
    pub fn slots(&self) -> usize {
        self.ht[0].size() + self.ht[1].size()
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    fn next_power(size: usize) -> usize {
        size.max(INITIAL_SIZE).next_power_of_two()
    }

    /// Creates or grows the table to hold at least `size` elements. Refused
    /// while a migration is in progress, when the table already holds more
    /// than `size` elements, or when the rounded size is the current size.
    pub fn expand(&mut self, size: usize) -> Result<(), Error> {
        if self.is_rehashing() || self.ht[0].used > size {
            return Err(Error::ResizeRejected);
        }

        let realsize = Self::next_power(size);
        if realsize == self.ht[0].size() {
            return Err(Error::ResizeRejected);
        }

        let fresh = Table::with_size(realsize);

        // first allocation is not a migration
        if self.ht[0].size() == 0 {
            self.ht[0] = fresh;
            return Ok(());
        }

        if realsize > self.ht[0].size() {
            debug!(
                "growing table from {} to {} buckets ({} elements)",
                self.ht[0].size(),
                realsize,
                self.ht[0].used
            );
            KEYSPACE_GROW.increment();
        } else {
            debug!(
                "shrinking table from {} to {} buckets ({} elements)",
                self.ht[0].size(),
                realsize,
                self.ht[0].used
            );
            KEYSPACE_SHRINK.increment();
        }
        self.ht[1] = fresh;
        self.rehash_idx = 0;
        Ok(())
    }

    /// Shrinks the table to the smallest size containing all elements,
    /// bounded below by [`INITIAL_SIZE`].
    pub fn shrink(&mut self) -> Result<(), Error> {
        if !resize_enabled() || self.is_rehashing() {
            return Err(Error::ResizeRejected);
        }
        let minimal = self.ht[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    /// Performs up to `n` bucket migrations. Visits at most `10 * n` empty
    /// buckets so a sparse source table cannot stall the caller. Returns
    /// true if the migration is still incomplete.
    pub fn rehash(&mut self, n: usize) -> bool {
        let mut empty_visits = n.saturating_mul(10);
        if !self.is_rehashing() {
            return false;
        }

        let mut remaining = n;
        while remaining > 0 && self.ht[0].used != 0 {
            remaining -= 1;

            debug_assert!((self.rehash_idx as usize) < self.ht[0].size());
            while self.ht[0].buckets[self.rehash_idx as usize].is_none() {
                self.rehash_idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            // relink every entry of this bucket into the target table
            let mut entry = self.ht[0].buckets[self.rehash_idx as usize].take();
            while let Some(mut e) = entry {
                entry = e.next.take();
                let idx = (self.discipline.hash(&e.key) as usize) & self.ht[1].mask();
                e.next = self.ht[1].buckets[idx].take();
                self.ht[1].buckets[idx] = Some(e);
                self.ht[0].used -= 1;
                self.ht[1].used += 1;
            }
            self.rehash_idx += 1;
            KEYSPACE_REHASH_BUCKET.increment();
        }

        if self.ht[0].used == 0 {
            trace!(
                "incremental rehash complete, {} elements in {} buckets",
                self.ht[1].used,
                self.ht[1].size()
            );
            self.ht[0] = mem::replace(&mut self.ht[1], Table::unallocated());
            self.rehash_idx = -1;
            return false;
        }

        true
    }

    /// Rehashes in batches of 100 buckets until `ms` milliseconds have
    /// elapsed or the migration completes. Returns the number of batches
    /// times 100.
    pub fn rehash_ms(&mut self, ms: u64) -> usize {
        let start = Instant::now();
        let mut rehashes = 0;

        while self.rehash(100) {
            rehashes += 100;
            if start.elapsed().as_millis() as u64 > ms {
                break;
            }
        }
        rehashes
    }

    /// A single migration step, skipped while any safe iterator is live.
    pub(crate) fn rehash_step(&mut self) {
        if self.pause == 0 {
            self.rehash(1);
        }
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }

        if self.ht[0].size() == 0 {
            let _ = self.expand(INITIAL_SIZE);
            return;
        }

        if self.ht[0].used >= self.ht[0].size()
            && (resize_enabled() || self.ht[0].used > self.ht[0].size() * FORCE_RESIZE_RATIO)
        {
            let _ = self.expand(self.ht[0].used * 2);
        }
    }

    /// Locates a key, returning `(table, bucket, chain position)`.
    pub(crate) fn locate(&self, hash: u64, key: &[u8]) -> Option<(usize, usize, usize)> {
        for t in 0..2 {
            if self.ht[t].buckets.is_empty() {
                if self.is_rehashing() {
                    continue;
                } else {
                    break;
                }
            }
            let idx = (hash as usize) & self.ht[t].mask();
            let mut pos = 0;
            let mut cur = self.ht[t].buckets[idx].as_deref();
            while let Some(e) = cur {
                if self.discipline.key_eq(&e.key, key) {
                    return Some((t, idx, pos));
                }
                pos += 1;
                cur = e.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    pub(crate) fn chain_len(&self, t: usize, idx: usize) -> usize {
        let mut n = 0;
        let mut cur = self.ht[t].buckets[idx].as_deref();
        while let Some(e) = cur {
            n += 1;
            cur = e.next.as_deref();
        }
        n
    }

    pub(crate) fn entry_at(&self, t: usize, idx: usize, pos: usize) -> Option<(&[u8], &V)> {
        let mut i = 0;
        let mut cur = self.ht[t].buckets[idx].as_deref();
        while let Some(e) = cur {
            if i == pos {
                return Some((&e.key, &e.value));
            }
            i += 1;
            cur = e.next.as_deref();
        }
        None
    }

    fn value_at_mut(&mut self, t: usize, idx: usize, pos: usize) -> &mut V {
        let mut cur = self.ht[t].buckets[idx].as_deref_mut();
        for _ in 0..pos {
            cur = cur.and_then(|e| e.next.as_deref_mut());
        }
        match cur {
            Some(e) => &mut e.value,
            None => unreachable!("located entry vanished from its chain"),
        }
    }

    /// Links a fresh entry at the head of its bucket. New entries go to the
    /// target table while rehashing.
    fn link_new(&mut self, hash: u64, key: &[u8], value: V) {
        let t = if self.is_rehashing() { 1 } else { 0 };
        let idx = (hash as usize) & self.ht[t].mask();
        let next = self.ht[t].buckets[idx].take();
        self.ht[t].buckets[idx] = Some(Box::new(Entry {
            key: key.into(),
            value,
            next,
        }));
        self.ht[t].used += 1;
    }

    /// Inserts the pair if the key is absent. On conflict the value is
    /// handed back untouched.
    pub fn add(&mut self, key: &[u8], value: V) -> Result<(), V> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.discipline.hash(key);
        self.expand_if_needed();
        if self.locate(hash, key).is_some() {
            return Err(value);
        }
        self.link_new(hash, key, value);
        Ok(())
    }

    /// Returns the value for `key`, inserting `fill()` if the key is absent.
    pub fn or_insert_with(&mut self, key: &[u8], fill: impl FnOnce() -> V) -> &mut V {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.discipline.hash(key);
        self.expand_if_needed();
        match self.locate(hash, key) {
            Some((t, idx, pos)) => self.value_at_mut(t, idx, pos),
            None => {
                self.link_new(hash, key, fill());
                let t = if self.is_rehashing() { 1 } else { 0 };
                let idx = (hash as usize) & self.ht[t].mask();
                self.value_at_mut(t, idx, 0)
            }
        }
    }

    /// Inserts or overwrites. The new value is written before the old one is
    /// dropped, which matters for values that reference themselves through a
    /// shared pool. Returns true if the key was inserted, false if an
    /// existing value was overwritten.
    pub fn replace(&mut self, key: &[u8], value: V) -> bool {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.discipline.hash(key);
        self.expand_if_needed();
        match self.locate(hash, key) {
            None => {
                self.link_new(hash, key, value);
                true
            }
            Some((t, idx, pos)) => {
                let slot = self.value_at_mut(t, idx, pos);
                let old = mem::replace(slot, value);
                drop(old);
                false
            }
        }
    }

    /// Expected O(1) lookup. Probes the source table and, while rehashing,
    /// the target table.
    pub fn find(&self, key: &[u8]) -> Option<&V> {
        if self.is_empty() {
            return None;
        }
        let hash = self.discipline.hash(key);
        match self.locate(hash, key) {
            Some((t, idx, pos)) => match self.entry_at(t, idx, pos) {
                Some((_, v)) => Some(v),
                None => unreachable!("located entry vanished from its chain"),
            },
            None => None,
        }
    }

    /// Mutable lookup. As a mutating operation this also performs one
    /// migration step.
    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.discipline.hash(key);
        match self.locate(hash, key) {
            Some((t, idx, pos)) => Some(self.value_at_mut(t, idx, pos)),
            None => None,
        }
    }

    /// Removes and drops the pair.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.unlink(key).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Removes the pair from its chain without dropping it, so the caller
    /// may inspect the entry first. Dropping the returned entry is the
    /// companion free.
    pub fn unlink(&mut self, key: &[u8]) -> Option<Box<Entry<V>>> {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.discipline.hash(key);
        let (t, idx, pos) = self.locate(hash, key)?;
        let entry = self.detach_at(t, idx, pos);
        self.ht[t].used -= 1;
        Some(entry)
    }

    fn detach_at(&mut self, t: usize, idx: usize, pos: usize) -> Box<Entry<V>> {
        let bucket = &mut self.ht[t].buckets[idx];
        if pos == 0 {
            let mut e = bucket.take().expect("located entry vanished");
            *bucket = e.next.take();
            return e;
        }

        let mut prev = bucket.as_deref_mut();
        for _ in 0..pos - 1 {
            prev = prev.and_then(|e| e.next.as_deref_mut());
        }
        let prev = prev.expect("located entry vanished");
        let mut e = prev.next.take().expect("located entry vanished");
        prev.next = e.next.take();
        e
    }

    /// Drops every entry and resets the table to its pristine state. The
    /// progress callback, when given, runs once per 65536 buckets visited so
    /// callers clearing a huge table inline can interleave other work.
    pub fn clear(&mut self, mut progress: Option<&mut dyn FnMut()>) {
        for t in 0..2 {
            let table = &mut self.ht[t];
            for (i, bucket) in table.buckets.iter_mut().enumerate() {
                if table.used == 0 {
                    break;
                }
                if i & 65535 == 0 {
                    if let Some(cb) = progress.as_deref_mut() {
                        cb();
                    }
                }
                let mut entry = bucket.take();
                while let Some(mut e) = entry {
                    entry = e.next.take();
                    table.used -= 1;
                }
            }
            *table = Table::unallocated();
        }
        self.rehash_idx = -1;
        self.pause = 0;
    }

    /// A 64 bit digest of the table state (pointers, sizes, element counts)
    /// mixed through Wang's integer hash. Captured when a raw iterator
    /// starts and checked when it is released to detect forbidden mutation.
    pub(crate) fn fingerprint(&self) -> u64 {
        let integers = [
            self.ht[0].buckets.as_ptr() as u64,
            self.ht[0].size() as u64,
            self.ht[0].used as u64,
            self.ht[1].buckets.as_ptr() as u64,
            self.ht[1].size() as u64,
            self.ht[1].used as u64,
        ];

        // Result = hash(hash(hash(int1)+int2)+int3) ... so the same integers
        // in a different order hash differently.
        let mut hash: u64 = 0;
        for int in integers {
            hash = hash.wrapping_add(int);
            hash = wang_mix64(hash);
        }
        hash
    }
}

/// Tomas Wang's 64 bit integer hash.
fn wang_mix64(mut hash: u64) -> u64 {
    hash = (!hash).wrapping_add(hash << 21);
    hash ^= hash >> 24;
    hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
    hash ^= hash >> 14;
    hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
    hash ^= hash >> 28;
    hash = hash.wrapping_add(hash << 31);
    hash
}

common::metrics::test_no_duplicates!();
