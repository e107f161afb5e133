// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Stateless cursor scan over a [`Dict`].
//!
//! The caller starts with a cursor of 0, passes the returned cursor back on
//! every call, and is done when the cursor returns to 0. The cursor fully
//! encodes scan progress, so the table is free to grow, shrink, or rehash
//! between calls. Every element present for the whole scan is returned at
//! least once; elements may be returned more than once, and elements added
//! or removed mid-scan may or may not be seen.
//!
//! The cursor walks bucket indices with the increment applied to the
//! reversed bit pattern (Pieter Noordhuis' design). Because tables are
//! power-of-two sized and a bucket at mask `m` maps onto the set of buckets
//! that share its low bits at any larger mask, counting from the high bits
//! down means indices already visited at a smaller size stay visited after
//! the table grows, and a shrink never exposes an unvisited low-bit
//! combination that was not already covered.
//!
//! While a migration is in flight both tables exist; the smaller table is
//! scanned at the cursor and then every expansion of that index into the
//! larger table is scanned, which reduces the problem to the one-table
//! case. The price of statelessness is that one call may emit a few buckets
//! worth of entries at once.

use crate::{Dict, KeyDiscipline};

impl<V, D: KeyDiscipline> Dict<V, D> {
    /// Scans one cursor position, invoking `f` for every entry found there.
    /// Returns the next cursor, or 0 when the scan is complete.
    pub fn scan<F>(&self, cursor: u64, mut f: F) -> u64
    where
        F: FnMut(&[u8], &V),
    {
        self.scan_buckets(cursor, &mut f, |_| {})
    }

    /// Like [`Dict::scan`], but also invokes `bucket_fn` with each visited
    /// bucket index before its entries are emitted.
    pub fn scan_buckets<F, B>(&self, mut v: u64, mut f: F, mut bucket_fn: B) -> u64
    where
        F: FnMut(&[u8], &V),
        B: FnMut(u64),
    {
        if self.is_empty() {
            return 0;
        }

        if !self.is_rehashing() {
            let t0 = &self.ht[0];
            let m0 = t0.mask() as u64;

            bucket_fn(v & m0);
            self.emit_chain(0, (v & m0) as usize, &mut f);

            // set the unmasked bits so the increment operates on the masked
            // bits only
            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
        } else {
            // scan the smaller table first, then every expansion of the
            // cursor in the larger table
            let (small, large) = if self.ht[0].size() <= self.ht[1].size() {
                (0, 1)
            } else {
                (1, 0)
            };
            let m0 = self.ht[small].mask() as u64;
            let m1 = self.ht[large].mask() as u64;

            bucket_fn(v & m0);
            self.emit_chain(small, (v & m0) as usize, &mut f);

            loop {
                bucket_fn(v & m1);
                self.emit_chain(large, (v & m1) as usize, &mut f);

                // increment the bits not covered by the smaller mask
                v |= !m1;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();

                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }

        v
    }

    fn emit_chain<F>(&self, t: usize, idx: usize, f: &mut F)
    where
        F: FnMut(&[u8], &V),
    {
        let mut cur = self.ht[t].buckets[idx].as_deref();
        while let Some(e) = cur {
            f(&e.key, &e.value);
            cur = e.next.as_deref();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Dict;
    use std::collections::HashSet;

    fn key(i: usize) -> Vec<u8> {
        i.to_string().into_bytes()
    }

    #[test]
    fn scan_empty_returns_zero() {
        let d: Dict<u64> = Dict::new();
        let mut hits = 0;
        assert_eq!(d.scan(0, |_, _| hits += 1), 0);
        assert_eq!(hits, 0);
    }

    #[test]
    fn scan_reports_every_element() {
        let mut d: Dict<u64> = Dict::new();
        for i in 0..1000 {
            d.add(&key(i), i as u64).unwrap();
        }

        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.to_vec());
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn scan_covers_both_tables_mid_rehash() {
        let mut d: Dict<u64> = Dict::new();
        for i in 0..512 {
            d.add(&key(i), 0).unwrap();
        }
        assert!(d.is_rehashing());

        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.to_vec());
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 512);
    }

    #[test]
    fn bucket_callback_runs_per_visited_bucket() {
        let mut d: Dict<u64> = Dict::new();
        for i in 0..64 {
            d.add(&key(i), 0).unwrap();
        }
        while d.rehash(100) {}

        let mut buckets = Vec::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan_buckets(cursor, |_, _| {}, |b| buckets.push(b));
            if cursor == 0 {
                break;
            }
        }
        // a stable table visits each bucket exactly once
        let size = d.slots() as u64;
        assert_eq!(buckets.len() as u64, size);
        let distinct: HashSet<u64> = buckets.iter().copied().collect();
        assert_eq!(distinct.len() as u64, size);
    }
}
