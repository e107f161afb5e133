// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Random access into a [`Dict`]: single-entry picks and bounded multi-entry
//! sampling for probabilistic eviction.

use rand::{thread_rng, Rng};

use crate::{Dict, KeyDiscipline};

impl<V, D: KeyDiscipline> Dict<V, D> {
    /// Returns a random entry. Chain lengths make the distribution only
    /// approximately uniform, which is good enough for the eviction and
    /// key-sampling callers this exists for.
    pub fn random_entry(&mut self) -> Option<(&[u8], &V)> {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }

        let mut rng = thread_rng();
        let (t, idx) = if self.is_rehashing() {
            // buckets below the migration cursor in the source table are
            // already empty, so sample the cursor offset onwards
            let base = self.rehash_idx as usize;
            loop {
                let slot = base + rng.gen_range(0..self.slots() - base);
                let (t, idx) = if slot >= self.ht[0].size() {
                    (1, slot - self.ht[0].size())
                } else {
                    (0, slot)
                };
                if self.ht[t].buckets[idx].is_some() {
                    break (t, idx);
                }
            }
        } else {
            loop {
                let idx = (rng.gen::<u64>() as usize) & self.ht[0].mask();
                if self.ht[0].buckets[idx].is_some() {
                    break (0, idx);
                }
            }
        };

        let listlen = self.chain_len(t, idx);
        self.entry_at(t, idx, rng.gen_range(0..listlen))
    }

    /// Samples up to `count` entries from consecutive buckets starting at a
    /// random index, probing both tables while a migration is in flight.
    /// May return fewer entries than requested; gives up after `10 * count`
    /// bucket probes. Does not guarantee a uniform distribution, nor
    /// distinct results across calls; the point is to produce a handful of
    /// candidates quickly.
    pub fn sample(&mut self, count: usize) -> Vec<(&[u8], &V)> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }

        // migrate in proportion to the work we are about to do
        for _ in 0..count {
            if self.is_rehashing() {
                self.rehash_step();
            } else {
                break;
            }
        }

        let this = &*self;
        let tables = if this.is_rehashing() { 2 } else { 1 };
        let mut maxsizemask = this.ht[0].mask();
        if tables > 1 && maxsizemask < this.ht[1].mask() {
            maxsizemask = this.ht[1].mask();
        }

        let mut rng = thread_rng();
        let mut idx = (rng.gen::<u64>() as usize) & maxsizemask;
        let mut emptylen = 0;
        let mut stored = Vec::with_capacity(count);
        let mut maxsteps = count * 10;

        while stored.len() < count && maxsteps > 0 {
            maxsteps -= 1;
            for t in 0..tables {
                // buckets below the migration cursor in the source table
                // hold nothing; skip ahead when the cursor allows it
                if tables == 2 && t == 0 && idx < this.rehash_idx as usize {
                    if idx >= this.ht[1].size() {
                        idx = this.rehash_idx as usize;
                    } else {
                        continue;
                    }
                }
                if idx >= this.ht[t].size() {
                    continue;
                }

                let mut cur = this.ht[t].buckets[idx].as_deref();
                if cur.is_none() {
                    emptylen += 1;
                    if emptylen >= 5 && emptylen > count {
                        idx = (rng.gen::<u64>() as usize) & maxsizemask;
                        emptylen = 0;
                    }
                } else {
                    emptylen = 0;
                    while let Some(e) = cur {
                        stored.push((&e.key[..], &e.value));
                        if stored.len() == count {
                            return stored;
                        }
                        cur = e.next.as_deref();
                    }
                }
            }
            idx = (idx + 1) & maxsizemask;
        }

        stored
    }
}
