// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Forward iteration over a [`Dict`]. Both iterators are detached cursors:
//! they hold no borrow of the dictionary between calls, so the dictionary is
//! passed to every `next`. Iteration walks the source table in bucket order
//! and, while a migration is in flight, continues into the target table.
//!
//! The safe variant suppresses migration steps while it is live and
//! tolerates interleaved inserts, deletes, and lookups, including deleting
//! the entry it just returned. The raw variant is cheaper and forbids any
//! mutation: it captures a fingerprint of the dictionary on the first `next`
//! and release panics if the fingerprint no longer matches.

use crate::{Dict, KeyDiscipline};

/// A mutation-tolerant cursor. Call [`SafeIter::release`] when done, or
/// migration stays paused on the dictionary.
pub struct SafeIter {
    table: usize,
    bucket: usize,
    /// Chain position of the last entry returned from the current bucket.
    pos: usize,
    /// Key of the last entry returned, used to re-locate the cursor after
    /// the caller mutates the chain.
    last_key: Option<Box<[u8]>>,
    started: bool,
}

impl SafeIter {
    pub(crate) fn new() -> Self {
        Self {
            table: 0,
            bucket: 0,
            pos: 0,
            last_key: None,
            started: false,
        }
    }

    /// Returns the next entry, or None when iteration is complete. The
    /// caller may mutate the dictionary freely between calls.
    pub fn next<'a, V, D: KeyDiscipline>(
        &mut self,
        d: &'a mut Dict<V, D>,
    ) -> Option<(&'a [u8], &'a V)> {
        if !self.started {
            self.started = true;
            d.pause += 1;
        }
        let d = &*d;

        loop {
            if d.ht[self.table].size() == 0 || self.bucket >= d.ht[self.table].size() {
                if d.is_rehashing() && self.table == 0 {
                    self.table = 1;
                    self.bucket = 0;
                    self.pos = 0;
                    self.last_key = None;
                    continue;
                }
                return None;
            }

            // Re-locate within the chain: if the last returned entry is
            // still present, the target is its successor. If it was deleted,
            // its old position now names the successor directly.
            let target = match &self.last_key {
                None => 0,
                Some(last) => {
                    let mut found = None;
                    let mut pos = 0;
                    let mut cur = d.ht[self.table].buckets[self.bucket].as_deref();
                    while let Some(e) = cur {
                        if d.discipline.key_eq(&e.key, last) {
                            found = Some(pos);
                            break;
                        }
                        pos += 1;
                        cur = e.next.as_deref();
                    }
                    match found {
                        Some(pos) => pos + 1,
                        None => self.pos,
                    }
                }
            };

            if let Some((key, value)) = d.entry_at(self.table, self.bucket, target) {
                self.pos = target;
                self.last_key = Some(key.into());
                return Some((key, value));
            }

            self.bucket += 1;
            self.pos = 0;
            self.last_key = None;
        }
    }

    /// Ends iteration and unpauses migration.
    pub fn release<V, D: KeyDiscipline>(self, d: &mut Dict<V, D>) {
        if self.started {
            d.pause -= 1;
        }
    }
}

/// A raw cursor for read-only walks on hot paths. Only `next` may be called
/// between creation and [`Iter::release`]; any mutation of the dictionary in
/// that window is a bug that release detects.
pub struct Iter {
    table: usize,
    bucket: usize,
    pos: usize,
    fingerprint: u64,
    started: bool,
}

impl Iter {
    pub(crate) fn new() -> Self {
        Self {
            table: 0,
            bucket: 0,
            pos: 0,
            fingerprint: 0,
            started: false,
        }
    }

    pub fn next<'a, V, D: KeyDiscipline>(&mut self, d: &'a Dict<V, D>) -> Option<(&'a [u8], &'a V)> {
        if !self.started {
            self.started = true;
            self.fingerprint = d.fingerprint();
        }

        loop {
            if d.ht[self.table].size() == 0 || self.bucket >= d.ht[self.table].size() {
                if d.is_rehashing() && self.table == 0 {
                    self.table = 1;
                    self.bucket = 0;
                    self.pos = 0;
                    continue;
                }
                return None;
            }

            if let Some(entry) = d.entry_at(self.table, self.bucket, self.pos) {
                self.pos += 1;
                return Some(entry);
            }

            self.bucket += 1;
            self.pos = 0;
        }
    }

    /// Ends iteration. Panics if the dictionary was mutated while the
    /// iterator was live; that is a misuse of the raw iterator and the
    /// damage is not recoverable.
    pub fn release<V, D: KeyDiscipline>(self, d: &Dict<V, D>) {
        if self.started {
            assert!(
                self.fingerprint == d.fingerprint(),
                "dictionary mutated while a raw iterator was live"
            );
        }
    }
}

impl<V, D: KeyDiscipline> Dict<V, D> {
    /// A raw iterator: fast, forbids mutation while live.
    pub fn iter(&self) -> Iter {
        Iter::new()
    }

    /// A safe iterator: pauses migration, tolerates mutation between calls.
    pub fn safe_iter(&self) -> SafeIter {
        SafeIter::new()
    }
}
