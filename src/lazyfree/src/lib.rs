// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The lazy-free layer: decides at deletion time whether a value is cheap
//! enough to destroy inline or should be handed to the background free
//! queue, and owns the database structure (keyspace plus expiry table) the
//! decision applies to.
//!
//! Only values that are both expensive to destroy and uniquely owned are
//! offloaded. A shared value cannot be reclaimed by a worker because other
//! holders keep it alive, so dropping the keyspace's reference inline is
//! already O(1). An offloaded heap graph is disjoint from the live
//! keyspace by construction: the entry was unlinked from its bucket and the
//! reference count was 1.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bgtask::{Task, Workers};
use keyspace::Dict;
use log::trace;

use crate::metrics::*;

pub mod metrics;
mod object;

pub use object::{free_effort, Object};

/// A value as stored in the keyspace: shared ownership with an explicit
/// uniqueness query.
pub type Value = Arc<Object>;

/// Destroying a value with at most this many elements inline is cheaper
/// than queueing it.
pub const LAZYFREE_THRESHOLD: usize = 64;

/// Objects handed to the background free queue and not yet destroyed.
static LAZYFREE_OBJECTS: AtomicUsize = AtomicUsize::new(0);

/// Number of lazy-free objects awaiting destruction.
pub fn pending_count() -> usize {
    LAZYFREE_OBJECTS.load(Ordering::Relaxed)
}

fn credit_pending(n: usize) {
    let now = LAZYFREE_OBJECTS.fetch_add(n, Ordering::Relaxed) + n;
    LAZYFREE_PENDING.set(now as i64);
}

fn debit_pending(n: usize) {
    let now = LAZYFREE_OBJECTS.fetch_sub(n, Ordering::Relaxed) - n;
    LAZYFREE_PENDING.set(now as i64);
}

/// Applies the offload decision to an already-detached value: enqueue it
/// when destruction is expensive and the reference is unique, otherwise
/// drop it here.
pub fn free_object_async(workers: &Workers, value: Value) {
    let effort = free_effort(&value);
    if effort > LAZYFREE_THRESHOLD && Arc::strong_count(&value) == 1 {
        trace!("offloading destruction of value with effort {}", effort);
        LAZYFREE_OFFLOAD.increment();
        credit_pending(1);
        workers.submit(Task::LazyFree(Box::new(move || {
            drop(value);
            debit_pending(1);
        })));
    } else {
        LAZYFREE_INLINE.increment();
    }
}

/// A database: the keyspace table and its companion expiry table, plus the
/// worker handle deletions may offload to.
pub struct Db {
    data: Dict<Value>,
    expires: Dict<u64>,
    workers: Arc<Workers>,
}

impl Db {
    pub fn new(workers: Arc<Workers>) -> Self {
        Self {
            data: Dict::new(),
            expires: Dict::new(),
            workers,
        }
    }

    /// Stores a value under `key`, replacing any previous value.
    pub fn set(&mut self, key: &[u8], object: Object) {
        self.data.replace(key, Arc::new(object));
    }

    /// Stores a shared value under `key`.
    pub fn set_shared(&mut self, key: &[u8], value: Value) {
        self.data.replace(key, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.data.find(key)
    }

    /// Sets the expiry deadline for `key`, in milliseconds since the epoch.
    pub fn set_expire(&mut self, key: &[u8], deadline_ms: u64) {
        self.expires.replace(key, deadline_ms);
    }

    pub fn expire(&self, key: &[u8]) -> Option<u64> {
        self.expires.find(key).copied()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&mut self) -> &mut Dict<Value> {
        &mut self.data
    }

    /// Removes `key` and its expiry. The key and entry are reclaimed
    /// inline; the value goes to the background free queue when it is
    /// expensive to destroy and not shared. Returns whether the key
    /// existed.
    pub fn delete_async(&mut self, key: &[u8]) -> bool {
        // the expiry table never shares the value, only the deadline
        if !self.expires.is_empty() {
            let _ = self.expires.delete(key);
        }

        if let Some(entry) = self.data.unlink(key) {
            let (_key, value) = entry.into_parts();
            free_object_async(&self.workers, value);
            true
        } else {
            false
        }
    }

    /// Replaces both tables with fresh empty ones and queues the old pair
    /// as a single background job; the worker destroys both tables in
    /// sequence. The pending count is credited with the old keyspace's
    /// element count.
    pub fn empty_async(&mut self) {
        let old_data = std::mem::take(&mut self.data);
        let old_expires = std::mem::take(&mut self.expires);
        let count = old_data.len();

        credit_pending(count);
        self.workers.submit(Task::LazyFree(Box::new(move || {
            drop(old_data);
            drop(old_expires);
            debit_pending(count);
        })));
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }
}

common::metrics::test_no_duplicates!();

#[cfg(test)]
mod tests {
    use super::*;
    use bgtask::JobKind;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Serializes the tests that assert exact values of the process-wide
    /// pending counter.
    static COUNTER_LOCK: Mutex<()> = Mutex::new(());

    fn counter_lock() -> MutexGuard<'static, ()> {
        COUNTER_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn db() -> Db {
        Db::new(Arc::new(Workers::new()))
    }

    fn big_list(n: usize) -> Object {
        Object::list((0..n).map(|i| i.to_string().into_bytes()))
    }

    fn drain(db: &Db) {
        while db.workers().wait_step(JobKind::LazyFree) != 0 {}
    }

    #[test]
    fn delete_async_returns_whether_key_existed() {
        let mut db = db();
        db.set(b"k", Object::string(b"v"));
        assert!(db.delete_async(b"k"));
        assert!(!db.delete_async(b"k"));
        assert!(db.get(b"k").is_none());
    }

    #[test]
    fn small_aggregate_is_destroyed_inline() {
        let mut db = db();
        db.set(b"small", big_list(LAZYFREE_THRESHOLD - 1));
        assert!(db.delete_async(b"small"));
        assert_eq!(db.workers().pending(JobKind::LazyFree), 0);
    }

    #[test]
    fn threshold_sized_aggregate_is_still_inline() {
        // the rule is strictly greater than the threshold
        let mut db = db();
        db.set(b"edge", big_list(LAZYFREE_THRESHOLD));
        assert!(db.delete_async(b"edge"));
        assert_eq!(db.workers().pending(JobKind::LazyFree), 0);
    }

    #[test]
    fn large_aggregate_is_offloaded() {
        let _guard = counter_lock();
        let mut db = db();

        // stall the free queue so the offload is observable
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        db.workers().submit(Task::LazyFree(Box::new(move || {
            release_rx.recv().unwrap();
        })));

        db.set(b"big", big_list(LAZYFREE_THRESHOLD + 1));
        assert!(db.delete_async(b"big"));
        assert!(db.get(b"big").is_none());
        assert_eq!(pending_count(), 1);

        release_tx.send(()).unwrap();
        drain(&db);
        assert_eq!(pending_count(), 0);
    }

    #[test]
    fn shared_value_is_never_offloaded() {
        let mut db = db();
        let value: Value = Arc::new(big_list(1000));
        db.set_shared(b"shared", value.clone());

        assert!(db.delete_async(b"shared"));
        // our clone kept the value alive; the keyspace reference was
        // dropped inline
        assert_eq!(Arc::strong_count(&value), 1);
        assert_eq!(db.workers().pending(JobKind::LazyFree), 0);
        assert_eq!(value.len(), 1000);
    }

    #[test]
    fn delete_async_removes_the_expiry_too() {
        let mut db = db();
        db.set(b"k", Object::string(b"v"));
        db.set_expire(b"k", 12345);
        assert_eq!(db.expire(b"k"), Some(12345));

        assert!(db.delete_async(b"k"));
        assert_eq!(db.expire(b"k"), None);
    }

    #[test]
    fn empty_async_swaps_in_fresh_tables() {
        let _guard = counter_lock();
        let mut db = db();

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        db.workers().submit(Task::LazyFree(Box::new(move || {
            release_rx.recv().unwrap();
        })));

        for i in 0..100usize {
            let key = i.to_string().into_bytes();
            db.set(&key, Object::string(b"v"));
            db.set_expire(&key, i as u64);
        }

        db.empty_async();
        // the database is immediately usable and empty
        assert!(db.is_empty());
        assert_eq!(db.expire(b"1"), None);
        db.set(b"fresh", Object::string(b"v"));
        assert_eq!(db.len(), 1);

        // the old pair rides one job, credited by element count
        assert_eq!(pending_count(), 100);
        release_tx.send(()).unwrap();
        drain(&db);
        assert_eq!(pending_count(), 0);
    }

    #[test]
    fn free_object_async_applies_the_same_rule() {
        let _guard = counter_lock();
        let workers = Workers::new();

        free_object_async(&workers, Arc::new(big_list(10)));
        assert_eq!(workers.pending(JobKind::LazyFree), 0);

        free_object_async(&workers, Arc::new(big_list(1000)));
        while workers.wait_step(JobKind::LazyFree) != 0 {}
    }
}
