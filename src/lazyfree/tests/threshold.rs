// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The offload boundary, end to end. Kept in its own binary so the
//! process-wide pending counter is not shared with other tests.

use std::sync::Arc;

use bgtask::{JobKind, Workers};
use lazyfree::{pending_count, Db, Object, LAZYFREE_THRESHOLD};

fn key(i: usize) -> Vec<u8> {
    format!("key:{}", i).into_bytes()
}

#[test]
fn offload_decision_matches_the_threshold_exactly() {
    let workers = Arc::new(Workers::new());
    let mut db = Db::new(workers.clone());

    db.set(b"at", Object::list((0..LAZYFREE_THRESHOLD).map(key)));
    db.set(b"above", Object::list((0..LAZYFREE_THRESHOLD + 1).map(key)));

    assert!(db.delete_async(b"at"));
    assert_eq!(workers.pending(JobKind::LazyFree), 0);

    assert!(db.delete_async(b"above"));
    while workers.wait_step(JobKind::LazyFree) != 0 {}
    assert_eq!(pending_count(), 0);
}
