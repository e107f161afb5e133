// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end scan guarantees: every key present for the whole scan is
//! reported at least once, no matter how the table is resized or mutated
//! between scan calls.

use std::collections::HashSet;

use keyspace::Dict;

fn key(i: usize) -> Vec<u8> {
    i.to_string().into_bytes()
}

#[test]
fn scan_survives_interleaved_deletes_and_inserts() {
    let mut d: Dict<u64> = Dict::new();
    for i in 0..1000 {
        d.add(&key(i), i as u64).unwrap();
    }

    let mut seen = HashSet::new();
    let mut cursor = d.scan(0, |k, _| {
        seen.insert(k.to_vec());
    });

    // churn half the keyspace away and grow it back elsewhere
    for i in 0..500 {
        d.delete(&key(i)).unwrap();
    }
    for i in 1000..1500 {
        d.add(&key(i), i as u64).unwrap();
    }

    while cursor != 0 {
        cursor = d.scan(cursor, |k, _| {
            seen.insert(k.to_vec());
        });
    }

    // keys 500..999 were present before, during, and after the churn
    for i in 500..1000 {
        assert!(seen.contains(&key(i)), "key {} never reported", i);
    }
}

#[test]
fn scan_survives_grow_then_shrink() {
    let mut d: Dict<u64> = Dict::new();
    for i in 0..64 {
        d.add(&key(i), 0).unwrap();
    }
    while d.rehash(100) {}

    let stable: Vec<Vec<u8>> = (0..64).map(key).collect();
    let mut seen = HashSet::new();

    let mut cursor = d.scan(0, |k, _| {
        seen.insert(k.to_vec());
    });

    // grow by an order of magnitude
    for i in 1000..3000 {
        d.add(&key(i), 0).unwrap();
    }
    for _ in 0..4 {
        cursor = d.scan(cursor, |k, _| {
            seen.insert(k.to_vec());
        });
        if cursor == 0 {
            break;
        }
    }

    // now shrink back down
    for i in 1000..3000 {
        d.delete(&key(i)).unwrap();
    }
    while d.rehash(100) {}
    d.shrink().unwrap();

    while cursor != 0 {
        cursor = d.scan(cursor, |k, _| {
            seen.insert(k.to_vec());
        });
    }

    for k in &stable {
        assert!(seen.contains(k));
    }
}

#[test]
fn incremental_rehash_amortizes_inserts() {
    // a mass insert leaves the table mid-migration; any single mutating
    // operation performs at most one bucket of migration work
    let mut d: Dict<u64> = Dict::new();
    for i in 0..100_000 {
        d.add(&key(i), i as u64).unwrap();
    }

    // the table kept up: every key is reachable whichever table it is in
    for i in (0..100_000).step_by(997) {
        assert_eq!(d.find(&key(i)), Some(&(i as u64)));
    }

    // finish any in-flight migration within a bounded number of batches
    let mut batches = 0;
    while d.rehash(100) {
        batches += 1;
        assert!(batches < 100_000);
    }
    assert_eq!(d.len(), 100_000);
}
