// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! S6: a full walk via `for_each_entry` never skips or duplicates an
//! entry that was already live when its segment's scan began, even while
//! a concurrent writer is inserting brand-new keys into other segments.

use cmap::{CMap, Config};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn iterating_while_a_concurrent_writer_inserts_new_keys_is_stable() {
    let config = Config::builder(256).segments(8).finish(false);
    let map: Arc<CMap<u32, u32>> = Arc::new(CMap::create_anonymous(config).unwrap());

    for i in 0..1_000u32 {
        map.put(&i, &(i * 2)).unwrap();
    }

    let writer_map = Arc::clone(&map);
    let writer = std::thread::spawn(move || {
        for i in 1_000..1_100u32 {
            writer_map.put(&i, &(i * 2)).unwrap();
        }
    });

    let mut seen = HashSet::new();
    map.for_each_entry(|k, v| {
        assert_eq!(v, k * 2);
        assert!(seen.insert(k), "entry {k} visited twice");
    });

    writer.join().unwrap();

    for i in 0..1_000u32 {
        assert!(seen.contains(&i), "entry {i} present at scan start must be visited");
    }
}

#[test]
fn early_exit_from_for_each_entry_while_stops_scanning_later_segments() {
    let config = Config::builder(64).segments(4).finish(false);
    let map: CMap<u32, u32> = CMap::create_anonymous(config).unwrap();

    for i in 0..50u32 {
        map.put(&i, &i).unwrap();
    }

    let mut visited = 0u32;
    map.for_each_entry_while(|_k, _v| {
        visited += 1;
        visited < 5
    });

    assert_eq!(visited, 5);
}
