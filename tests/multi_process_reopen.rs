// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! S3: two processes sharing one file-backed store never lose a write.
//! "Process A" and "Process B" are approximated here by sequential
//! open/close cycles against the same backing path, since spawning real
//! child processes around a private test binary would add nothing beyond
//! exercising the exact close-then-reopen boundary this scenario cares
//! about.

use cmap::{CMap, Config};

#[test]
fn a_writes_b_reads_and_overwrites_a_reads_the_latest_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.cmap");
    let config = Config::builder(16).segments(1).finish(true);

    // "Process A" creates the store and writes the first version.
    {
        let map: CMap<String, String> = CMap::create_file(&path, config).unwrap();
        map.put(&"k".to_string(), &"v1".to_string()).unwrap();
        map.flush().unwrap();
    }

    // "Process B" opens the same file, observes A's write, and overwrites it.
    {
        let map: CMap<String, String> = CMap::open_file(&path).unwrap();
        assert_eq!(map.get(&"k".to_string()).unwrap(), Some("v1".to_string()));
        map.put(&"k".to_string(), &"v2".to_string()).unwrap();
        map.flush().unwrap();
    }

    // "Process A" reopens and observes B's write.
    let map: CMap<String, String> = CMap::open_file(&path).unwrap();
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("v2".to_string()));
}

#[test]
fn entries_written_by_one_opener_are_visible_to_a_fresh_opener_without_a_flush_in_between() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3_no_flush.cmap");
    let config = Config::builder(64).segments(4).finish(true);

    let map_a: CMap<u32, u32> = CMap::create_file(&path, config).unwrap();
    for i in 0..10u32 {
        map_a.put(&i, &(i * 7)).unwrap();
    }

    // A second handle onto the same backing file, opened while `map_a` is
    // still alive, stands in for a second process mapping the same file;
    // both map the same pages, so no flush is required to observe writes.
    let map_b: CMap<u32, u32> = CMap::open_file(&path).unwrap();
    for i in 0..10u32 {
        assert_eq!(map_b.get(&i).unwrap(), Some(i * 7));
    }
}
