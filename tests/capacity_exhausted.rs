// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! S2: a segment whose tier chain cannot grow any further refuses new
//! inserts with `CapacityExhausted` while leaving every entry already
//! present retrievable.

use cmap::{Config, Error};

#[test]
fn capacity_exhausted_leaves_existing_entries_retrievable() {
    let config = Config::builder(2)
        .segments(1)
        .constant_key_size(4)
        .constant_value_size(4)
        .max_bloat_factor(1.0)
        .finish(false);
    let map: cmap::CMap<[u8; 4], [u8; 4]> = cmap::CMap::create_anonymous(config).unwrap();

    map.put(&0u32.to_be_bytes(), &[1, 1, 1, 1]).unwrap();
    map.put(&1u32.to_be_bytes(), &[2, 2, 2, 2]).unwrap();
    let err = map.put(&2u32.to_be_bytes(), &[3, 3, 3, 3]).unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted));

    assert_eq!(map.get(&0u32.to_be_bytes()).unwrap(), Some([1, 1, 1, 1]));
    assert_eq!(map.get(&1u32.to_be_bytes()).unwrap(), Some([2, 2, 2, 2]));
    assert_eq!(map.size(), 2);
}

#[test]
fn a_bloat_factor_above_one_lets_a_segment_grow_past_its_primary_tier() {
    let config = Config::builder(1)
        .segments(1)
        .constant_key_size(4)
        .constant_value_size(4)
        .max_bloat_factor(3.0)
        .finish(false);
    let map: cmap::CMap<[u8; 4], [u8; 4]> = cmap::CMap::create_anonymous(config).unwrap();

    for i in 0..3u32 {
        map.put(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
    }
    assert_eq!(map.size(), 3);

    let err = map.put(&3u32.to_be_bytes(), &3u32.to_be_bytes()).unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted));
}
