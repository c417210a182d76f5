// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-segment iteration, per §4.8: segments are visited in index order,
//! each one's read lock held only for the duration of its own scan.
//!
//! The visitor must not attempt to acquire a second lock on the same or a
//! higher-indexed segment; doing so risks deadlock with a concurrent
//! iterator or multi-segment operation walking segments in the documented
//! lowest-index-first order.

use crate::store::Store;

/// Visits every live `(key, value)` pair across every segment, in segment
/// index order. Each segment's read lock is held only while that
/// segment's entries are visited.
///
/// A concurrent writer inserting into a segment not yet visited may or
/// may not have its new entries observed; no entry present at the start
/// of its segment's scan is ever skipped or duplicated.
pub fn for_each_entry(store: &Store, mut visitor: impl FnMut(&[u8], &[u8])) {
    for_each_entry_while(store, |k, v| {
        visitor(k, v);
        true
    });
}

/// Like [`for_each_entry`], but the visitor may return `false` to stop the
/// walk early (including skipping any later segments).
pub fn for_each_entry_while(store: &Store, mut visitor: impl FnMut(&[u8], &[u8]) -> bool) {
    for index in 0..store.segment_count() {
        let segment = store.segment(index);
        segment.lock().read();
        let keep_going = segment.for_each_occupied(&mut visitor);
        segment.lock().release_read();
        if !keep_going {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hash;
    use crate::store::Store;

    fn populated_store(segments: u32, count: u32) -> Store {
        let config = Config::builder(64).segments(segments).finish(false);
        let store = Store::create_anonymous(config).unwrap();

        for i in 0..count {
            let key = i.to_be_bytes();
            let key_hash = hash::hash64(&key);
            let seg = store.segment_for_key_hash(key_hash);
            let fp = hash::fingerprint(&key);
            let hint = hash::slot_hint(key_hash, store.slot_array(seg.index()).capacity());
            let probe = seg.probe(&key, fp, hint);
            seg.insert_entry(probe.insertion_point.unwrap(), fp, &key, b"v").unwrap();
        }

        store
    }

    #[test]
    fn visits_every_entry_exactly_once() {
        let store = populated_store(4, 50);
        let mut seen = std::collections::HashSet::new();

        for_each_entry(&store, |k, _v| {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(k);
            assert!(seen.insert(u32::from_be_bytes(arr)), "entry visited twice");
        });

        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn early_exit_stops_remaining_segments() {
        let store = populated_store(4, 50);
        let mut visited = 0;

        for_each_entry_while(&store, |_k, _v| {
            visited += 1;
            visited < 5
        });

        assert_eq!(visited, 5);
    }
}
