// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The recovery procedure, per §4.7: a full exclusive scan of every
//! segment that rebuilds slot arrays from entry payloads and discards
//! entries whose checksum (or segment placement) no longer checks out.
//!
//! Concurrent access to the region during recovery is undefined; the
//! caller is responsible for holding it exclusively (e.g. being the only
//! process with the file open).

use crate::config::Config;
use crate::header::Header;
use crate::region::Region;
use crate::segment::entry;
use crate::store::{Layout, Store};
use crate::{hash, Error, Result};
use std::path::Path;

/// Runs recovery on the file at `path`.
///
/// `asserted_config` selects the mode: `Some(config)` is
/// same-configuration recovery (§4.7 mode 1): the caller asserts `config`
/// matches how the region was created, and the header is rewritten from
/// it if the on-disk header fails its sanity check. `None` is
/// self-describing recovery (mode 2): the on-disk header is authoritative,
/// and a failing sanity check aborts with [`Error::RecoveryFailed`].
pub fn recover(path: &Path, asserted_config: Option<Config>) -> Result<Store> {
    let mut region = Region::open_file(path)?;

    let header = match asserted_config {
        Some(config) => match Header::read_from(region.bytes()) {
            Ok(existing) if existing.config.sanity_check() => existing,
            _ => Header::rewrite(region.bytes_mut(), config)?,
        },
        None => {
            let header = Header::read_from(region.bytes()).map_err(|_| Error::RecoveryFailed)?;
            if !header.config.sanity_check() {
                return Err(Error::RecoveryFailed);
            }
            header
        }
    };

    let layout = Layout::compute(&header.config);
    let store = Store::from_parts(region, header, layout);
    scan_and_repair(&store);
    Ok(store)
}

/// Runs recovery directly against an already-open [`Store`], e.g. right
/// after [`Store::open_file`] detected `Poisoned` segments. Exposed for
/// callers that already hold the region open and want to repair it
/// in place rather than reopening by path.
pub fn scan_and_repair(store: &Store) {
    for index in 0..store.segment_count() {
        let segment = store.segment(index);
        segment.lock().write();

        segment.reset_slots();

        let mut live_count = 0u32;
        for tier_ix in segment.tier_chain() {
            let tier = store.tier(tier_ix);
            let mut offset = 0u64;

            while offset < tier.cursor() {
                let ptr = tier.span_ptr(offset);
                // SAFETY: `offset` walks sequentially from 0 within
                // `[0, tier.cursor())`, which only ever contains spans
                // written by `write_live`/`write_dead`, each self-
                // describing its own length via the common header.
                let span = unsafe { entry::span_len_at(ptr) };

                // SAFETY: see above.
                if unsafe { entry::is_live(ptr) } {
                    // SAFETY: the tag byte confirms this span is live.
                    let view = unsafe { entry::read_live(ptr, store.config().checksum_entries) };
                    // SAFETY: segment write lock held for the duration of
                    // this scan.
                    let (key, value) = unsafe { (view.key(), view.value()) };

                    let belongs_here = hash::segment_index(hash::hash64(key), store.segment_count()) == index;
                    let checksum_ok = match view.stored_checksum() {
                        Some(stored) => stored == hash::checksum32(key, value),
                        None => !store.config().checksum_entries,
                    };

                    let published = belongs_here && checksum_ok && segment.republish(key, tier_ix, offset as u32);

                    if published {
                        live_count += 1;
                    } else {
                        // Not republished: either `belongs_here`/`checksum_ok`
                        // failed, or an earlier-processed span already holds
                        // the occupied slot for this key (e.g. a crash
                        // between `publish_occupied` and the old span's
                        // `free()` during a different-size `replace_value`
                        // can leave two live-tagged spans for the same key).
                        // No slot references this span after `reset_slots`;
                        // hand it back to the tier's free list so its bytes
                        // become reclaimable.
                        tier.free(offset, span as usize);
                    }
                }

                offset += u64::from(span);
            }
        }

        segment.set_entry_count(live_count);
        segment.lock().clear_poison();
        segment.lock().release_write();
    }
}
