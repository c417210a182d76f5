// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A segment: the unit of concurrency and hashing. Owns one
//! [`crate::lock::SegmentLock`], one [`slot::SlotArray`], and a chain of
//! one or more [`tier::Tier`]s, all living at fixed offsets inside the
//! mapped region computed by [`crate::store::Layout`].

pub mod entry;
pub mod slot;
pub mod tier;

use crate::hash;
use crate::lock::SegmentLock;
use crate::segment::entry::EntryView;
use crate::segment::slot::{SlotArray, SlotStatus};
use crate::segment::tier::Tier;
use crate::store::Store;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Byte width of one segment's header record, as laid out by
/// [`crate::store::Layout`]: `{ lock_word: 8, entry_count: 4, tier_count: 4,
/// head_tier_ix: 4, last_holder_pid: 4, flags: 4 }`, rounded up to 32 bytes
/// so every field keeps natural alignment and the word reserved for the
/// lock leaves room for a future stamped-lock extension (see §9's note on
/// `ChronicleStampedLock`, which this crate deliberately does not attempt
/// to resurrect).
pub const SEG_HDR_SIZE: usize = 32;

const LOCK_STATE_OFF: usize = 0;
const LOCK_HOLDER_PID_OFF: usize = 20;
const LOCK_FLAGS_OFF: usize = 24;
const ENTRY_COUNT_OFF: usize = 8;
const TIER_COUNT_OFF: usize = 12;
const HEAD_TIER_IX_OFF: usize = 16;

/// Outcome of probing a segment's slot array for a key, per §4.3's
/// collision policy: linear probing, terminating on the first `Empty`
/// slot, skipping but not stopping at `Tombstone`s.
pub struct Probe {
    /// Index of the slot holding a live entry for this key, if present.
    pub found: Option<u32>,
    /// First `Empty` or `Tombstone` slot encountered, usable as an insertion
    /// point if the key is absent. `None` only when the array is entirely
    /// occupied by non-matching keys (a configuration error; the ~70% load
    /// factor target in [`slot::capacity_for`] makes this unreachable in
    /// practice).
    pub insertion_point: Option<u32>,
}

/// A view over one segment, combining its lock, slot array, and tier chain.
/// Cheap to construct: holds only a reference to the owning [`Store`] and
/// an index, every other field is computed from the store's layout.
pub struct Segment<'a> {
    store: &'a Store,
    index: u32,
}

impl<'a> Segment<'a> {
    pub(crate) fn new(store: &'a Store, index: u32) -> Self {
        debug_assert!(index < store.segment_count());
        Self { store, index }
    }

    /// This segment's index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    fn hdr_ptr(&self) -> *mut u8 {
        self.store.seg_hdr_ptr(self.index)
    }

    /// This segment's inter-process read/update/write lock.
    #[must_use]
    pub fn lock(&self) -> SegmentLock {
        let base = self.hdr_ptr();
        // SAFETY: `base` points at a live `SEG_HDR_SIZE`-byte record owned
        // by this segment for the lifetime of `self.store`; the three
        // fields are 4-byte aligned sub-offsets within it.
        unsafe {
            SegmentLock::new(
                base.add(LOCK_STATE_OFF),
                base.add(LOCK_HOLDER_PID_OFF),
                base.add(LOCK_FLAGS_OFF),
            )
        }
    }

    fn entry_count_word(&self) -> &'static AtomicU32 {
        // SAFETY: see `lock`; `entry_count` may be read by a thread holding
        // only a read lock while another concurrently holds update, so it
        // is modeled as an atomic even though every writer already holds
        // at least update.
        unsafe { AtomicU32::from_ptr(self.hdr_ptr().add(ENTRY_COUNT_OFF).cast()) }
    }

    fn tier_count_word(&self) -> &'static AtomicU32 {
        // SAFETY: see `entry_count_word`.
        unsafe { AtomicU32::from_ptr(self.hdr_ptr().add(TIER_COUNT_OFF).cast()) }
    }

    fn head_tier_ix_word(&self) -> &'static AtomicU32 {
        // SAFETY: see `entry_count_word`.
        unsafe { AtomicU32::from_ptr(self.hdr_ptr().add(HEAD_TIER_IX_OFF).cast()) }
    }

    /// Number of live entries in this segment, per §3's invariant that this
    /// equals both the occupied slot count and the live tier-chain entry
    /// count.
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entry_count_word().load(Ordering::Acquire)
    }

    /// Number of tiers (primary plus any chained extras) this segment holds.
    #[must_use]
    pub fn tier_count(&self) -> u32 {
        self.tier_count_word().load(Ordering::Acquire)
    }

    /// Global tier index at the head of this segment's chain, i.e. the
    /// tier new entries are allocated into.
    #[must_use]
    pub fn head_tier_ix(&self) -> u32 {
        self.head_tier_ix_word().load(Ordering::Acquire)
    }

    fn slots(&self) -> SlotArray {
        self.store.slot_array(self.index)
    }

    /// Initializes a freshly created segment: zeroes its entry/tier
    /// counters, points its head tier at its own primary tier, and inits
    /// that primary tier's header.
    pub(crate) fn init(&self) {
        self.entry_count_word().store(0, Ordering::Relaxed);
        self.tier_count_word().store(1, Ordering::Relaxed);
        self.head_tier_ix_word().store(self.index, Ordering::Relaxed);
        self.store.tier(self.index).init();
    }

    fn entry_view(&self, tier_index: u32, entry_offset: u32) -> EntryView {
        let tier = self.store.tier(tier_index);
        let checksum_entries = self.store.config().checksum_entries;
        // SAFETY: `tier_index`/`entry_offset` were read from a slot that
        // was published (or just republished by recovery) with a matching
        // acquire load, so the entry bytes they point at are visible here.
        unsafe { entry::read_live(tier.span_ptr(u64::from(entry_offset)), checksum_entries) }
    }

    /// Probes this segment's slot array for `key`, per §4.3.
    #[must_use]
    pub fn probe(&self, key: &[u8], fingerprint: u32, slot_hint: u32) -> Probe {
        let slots = self.slots();
        let capacity = slots.capacity();
        let mask = capacity - 1;
        let mut index = slot_hint & mask;
        let mut insertion_point = None;

        for _ in 0..capacity {
            let view = slots.load(index);
            match view.status {
                SlotStatus::Empty => {
                    return Probe {
                        found: None,
                        insertion_point: insertion_point.or(Some(index)),
                    };
                }
                SlotStatus::Tombstone => {
                    if insertion_point.is_none() {
                        insertion_point = Some(index);
                    }
                }
                SlotStatus::Occupied => {
                    if view.fingerprint == fingerprint {
                        let entry = self.entry_view(view.tier_index, view.entry_offset);
                        // SAFETY: segment lock held at at least read level
                        // by the caller, per this type's documented usage.
                        if unsafe { entry.key() } == key {
                            return Probe {
                                found: Some(index),
                                insertion_point: None,
                            };
                        }
                    }
                }
            }
            index = (index + 1) & mask;
        }

        Probe {
            found: None,
            insertion_point,
        }
    }

    /// Reads the live entry at `slot_index`, which must currently be
    /// `Occupied` (as returned by [`Segment::probe`]'s `found`).
    ///
    /// # Safety
    ///
    /// The caller must hold at least this segment's read lock for the
    /// lifetime of the returned view's borrowed bytes.
    #[must_use]
    pub unsafe fn entry_at(&self, slot_index: u32) -> EntryView {
        let view = self.slots().load(slot_index);
        self.entry_view(view.tier_index, view.entry_offset)
    }

    /// Raw span pointer for the entry currently referenced by
    /// `slot_index`, for a raw in-place value mutation followed by
    /// [`crate::segment::entry::recompute_checksum`] (§4.6's
    /// `updateChecksum`).
    ///
    /// # Safety
    ///
    /// The caller must hold at least this segment's update lock, and
    /// `slot_index` must currently be `Occupied`.
    #[must_use]
    pub unsafe fn entry_span_ptr(&self, slot_index: u32) -> *mut u8 {
        let view = self.slots().load(slot_index);
        self.store.tier(view.tier_index).span_ptr(u64::from(view.entry_offset))
    }

    fn max_tiers(&self) -> u32 {
        self.store.config().max_tiers_per_segment()
    }

    /// Reserves `span` bytes for a new entry, chaining a fresh tier onto
    /// this segment if the current head tier cannot fit it and the bloat
    /// limit allows it.
    fn reserve(&self, span: usize) -> Result<(u32, u64)> {
        loop {
            let head = self.head_tier_ix();
            let tier = self.store.tier(head);
            if let Some(offset) = tier.try_alloc(span) {
                return Ok((head, offset));
            }

            if self.tier_count() >= self.max_tiers() {
                return Err(Error::CapacityExhausted);
            }

            let new_tier_ix = self.store.claim_tier().ok_or(Error::CapacityExhausted)?;
            let new_tier = self.store.tier(new_tier_ix);
            new_tier.set_prev_tier_ix(Some(head));
            self.head_tier_ix_word().store(new_tier_ix, Ordering::Release);
            self.tier_count_word().fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Allocates and publishes a brand-new entry, per §4.5's `insert`
    /// contract: entry bytes (and checksum) are written fully before the
    /// slot is published with release ordering.
    ///
    /// Requires the caller to already hold this segment's update or write
    /// lock.
    pub fn insert_entry(
        &self,
        slot_index: u32,
        fingerprint: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let checksum_entries = self.store.config().checksum_entries;
        let span = entry::span_len(key.len(), value.len(), checksum_entries);
        let (tier_ix, offset) = self.reserve(span)?;

        let tier = self.store.tier(tier_ix);
        // SAFETY: `reserve` returned a freshly allocated span of exactly
        // `span` bytes, exclusive to this write until the slot below is
        // published.
        unsafe {
            entry::write_live(tier.span_ptr(offset), span, key, value, checksum_entries);
        }

        #[allow(clippy::cast_possible_truncation)]
        self.slots()
            .publish_occupied(slot_index, fingerprint, tier_ix, offset as u32);
        self.entry_count_word().fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Overwrites or replaces the value at an already-occupied slot, per
    /// §3's update-in-place / update-replace distinction. Requires the
    /// caller to hold this segment's update or write lock.
    pub fn replace_value(&self, slot_index: u32, fingerprint: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let checksum_entries = self.store.config().checksum_entries;
        let view = self.slots().load(slot_index);
        let old_entry = self.entry_view(view.tier_index, view.entry_offset);

        // SAFETY: segment update/write lock held by the caller.
        let old_value_len = unsafe { old_entry.value() }.len();

        if old_value_len == value.len() {
            let tier = self.store.tier(view.tier_index);
            // SAFETY: `old_entry`'s value region is exactly `value.len()`
            // bytes and is exclusive to this write under the held lock.
            unsafe {
                let value_ptr = old_entry_value_ptr(&old_entry) as *mut u8;
                std::ptr::copy_nonoverlapping(value.as_ptr(), value_ptr, value.len());
                if checksum_entries {
                    entry::recompute_checksum(tier.span_ptr(u64::from(view.entry_offset)));
                }
            }
            return Ok(());
        }

        let span = entry::span_len(key.len(), value.len(), checksum_entries);
        let (new_tier_ix, new_offset) = self.reserve(span)?;
        let new_tier = self.store.tier(new_tier_ix);
        // SAFETY: freshly reserved span, exclusive until published below.
        unsafe {
            entry::write_live(new_tier.span_ptr(new_offset), span, key, value, checksum_entries);
        }

        #[allow(clippy::cast_possible_truncation)]
        self.slots()
            .publish_occupied(slot_index, fingerprint, new_tier_ix, new_offset as u32);

        let old_tier = self.store.tier(view.tier_index);
        old_tier.free(u64::from(view.entry_offset), old_entry.span());
        Ok(())
    }

    /// Tombstones a slot and reclaims its entry's tier span. Requires the
    /// caller to hold this segment's update or write lock.
    pub fn remove_slot(&self, slot_index: u32) {
        let view = self.slots().load(slot_index);
        let entry = self.entry_view(view.tier_index, view.entry_offset);
        self.slots().tombstone(slot_index);
        self.store
            .tier(view.tier_index)
            .free(u64::from(view.entry_offset), entry.span());
        self.entry_count_word().fetch_sub(1, Ordering::AcqRel);
    }

    /// Iterates every occupied slot in this segment, calling `visitor`
    /// with the live key/value bytes. Per §4.8, the caller must already
    /// hold at least this segment's read lock for the duration.
    ///
    /// Returns `false` (stopping early) if `visitor` does.
    pub fn for_each_occupied(&self, mut visitor: impl FnMut(&[u8], &[u8]) -> bool) -> bool {
        let slots = self.slots();
        for index in 0..slots.capacity() {
            let view = slots.load(index);
            if view.status != SlotStatus::Occupied {
                continue;
            }
            let entry = self.entry_view(view.tier_index, view.entry_offset);
            // SAFETY: read lock held by the caller for the duration of
            // this call, per the documented contract.
            let (key, value) = unsafe { (entry.key(), entry.value()) };
            if !visitor(key, value) {
                return false;
            }
        }
        true
    }

    /// Resets this segment's slot array to entirely `Empty`. Only
    /// [`crate::recovery`] calls this, under the segment's write lock.
    pub(crate) fn reset_slots(&self) {
        let slots = self.slots();
        for index in 0..slots.capacity() {
            slots.clear(index);
        }
    }

    /// Re-publishes a slot for `key` during recovery's tier walk, probing
    /// for a free slot the same way a fresh insert would.
    ///
    /// The tier chain may legitimately contain more than one live-tagged
    /// span for the same key (e.g. a crash between `publish_occupied` and
    /// the old span's `free()` in [`Segment::replace_value`]'s
    /// different-size path leaves both the superseded and the new span
    /// live-tagged). Recovery walks the chain oldest-tier-first, so the
    /// first span for a given key wins the slot; returns `false` without
    /// publishing anything if `key` already has an occupied slot from an
    /// earlier-processed span, so the caller can free this span's bytes
    /// instead of counting it as live.
    ///
    /// # Safety
    ///
    /// The caller must hold this segment's write lock.
    pub(crate) fn republish(&self, key: &[u8], tier_index: u32, entry_offset: u32) -> bool {
        let key_hash = hash::hash64(key);
        let fingerprint = hash::fingerprint(key);
        let probe = self.probe(key, fingerprint, hash::slot_hint(key_hash, self.slots().capacity()));
        match probe.insertion_point {
            Some(index) => {
                self.slots().publish_occupied(index, fingerprint, tier_index, entry_offset);
                true
            }
            None => false,
        }
    }

    /// Sets this segment's entry counter directly. Only
    /// [`crate::recovery`] calls this, after re-counting live entries.
    pub(crate) fn set_entry_count(&self, count: u32) {
        self.entry_count_word().store(count, Ordering::Release);
    }

    /// Walks this segment's tier chain from the head backward (newest to
    /// oldest, per [`tier::Tier::prev_tier_ix`]), yielding each tier's
    /// global index. Used by [`crate::recovery`].
    pub(crate) fn tier_chain(&self) -> Vec<u32> {
        let mut chain = Vec::with_capacity(self.tier_count() as usize);
        let mut current = Some(self.head_tier_ix());
        while let Some(ix) = current {
            chain.push(ix);
            current = self.store.tier(ix).prev_tier_ix();
        }
        chain
    }
}

/// Byte offset helper shared by `replace_value`'s in-place path: recovers
/// a mutable pointer to an already-decoded entry's value bytes.
///
/// # Safety
///
/// The caller must hold at least this segment's update lock, and `entry`
/// must have been decoded from bytes still live in the mapped region.
unsafe fn old_entry_value_ptr(entry: &EntryView) -> *const u8 {
    entry.value().as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Store;

    fn test_store(segments: u32, entries_per_segment: u32) -> Store {
        let config = Config::builder(entries_per_segment)
            .segments(segments)
            .checksum_entries(true)
            .finish(false);
        Store::create_anonymous(config).unwrap()
    }

    #[test]
    fn insert_then_probe_finds_key() {
        let store = test_store(1, 8);
        let segment = store.segment(0);
        let key = b"hello";
        let value = b"world";
        let fp = hash::fingerprint(key);
        let hint = hash::slot_hint(hash::hash64(key), 64);

        let probe = segment.probe(key, fp, hint);
        let slot_index = probe.insertion_point.unwrap();
        segment.insert_entry(slot_index, fp, key, value).unwrap();

        let probe = segment.probe(key, fp, hint);
        assert_eq!(probe.found, Some(slot_index));
        // SAFETY: test holds no concurrent mutator.
        let entry = unsafe { segment.entry_at(slot_index) };
        // SAFETY: same as above.
        unsafe {
            assert_eq!(entry.key(), key);
            assert_eq!(entry.value(), value);
        }
        assert_eq!(segment.entry_count(), 1);
    }

    #[test]
    fn remove_then_reinsert_reuses_space() {
        let store = test_store(1, 8);
        let segment = store.segment(0);
        let key = b"k";
        let fp = hash::fingerprint(key);
        let hint = hash::slot_hint(hash::hash64(key), 64);

        let probe = segment.probe(key, fp, hint);
        let slot_index = probe.insertion_point.unwrap();
        segment.insert_entry(slot_index, fp, key, b"v1").unwrap();
        assert_eq!(segment.entry_count(), 1);

        segment.remove_slot(slot_index);
        assert_eq!(segment.entry_count(), 0);

        let probe = segment.probe(key, fp, hint);
        assert_eq!(probe.found, None);
    }

    #[test]
    fn republish_fails_once_the_key_already_has_an_occupied_slot() {
        let store = test_store(1, 8);
        let segment = store.segment(0);
        let key = b"k";

        assert!(segment.republish(key, 0, 0));

        let fp = hash::fingerprint(key);
        let hint = hash::slot_hint(hash::hash64(key), 64);
        assert!(segment.probe(key, fp, hint).found.is_some());

        // A second span for the same key (e.g. the shadowed duplicate left
        // behind by a crash mid-`replace_value`) finds the slot already
        // occupied; `republish` must report that instead of silently
        // no-oping, so the caller knows to free the span itself.
        assert!(!segment.republish(key, 0, 64));
    }

    #[test]
    fn capacity_exhausted_when_bloat_limit_reached() {
        let config = Config::builder(2)
            .segments(1)
            .constant_key_size(4)
            .constant_value_size(4)
            .max_bloat_factor(1.0)
            .finish(false);
        let store = Store::create_anonymous(config).unwrap();
        let segment = store.segment(0);

        for i in 0..2u32 {
            let key = i.to_be_bytes();
            let fp = hash::fingerprint(&key);
            let hint = hash::slot_hint(hash::hash64(&key), store.slot_array(0).capacity());
            let probe = segment.probe(&key, fp, hint);
            segment
                .insert_entry(probe.insertion_point.unwrap(), fp, &key, &[9, 9, 9, 9])
                .unwrap();
        }

        let key = 99u32.to_be_bytes();
        let fp = hash::fingerprint(&key);
        let hint = hash::slot_hint(hash::hash64(&key), store.slot_array(0).capacity());
        let probe = segment.probe(&key, fp, hint);
        let err = segment
            .insert_entry(probe.insertion_point.unwrap(), fp, &key, &[1, 2, 3, 4])
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted));
    }
}
