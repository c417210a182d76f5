// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Ties the region, header, and per-segment layout together into the raw,
//! byte-oriented engine that [`crate::CMap`] wraps with a typed facade.
//!
//! `Store` is deliberately key/value-type agnostic: every method here
//! operates on already-encoded bytes, leaving [`crate::value::Writer`] /
//! [`crate::value::Reader`] encoding to the caller. This mirrors §9's
//! design note that the core treats key and value bytes opaquely.

use crate::config::Config;
use crate::header::{Header, HEADER_SIZE};
use crate::region::Region;
use crate::segment::slot::{self, SlotArray};
use crate::segment::tier::{Tier, TIER_HDR_SIZE};
use crate::segment::{Segment, SEG_HDR_SIZE};
use crate::{hash, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// Pre-computed byte offsets of every region of the mapped file, derived
/// once from a [`Config`] at store construction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Layout {
    pub seg_hdr_off: usize,
    pub primary_tiers_off: usize,
    pub pool_cursor_off: usize,
    pub pool_tiers_off: usize,
    pub tier_stride: usize,
    pub slot_array_stride: usize,
    pub pool_count: u32,
}

impl Layout {
    pub fn compute(config: &Config) -> Self {
        let segments = config.segments as usize;
        let tier_stride = TIER_HDR_SIZE + config.tier_capacity_bytes();
        let slot_array_stride = slot::array_bytes(slot::capacity_for(config.entries_per_segment));

        let seg_hdr_off = HEADER_SIZE;
        let primary_tiers_off = seg_hdr_off + segments * SEG_HDR_SIZE;
        let pool_cursor_off = primary_tiers_off + segments * tier_stride;
        let pool_tiers_off = pool_cursor_off + 8;

        let extra_per_segment = config.max_tiers_per_segment().saturating_sub(1) as usize;
        let pool_count = (segments * extra_per_segment) as u32;

        Self {
            seg_hdr_off,
            primary_tiers_off,
            pool_cursor_off,
            pool_tiers_off,
            tier_stride,
            slot_array_stride,
            pool_count,
        }
    }

    pub fn region_size(&self) -> usize {
        self.pool_tiers_off + self.pool_count as usize * self.tier_stride
    }

    fn slot_arrays_total(&self, segments: u32) -> usize {
        segments as usize * self.slot_array_stride
    }
}

/// The raw, byte-oriented engine: a mapped region plus its header and
/// layout. Shared across every process that opens the same backing file.
pub struct Store {
    region: Region,
    header: Header,
    layout: Layout,
}

impl Store {
    pub(crate) fn from_parts(region: Region, header: Header, layout: Layout) -> Self {
        Self {
            region,
            header,
            layout,
        }
    }

    /// Creates a brand-new file-backed store. Fails if the file already
    /// exists and is non-empty.
    pub fn create_file(path: &Path, config: Config, pretouch: bool) -> Result<Self> {
        let layout = Layout::compute(&config);
        let region_size = layout.region_size() + Self::slot_arrays_region(&layout, &config);
        let mut region = Region::create_file(path, region_size, pretouch)?;

        let header = Header::new(config);
        header.write_into(region.bytes_mut())?;

        let store = Self::from_parts(region, header, layout);
        store.init_segments();
        Ok(store)
    }

    /// Opens an existing file-backed store, validating the header magic
    /// and format version.
    pub fn open_file(path: &Path) -> Result<Self> {
        let region = Region::open_file(path)?;
        let header = Header::read_from(region.bytes())?;
        let layout = Layout::compute(&header.config);
        Ok(Self::from_parts(region, header, layout))
    }

    /// Creates an anonymous, purely in-memory store private to this
    /// process.
    pub fn create_anonymous(config: Config) -> Result<Self> {
        let layout = Layout::compute(&config);
        let region_size = layout.region_size() + Self::slot_arrays_region(&layout, &config);
        let mut region = Region::anonymous(region_size, false)?;

        let header = Header::new(config);
        header.write_into(region.bytes_mut())?;

        let store = Self::from_parts(region, header, layout);
        store.init_segments();
        Ok(store)
    }

    /// Recovers a file-backed store, per §4.7. `asserted_config` selects
    /// same-configuration recovery (the header is rewritten if it fails
    /// its sanity check) versus self-describing recovery (the header is
    /// authoritative; a failing sanity check aborts with
    /// [`Error::RecoveryFailed`]).
    pub fn recover_file(path: &Path, asserted_config: Option<Config>) -> Result<Self> {
        crate::recovery::recover(path, asserted_config)
    }

    fn slot_arrays_region(layout: &Layout, config: &Config) -> usize {
        layout.slot_arrays_total(config.segments)
    }

    fn init_segments(&self) {
        for index in 0..self.segment_count() {
            self.segment(index).init();
        }
    }

    /// The store's creation-time, self-describing configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.header.config
    }

    /// The store's parsed header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Number of segments this store was created with.
    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.header.config.segments
    }

    /// A view over the segment at `index`.
    #[must_use]
    pub fn segment(&self, index: u32) -> Segment<'_> {
        Segment::new(self, index)
    }

    /// Selects and returns the segment owning `key_hash`, per §4.3.
    #[must_use]
    pub fn segment_for_key_hash(&self, key_hash: u64) -> Segment<'_> {
        self.segment(hash::segment_index(key_hash, self.segment_count()))
    }

    /// Total number of live entries across every segment.
    #[must_use]
    pub fn size(&self) -> u64 {
        (0..self.segment_count())
            .map(|i| u64::from(self.segment(i).entry_count()))
            .sum()
    }

    /// Flushes dirty pages back to the backing file (a no-op for anonymous
    /// stores).
    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    fn base(&self) -> *mut u8 {
        self.region.as_mut_ptr()
    }

    pub(crate) fn seg_hdr_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: `index < segment_count()` is a precondition of every
        // caller (enforced by `Segment::new`'s debug assertion), and the
        // region was sized to hold `segment_count() * SEG_HDR_SIZE` bytes
        // at `seg_hdr_off`.
        unsafe {
            self.base()
                .add(self.layout.seg_hdr_off + index as usize * SEG_HDR_SIZE)
        }
    }

    pub(crate) fn slot_array(&self, index: u32) -> SlotArray {
        let capacity = slot::capacity_for(self.header.config.entries_per_segment);
        let off = self.layout.region_size() + index as usize * self.layout.slot_array_stride;
        // SAFETY: the region was sized to hold `segment_count() *
        // slot_array_stride` bytes starting at `layout.region_size()`,
        // and `index < segment_count()`.
        unsafe { SlotArray::at(self.base().add(off), capacity) }
    }

    /// Builds a view over the tier at global index `global_ix`: indices
    // below `segment_count()` are primary tiers, the rest are drawn from
    /// the shared extra-tier pool.
    pub(crate) fn tier(&self, global_ix: u32) -> Tier {
        let segments = self.segment_count();
        let capacity = self.header.config.tier_capacity_bytes();
        let base = if global_ix < segments {
            // SAFETY: `global_ix < segment_count()`, within the primary
            // tier region's bounds.
            unsafe {
                self.base()
                    .add(self.layout.primary_tiers_off + global_ix as usize * self.layout.tier_stride)
            }
        } else {
            let pool_ix = global_ix - segments;
            debug_assert!(pool_ix < self.layout.pool_count);
            // SAFETY: `pool_ix < pool_count`, within the extra tier pool's
            // bounds.
            unsafe {
                self.base()
                    .add(self.layout.pool_tiers_off + pool_ix as usize * self.layout.tier_stride)
            }
        };
        // SAFETY: `base` points at `TIER_HDR_SIZE + capacity` live bytes
        // uniquely reserved for this tier index by `Layout::compute`.
        unsafe { Tier::at(base, capacity) }
    }

    fn pool_cursor(&self) -> &'static AtomicU32 {
        // SAFETY: `pool_cursor_off` is an 8-byte-aligned offset reserved
        // exclusively for this atomic by `Layout::compute`.
        unsafe { AtomicU32::from_ptr(self.base().add(self.layout.pool_cursor_off).cast()) }
    }

    /// Atomically claims and initializes the next tier from the shared
    /// extra-tier pool, or returns `None` if the pool is exhausted.
    pub(crate) fn claim_tier(&self) -> Option<u32> {
        let claimed = self.pool_cursor().fetch_add(1, Ordering::AcqRel);
        if claimed >= self.layout.pool_count {
            self.pool_cursor().fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        let global_ix = self.segment_count() + claimed;
        let tier = self.tier(global_ix);
        tier.init();
        Some(global_ix)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("segments", &self.segment_count())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_has_zero_size() {
        let config = Config::builder(16).segments(4).finish(false);
        let store = Store::create_anonymous(config).unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.segment_count(), 4);
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.cmap");
        let config = Config::builder(16).segments(2).finish(true);

        {
            let store = Store::create_file(&path, config, false).unwrap();
            assert_eq!(store.segment_count(), 2);
            store.flush().unwrap();
        }

        let reopened = Store::open_file(&path).unwrap();
        assert_eq!(reopened.config(), &config);
    }
}
