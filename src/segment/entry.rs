// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Physical encoding of one entry span inside a [`crate::segment::tier::Tier`].
//!
//! Every span the allocator hands out starts with a 5-byte header —
//! `tag(1) || span_len(u32 LE)` — absent from the logical entry record
//! described in §6 but required so recovery's sequential tier walk can
//! always skip to the next span without first decoding the current one:
//! `key_size` alone cannot serve that purpose, since a continuation-bit
//! byte is indistinguishable from a legitimately large in-progress
//! `key_size` varint, and a live entry may be padded past its logical
//! content to [`MIN_ENTRY_SPAN`].
//!
//! - Live span: `tag(1=live) || span_len(u32 LE) || key_size(varint) ||
//!   key_bytes || value_size(varint) || value_bytes || [checksum(4)]`
//! - Dead span: `tag(0=dead) || span_len(u32 LE) || next_free_offset(u64 LE)`
//!
//! Every span is at least [`MIN_ENTRY_SPAN`] bytes so that any live entry,
//! however small, can always later be overwritten with a dead span when it
//! is freed.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Seek, SeekFrom, Write};
use varint_rs::{VarintReader, VarintWriter};

const LIVE_TAG: u8 = 1;
const DEAD_TAG: u8 = 0;

/// Byte length of the tag + span_len header common to every span.
pub const HEADER_LEN: usize = 5;

/// Smallest span the allocator ever hands out; large enough to later hold
/// a dead-span header (`tag` + `span_len` + `next_free_offset`).
pub const MIN_ENTRY_SPAN: usize = HEADER_LEN + 8;

/// Bytes needed to varint-encode `v` (LEB128: 7 value bits per byte).
#[must_use]
pub fn varint_len_u32(v: u32) -> usize {
    let mut v = v;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Logical content length of an entry: everything after the common header.
#[must_use]
pub fn content_len(key_len: usize, value_len: usize, checksum_entries: bool) -> usize {
    varint_len_u32(key_len as u32)
        + key_len
        + varint_len_u32(value_len as u32)
        + value_len
        + usize::from(checksum_entries) * 4
}

/// Total span the allocator must reserve for an entry with the given key
/// and value lengths, including the common header and any padding up to
/// [`MIN_ENTRY_SPAN`].
#[must_use]
pub fn span_len(key_len: usize, value_len: usize, checksum_entries: bool) -> usize {
    (HEADER_LEN + content_len(key_len, value_len, checksum_entries)).max(MIN_ENTRY_SPAN)
}

/// Reads the tag byte of a span without interpreting the rest.
///
/// # Safety
///
/// `ptr` must point at a live byte.
#[must_use]
pub unsafe fn tag_at(ptr: *const u8) -> u8 {
    *ptr
}

/// Whether the span at `ptr` is a live entry, as opposed to a dead
/// (reclaimed) span. Used by a sequential tier walk (recovery) that must
/// decide how to interpret a span before reading further.
///
/// # Safety
///
/// `ptr` must point at a live byte.
#[must_use]
pub unsafe fn is_live(ptr: *const u8) -> bool {
    tag_at(ptr) == LIVE_TAG
}

/// Reads a span's total length from its common header, without caring
/// whether it is live or dead.
///
/// # Safety
///
/// `ptr` must point at a span written by [`write_live`] or [`write_dead`],
/// valid for reads of [`HEADER_LEN`] bytes.
#[must_use]
pub unsafe fn span_len_at(ptr: *const u8) -> u32 {
    let buf = std::slice::from_raw_parts(ptr, HEADER_LEN);
    u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes"))
}

/// A decoded view over a live entry's key and value bytes, borrowing
/// directly from the mapped region.
#[derive(Clone, Copy)]
pub struct EntryView {
    key_ptr: *const u8,
    key_len: usize,
    value_ptr: *const u8,
    value_len: usize,
    checksum: Option<u32>,
    span: usize,
}

impl EntryView {
    /// Key bytes, borrowed from the mapped region for the lifetime `'a`
    /// the caller asserts via the enclosing query context's lock hold.
    ///
    /// # Safety
    ///
    /// The segment's lock must still be held (at least at read level) for
    /// the duration `'a`.
    #[must_use]
    pub unsafe fn key<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.key_ptr, self.key_len)
    }

    /// Value bytes; same safety requirement as [`EntryView::key`].
    #[must_use]
    pub unsafe fn value<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.value_ptr, self.value_len)
    }

    /// The entry's stored checksum, if `checksum_entries` was enabled.
    #[must_use]
    pub fn stored_checksum(&self) -> Option<u32> {
        self.checksum
    }

    /// Total span this entry occupies in its tier, including header and
    /// any trailing padding; what [`crate::segment::tier::Tier::free`]
    /// needs to reclaim it.
    #[must_use]
    pub fn span(&self) -> usize {
        self.span
    }
}

/// Writes a live entry into `ptr`, which must point at a span of exactly
/// `span` bytes (as returned by [`span_len`]).
///
/// # Safety
///
/// `ptr` must be valid for writes of `span` bytes, and the caller must hold
/// at least the segment's update lock.
pub unsafe fn write_live(ptr: *mut u8, span: usize, key: &[u8], value: &[u8], checksum_entries: bool) {
    let content = content_len(key.len(), value.len(), checksum_entries);
    debug_assert!(HEADER_LEN + content <= span, "span too small for entry content");

    let buf = std::slice::from_raw_parts_mut(ptr, HEADER_LEN + content);
    buf[0] = LIVE_TAG;
    buf[1..5].copy_from_slice(&(span as u32).to_le_bytes());

    let mut w = &mut buf[HEADER_LEN..];
    w.write_u32_varint(key.len() as u32).expect("writes into an in-memory slice cannot fail");
    w.write_all(key).expect("writes into an in-memory slice cannot fail");
    w.write_u32_varint(value.len() as u32).expect("writes into an in-memory slice cannot fail");
    w.write_all(value).expect("writes into an in-memory slice cannot fail");
    if checksum_entries {
        let sum = crate::hash::checksum32(key, value);
        w.write_u32::<LittleEndian>(sum).expect("writes into an in-memory slice cannot fail");
    }
}

/// Decodes a live entry at `ptr`.
///
/// # Safety
///
/// `ptr` must point at a live span written by [`write_live`], and the
/// caller must hold at least the segment's read lock with a publication
/// that has already synchronized with this read (see
/// [`crate::segment::slot::SlotArray::load`]).
#[must_use]
pub unsafe fn read_live(ptr: *const u8, checksum_entries: bool) -> EntryView {
    debug_assert_eq!(tag_at(ptr), LIVE_TAG, "read_live called on a non-live span");
    let span = span_len_at(ptr) as usize;

    let buf = std::slice::from_raw_parts(ptr, span);
    let mut cursor = Cursor::new(&buf[HEADER_LEN..]);

    let key_len = cursor
        .read_u32_varint()
        .expect("reads from an in-memory slice cannot fail") as usize;
    let key_off = HEADER_LEN + cursor.position() as usize;
    cursor
        .seek(SeekFrom::Current(key_len as i64))
        .expect("seek within bounds");

    let value_len = cursor
        .read_u32_varint()
        .expect("reads from an in-memory slice cannot fail") as usize;
    let value_off = HEADER_LEN + cursor.position() as usize;
    cursor
        .seek(SeekFrom::Current(value_len as i64))
        .expect("seek within bounds");

    let checksum = if checksum_entries {
        Some(
            cursor
                .read_u32::<LittleEndian>()
                .expect("reads from an in-memory slice cannot fail"),
        )
    } else {
        None
    };

    EntryView {
        key_ptr: ptr.add(key_off),
        key_len,
        value_ptr: ptr.add(value_off),
        value_len,
        checksum,
        span,
    }
}

/// Overwrites just the checksum field of an already-written live entry in
/// place, used after a raw in-place value mutation (§4.6's `updateChecksum`).
///
/// # Safety
///
/// `ptr` must point at a live entry written with `checksum_entries ==
/// true`, and the caller must hold at least the segment's update lock.
pub unsafe fn recompute_checksum(ptr: *mut u8) {
    let view = read_live(ptr, true);
    let key = view.key();
    let value = view.value();
    let sum = crate::hash::checksum32(key, value);

    let checksum_off = HEADER_LEN + content_len(key.len(), value.len(), true) - 4;
    let buf = std::slice::from_raw_parts_mut(ptr, checksum_off + 4);
    buf[checksum_off..].copy_from_slice(&sum.to_le_bytes());
}

/// Writes a dead-span header into a reclaimed entry, linking it onto its
/// tier's free list ahead of `next_free_offset`.
///
/// # Safety
///
/// `ptr` must be valid for writes of `span` bytes, with `span >=
/// MIN_ENTRY_SPAN`, and the caller must hold at least the segment's update
/// lock.
pub unsafe fn write_dead(ptr: *mut u8, span: u32, next_free_offset: u64) {
    debug_assert!(span as usize >= MIN_ENTRY_SPAN);
    let buf = std::slice::from_raw_parts_mut(ptr, MIN_ENTRY_SPAN);
    buf[0] = DEAD_TAG;
    buf[1..5].copy_from_slice(&span.to_le_bytes());
    buf[5..13].copy_from_slice(&next_free_offset.to_le_bytes());
}

/// Reads a dead span's `(span_len, next_free_offset)`.
///
/// # Safety
///
/// `ptr` must point at a dead span written by [`write_dead`], valid for
/// reads of [`MIN_ENTRY_SPAN`] bytes.
#[must_use]
pub unsafe fn read_dead(ptr: *const u8) -> (u32, u64) {
    let buf = std::slice::from_raw_parts(ptr, MIN_ENTRY_SPAN);
    debug_assert_eq!(buf[0], DEAD_TAG);
    let span = u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes"));
    let next = u64::from_le_bytes(buf[5..13].try_into().expect("8 bytes"));
    (span, next)
}
