// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Opens, creates, and maps the backing file (or an anonymous region for
//! in-memory mode) and hands every other component a linear addressable
//! byte window into it.

use crate::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A mapped region of memory, either backed by a file (visible to other
/// processes that map the same path) or anonymous (private to this
/// process, used for purely in-memory stores).
///
/// The mapping address is stable for the lifetime of the `Region`: once
/// `mmap` is created its pages never move, so the raw pointer returned by
/// [`Region::as_mut_ptr`] may be cached and handed to other components
/// (the segment lock, the slot array, the tier chain) that mutate through
/// atomics and raw writes rather than through `&mut Region`.
pub struct Region {
    mmap: MmapMut,
    // Kept alive so the file is only closed when the region is dropped;
    // never read after construction.
    _file: Option<File>,
}

impl Region {
    /// Creates a brand-new file-backed region of exactly `size` bytes.
    ///
    /// Fails if the file already exists and is non-empty.
    pub fn create_file(path: &Path, size: usize, pretouch: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() != 0 {
            return Err(Error::CorruptFormat("file already exists and is non-empty"));
        }
        file.set_len(size as u64)?;

        Self::from_file(file, pretouch)
    }

    /// Opens an existing file-backed region, mapping its full length.
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, pretouch: bool) -> Result<Self> {
        // SAFETY: the caller is responsible for not truncating or otherwise
        // invalidating the backing file out from under the mapping while
        // this `Region` is alive; this is the standard mmap hazard and is
        // why the store is documented as adopting the file as-is.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut region = Self {
            mmap,
            _file: Some(file),
        };

        if pretouch {
            region.pretouch();
        }

        Ok(region)
    }

    /// Creates an anonymous region, private to this process, used when no
    /// backing file was configured.
    pub fn anonymous(size: usize, pretouch: bool) -> Result<Self> {
        let mmap = MmapMut::map_anon(size)?;
        let mut region = Self { mmap, _file: None };

        if pretouch {
            region.pretouch();
        }

        Ok(region)
    }

    /// Forces every page of the mapping to be resident by writing its
    /// first byte back to itself, avoiding a page fault storm on the first
    /// real access under a lock.
    fn pretouch(&mut self) {
        let page_size = page_size();
        let len = self.mmap.len();
        let bytes = self.mmap.as_mut();

        let mut offset = 0;
        while offset < len {
            // SAFETY: offset < len, checked by the loop condition.
            let byte = unsafe { *bytes.get_unchecked(offset) };
            // SAFETY: same index as the read above.
            unsafe {
                *bytes.get_unchecked_mut(offset) = byte;
            }
            offset += page_size;
        }
    }

    /// Total size of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the mapping is empty (never true for a valid region; kept
    /// for API completeness / clippy).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Borrows the mapping as an immutable byte slice, for components (like
    /// [`crate::header::Header`]) that parse through safe slice APIs
    /// rather than raw pointers.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Borrows the mapping as a mutable byte slice.
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Returns the stable base pointer of the mapping.
    ///
    /// Dereferencing through this pointer, including via `AtomicU64::from_ptr`
    /// and friends, is unsafe and the responsibility of the caller, which
    /// must also respect the segment lock protocol described in
    /// [`crate::lock`].
    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Flushes all dirty pages back to the backing file. A no-op,
    /// best-effort operation for anonymous regions.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Asynchronously schedules dirty pages to be written back, without
    /// waiting for completion.
    pub fn flush_async(&self) -> Result<()> {
        self.mmap.flush_async()?;
        Ok(())
    }
}

fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_region_is_addressable() {
        let region = Region::anonymous(8192, true).unwrap();
        assert_eq!(region.len(), 8192);

        let ptr = region.as_mut_ptr();
        // SAFETY: within bounds of the 8192-byte mapping.
        unsafe {
            *ptr = 0xAB;
            assert_eq!(*ptr, 0xAB);
        }
    }

    #[test]
    fn create_file_fails_against_a_pre_existing_non_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occupied.cmap");
        std::fs::write(&path, b"not a cmap store").unwrap();

        let err = Region::create_file(&path, 8192, false).unwrap_err();
        assert!(matches!(err, Error::CorruptFormat(_)));
    }

    #[test]
    fn file_backed_region_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.cmap");

        {
            let region = Region::create_file(&path, 8192, false).unwrap();
            let ptr = region.as_mut_ptr();
            // SAFETY: within bounds.
            unsafe {
                *ptr = 0x42;
            }
            region.flush().unwrap();
        }

        let region = Region::open_file(&path).unwrap();
        let ptr = region.as_mut_ptr();
        // SAFETY: within bounds.
        unsafe {
            assert_eq!(*ptr, 0x42);
        }
    }
}
