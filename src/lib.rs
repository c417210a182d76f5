// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, concurrent, inter-process key-value store whose entire
//! data structure lives in a memory-mapped region that may be shared by
//! multiple processes on a single host.
//!
//! The store is organized into independently lockable segments: a key
//! hashes to a segment, then to a slot within that segment's open-addressed
//! hash table, which points at an entry packed into one of the segment's
//! tiers. See the [`query`] module for the scoped lock handle
//! ([`QueryContext`]) that every read or write goes through, and [`config`]
//! for the knobs that size a store at creation time.
//!
//! ```
//! use cmap::{CMap, Config};
//!
//! # let dir = tempfile::tempdir()?;
//! let config = Config::builder(1_024).segments(4).finish(false);
//! let map: CMap<String, Vec<u8>> = CMap::create_anonymous(config)?;
//!
//! map.put(&"hello".to_string(), &b"world".to_vec())?;
//! assert_eq!(map.get(&"hello".to_string())?, Some(b"world".to_vec()));
//! assert_eq!(map.size(), 1);
//! # Ok::<(), cmap::Error>(())
//! ```
//!
//! This crate's core necessarily reaches for raw pointers and atomics
//! over shared memory pages that other processes may be mutating
//! concurrently; unlike a purely in-process data structure, that access
//! pattern cannot be expressed, or checked, in safe Rust. Every `unsafe`
//! block carries a `# Safety` note tying it back to the three-level
//! segment lock ([`LockLevel`]) and the publication ordering documented
//! on [`query`].

#![deny(clippy::all, missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

mod backoff;
mod coding;
pub mod config;
mod error;
mod format_version;
mod futex;
mod hash;
mod header;
mod iter;
mod lock;
pub mod query;
mod recovery;
mod region;
mod segment;
mod store;
mod time;
pub mod value;

use std::marker::PhantomData;
use std::path::Path;

pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use format_version::FormatVersion;
pub use header::Header;
pub use lock::LockLevel;
pub use query::{AbsentEntryHandle, EntryHandle, QueryContext};
pub use value::{Reader, Writer};

use store::Store;

/// A typed handle onto a store: encodes keys and values through the
/// [`Writer`]/[`Reader`] capabilities and delegates everything else to the
/// byte-oriented [`Store`].
pub struct CMap<K, V> {
    store: Store,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> CMap<K, V>
where
    K: Writer,
    V: Writer + Reader,
{
    fn wrap(store: Store) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Creates a brand-new file-backed store. Fails if `path` already
    /// exists and is non-empty.
    pub fn create_file(path: &Path, config: Config) -> Result<Self> {
        log::debug!("creating cmap store at {path:?}");
        Ok(Self::wrap(Store::create_file(path, config, false)?))
    }

    /// Creates a brand-new file-backed store, pre-touching every page up
    /// front to avoid a page-fault storm on first access under a lock.
    pub fn create_file_pretouched(path: &Path, config: Config) -> Result<Self> {
        log::debug!("creating pre-touched cmap store at {path:?}");
        Ok(Self::wrap(Store::create_file(path, config, true)?))
    }

    /// Opens an existing file-backed store, validating its header.
    pub fn open_file(path: &Path) -> Result<Self> {
        log::debug!("opening cmap store at {path:?}");
        Ok(Self::wrap(Store::open_file(path)?))
    }

    /// Creates an anonymous, purely in-memory store private to this
    /// process.
    pub fn create_anonymous(config: Config) -> Result<Self> {
        Ok(Self::wrap(Store::create_anonymous(config)?))
    }

    /// Recovers a file-backed store per §4.7: a full exclusive scan that
    /// rebuilds slot arrays and discards entries whose checksum, or
    /// segment placement, no longer checks out.
    ///
    /// `asserted_config` selects same-configuration recovery (header
    /// rewritten from the caller's configuration if it fails its sanity
    /// check) versus self-describing recovery (header authoritative,
    /// aborts with [`Error::RecoveryFailed`] if it fails).
    pub fn recover_file(path: &Path, asserted_config: Option<Config>) -> Result<Self> {
        log::warn!("running recovery on cmap store at {path:?}");
        Ok(Self::wrap(Store::recover_file(path, asserted_config)?))
    }

    /// This store's creation-time configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        self.store.config()
    }

    /// Total number of live entries across every segment.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.store.size()
    }

    /// Flushes dirty pages back to the backing file. A no-op for
    /// anonymous stores.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Opens a scoped [`QueryContext`] on `key`, acquiring the segment
    /// lock at `level` up front.
    ///
    /// Most callers want [`CMap::get`], [`CMap::put`], or
    /// [`CMap::remove`]; use this directly for multi-step operations
    /// (read-then-maybe-upgrade-then-write) that need the same lock held
    /// across several calls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poisoned`] if the owning segment is flagged
    /// `MAYBE_INCONSISTENT`; the caller must run [`CMap::recover_file`]
    /// before trusting this segment's contents again.
    pub fn context(&self, key: &K, level: LockLevel) -> Result<QueryContext<'_>> {
        QueryContext::open(&self.store, value::encode(key), level)
    }

    /// Looks up `key`, returning its decoded value if present.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let ctx = self.context(key, LockLevel::Read)?;
        Ok(ctx.entry().map(|entry| V::read_bytes(entry.value())))
    }

    /// Whether `key` is currently present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let ctx = self.context(key, LockLevel::Read)?;
        Ok(ctx.entry().is_some())
    }

    /// Inserts or overwrites `key` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExhausted`] if the owning segment's tier
    /// chain cannot grow to fit the new entry.
    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        let mut ctx = self.context(key, LockLevel::Read)?;
        ctx.upgrade_to_update()?;
        let value_bytes = value::encode(value);
        ctx.insert(&value_bytes)
    }

    /// Removes `key`. Returns `true` if an entry was removed, `false` if
    /// the key was already absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let mut ctx = self.context(key, LockLevel::Read)?;
        ctx.upgrade_to_update()?;
        Ok(ctx.remove())
    }

    /// Visits every live `(key, value)` pair across every segment, in
    /// segment index order, decoding each as it is visited.
    pub fn for_each_entry(&self, mut visitor: impl FnMut(K, V)) {
        iter::for_each_entry(&self.store, |k, v| {
            visitor(K::read_bytes(k), V::read_bytes(v));
        });
    }

    /// Like [`CMap::for_each_entry`], but `visitor` may return `false` to
    /// stop the walk early.
    pub fn for_each_entry_while(&self, mut visitor: impl FnMut(K, V) -> bool) {
        iter::for_each_entry_while(&self.store, |k, v| visitor(K::read_bytes(k), V::read_bytes(v)));
    }
}

impl<K, V> std::fmt::Debug for CMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CMap").field("store", &self.store).finish()
    }
}
