// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The query context, per §4.5: a scoped handle that owns one segment's
//! lock at a chosen level and exposes present/absent views of a single
//! key, plus the mutating operations that require update or write.
//!
//! A context never caches the probe result across calls: `entry()` and
//! `absent_entry()` re-probe the slot array every time, since a `Read`-
//! level context may coexist with a concurrent `Update`-level mutator on
//! the same segment (§4.2) and must observe its effects once upgraded or
//! re-queried.

use crate::hash;
use crate::lock::LockLevel;
use crate::segment::entry::EntryView;
use crate::segment::Segment;
use crate::store::Store;
use crate::{Error, Result};

/// A live entry's key/value bytes, borrowed for the lifetime of the
/// context's held lock. `'ctx` is the borrow of the owning
/// [`QueryContext`]; `'a` is that context's own segment-borrow lifetime.
pub struct EntryHandle<'ctx, 'a> {
    segment: &'ctx Segment<'a>,
    slot_index: u32,
    view: EntryView,
}

impl<'ctx, 'a> EntryHandle<'ctx, 'a> {
    /// The entry's key bytes.
    #[must_use]
    pub fn key(&self) -> &'ctx [u8] {
        // SAFETY: the owning `QueryContext` holds at least a read lock on
        // `self.segment` for the lifetime `'ctx`, matching this view's
        // documented borrow requirement.
        unsafe { self.view.key() }
    }

    /// The entry's value bytes.
    #[must_use]
    pub fn value(&self) -> &'ctx [u8] {
        // SAFETY: see `key`.
        unsafe { self.view.value() }
    }

    /// Recomputes and stores this entry's checksum in place, per §4.6.
    /// Required after a raw in-place mutation of the value bytes that
    /// bypassed [`QueryContext::replace_value`]; a contract violation if
    /// skipped (recovery will later flag the entry as corrupted).
    ///
    /// Requires the owning context to hold at least the update lock.
    pub fn update_checksum(&self) {
        // SAFETY: caller holds at least update, per this method's
        // documented precondition; `slot_index` is still the slot this
        // handle was built from.
        let ptr = unsafe { self.segment.entry_span_ptr(self.slot_index) };
        // SAFETY: `ptr` points at a live entry written with checksums
        // enabled, per the same precondition.
        unsafe { crate::segment::entry::recompute_checksum(ptr) };
    }

    /// Recomputes this entry's checksum and compares it against the
    /// stored one, per §4.6's `checkSum()`. Never mutates. Returns `true`
    /// if checksums are disabled for this store (nothing to verify).
    #[must_use]
    pub fn check_sum(&self) -> bool {
        match self.view.stored_checksum() {
            // SAFETY: lock held per `key`/`value`'s requirement.
            Some(stored) => stored == hash::checksum32(self.key(), self.value()),
            None => true,
        }
    }
}

/// A handle confirming a key is currently absent, returned by
/// [`QueryContext::absent_entry`]. Carries no slot index of its own:
/// [`QueryContext::insert`] re-probes for the insertion point at the time
/// it actually publishes, since the slot array may shift between this
/// handle's construction and that call (e.g. after an intervening
/// `upgrade_to_write`).
pub struct AbsentEntryHandle {
    _private: (),
}

/// A scoped handle owning one segment's lock at a chosen level, for a
/// single key. Guarantees the lock is released on every exit path,
/// including an early return or panic, via `Drop`.
pub struct QueryContext<'a> {
    segment: Segment<'a>,
    key: Vec<u8>,
    fingerprint: u32,
    slot_hint: u32,
    level: Option<LockLevel>,
}

impl<'a> QueryContext<'a> {
    /// Opens a context on `key`'s segment, acquiring the lock at `level`
    /// up front.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poisoned`] if a dead holder is detected during
    /// acquisition (or was already flagged by an earlier acquisition) and
    /// this segment's `MAYBE_INCONSISTENT` flag is set; per §4.2 the lock
    /// is still reclaimed in that case, but the caller must run recovery
    /// before trusting the segment's contents, so the lock is released
    /// again here rather than handed back to a caller that never asked for
    /// it.
    pub(crate) fn open(store: &'a Store, key: Vec<u8>, level: LockLevel) -> Result<Self> {
        let key_hash = hash::hash64(&key);
        let segment = store.segment_for_key_hash(key_hash);
        let fingerprint = hash::fingerprint(&key);
        let slot_hint = hash::slot_hint(key_hash, store.slot_array(segment.index()).capacity());

        match level {
            LockLevel::Read => segment.lock().read(),
            LockLevel::Update => segment.lock().update(),
            LockLevel::Write => segment.lock().write(),
        }

        if segment.lock().is_poisoned() {
            match level {
                LockLevel::Read => segment.lock().release_read(),
                LockLevel::Update => segment.lock().release_update(),
                LockLevel::Write => segment.lock().release_write(),
            }
            return Err(Error::Poisoned);
        }

        Ok(Self {
            segment,
            key,
            fingerprint,
            slot_hint,
            level: Some(level),
        })
    }

    /// The lock level currently held by this context.
    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level.expect("level queried after close")
    }

    /// Returns a handle to the live entry for this context's key, or
    /// `None` if absent. Never fails; any lock level may be held.
    #[must_use]
    pub fn entry(&self) -> Option<EntryHandle<'_, 'a>> {
        let probe = self.segment.probe(&self.key, self.fingerprint, self.slot_hint);
        probe.found.map(|slot_index| {
            // SAFETY: at least a read lock is held for the context's
            // entire lifetime, satisfying `entry_at`'s requirement.
            let view = unsafe { self.segment.entry_at(slot_index) };
            EntryHandle {
                segment: &self.segment,
                slot_index,
                view,
            }
        })
    }

    /// Returns a handle describing the absent slot for this context's key,
    /// or `None` if a live entry is already present. Never fails.
    #[must_use]
    pub fn absent_entry(&self) -> Option<AbsentEntryHandle> {
        let probe = self.segment.probe(&self.key, self.fingerprint, self.slot_hint);
        match probe.found {
            Some(_) => None,
            None => probe.insertion_point.map(|_| AbsentEntryHandle { _private: () }),
        }
    }

    /// Transitions a held read lock to update. Blocks until no other
    /// update holder remains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] if this context is not currently
    /// holding read (an illegal re-entrant upgrade).
    pub fn upgrade_to_update(&mut self) -> Result<()> {
        match self.level {
            Some(LockLevel::Read) => {
                self.segment.lock().upgrade_read_to_update();
                self.level = Some(LockLevel::Update);
                Ok(())
            }
            _ => Err(Error::Deadlock),
        }
    }

    /// Transitions a held read or update lock to write. Blocks for
    /// concurrent readers to drain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] if this context already holds write.
    pub fn upgrade_to_write(&mut self) -> Result<()> {
        match self.level {
            Some(LockLevel::Read) => {
                self.segment.lock().upgrade_read_to_update();
                self.segment.lock().upgrade_update_to_write();
                self.level = Some(LockLevel::Write);
                Ok(())
            }
            Some(LockLevel::Update) => {
                self.segment.lock().upgrade_update_to_write();
                self.level = Some(LockLevel::Write);
                Ok(())
            }
            _ => Err(Error::Deadlock),
        }
    }

    fn require_mutating_level(&self) {
        debug_assert!(
            matches!(self.level, Some(LockLevel::Update) | Some(LockLevel::Write)),
            "mutating operation requires update or write lock"
        );
    }

    /// Publishes a new entry for this context's key and `value`.
    ///
    /// Precondition: `absent_entry()` is present and this context holds
    /// write or update. If the key is in fact already present (a contract
    /// violation the core tolerates rather than traps), this gracefully
    /// degrades to [`QueryContext::replace_value`]'s semantics instead of
    /// erroring.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExhausted`] if the segment's tier chain
    /// cannot grow to fit the new entry.
    pub fn insert(&self, value: &[u8]) -> Result<()> {
        self.require_mutating_level();
        let probe = self.segment.probe(&self.key, self.fingerprint, self.slot_hint);
        match probe.found {
            Some(slot_index) => self.segment.replace_value(slot_index, self.fingerprint, &self.key, value),
            None => {
                let slot_index = probe.insertion_point.ok_or(Error::CapacityExhausted)?;
                self.segment.insert_entry(slot_index, self.fingerprint, &self.key, value)
            }
        }
    }

    /// Overwrites this context's key with `value`: same-size values are
    /// written in place and their checksum recomputed; different-size
    /// values allocate a new entry, publish it, then free the old one.
    ///
    /// Precondition: `entry()` is present and this context holds write or
    /// update. If the key is in fact absent, this degrades to
    /// [`QueryContext::insert`]'s semantics, symmetrically with `insert`'s
    /// own degrade-to-replace behavior.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExhausted`] if replacement requires a new
    /// span and the segment's tier chain cannot grow to fit it.
    pub fn replace_value(&self, value: &[u8]) -> Result<()> {
        self.insert(value)
    }

    /// Tombstones this context's slot and frees its entry's tier span, if
    /// present. Returns `true` if an entry was removed, `false` if the key
    /// was already absent (idempotent, per property 3 of §8).
    ///
    /// Precondition: this context holds write or update.
    pub fn remove(&self) -> bool {
        self.require_mutating_level();
        let probe = self.segment.probe(&self.key, self.fingerprint, self.slot_hint);
        match probe.found {
            Some(slot_index) => {
                self.segment.remove_slot(slot_index);
                true
            }
            None => false,
        }
    }

    /// Releases this context's lock at whatever level it currently holds.
    /// Equivalent to dropping the context, but explicit.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(level) = self.level.take() {
            let lock = self.segment.lock();
            match level {
                LockLevel::Read => lock.release_read(),
                LockLevel::Update => lock.release_update(),
                LockLevel::Write => lock.release_write(),
            }
        }
    }
}

impl Drop for QueryContext<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Store;

    #[test]
    fn opening_a_context_on_a_poisoned_segment_fails() {
        let config = Config::builder(16).segments(1).finish(false);
        let store = Store::create_anonymous(config).unwrap();
        store.segment(0).lock().force_poison_for_test();

        let err = QueryContext::open(&store, b"k".to_vec(), LockLevel::Read).unwrap_err();
        assert!(matches!(err, Error::Poisoned));

        // The lock itself was still released, not left held.
        assert!(store.segment(0).lock().try_write());
    }

    #[test]
    fn recovery_clears_poison_and_contexts_open_again() {
        let config = Config::builder(16).segments(1).finish(false);
        let store = Store::create_anonymous(config).unwrap();
        store.segment(0).lock().force_poison_for_test();

        crate::recovery::scan_and_repair(&store);

        assert!(QueryContext::open(&store, b"k".to_vec(), LockLevel::Read).is_ok());
    }
}
