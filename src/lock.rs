// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The inter-process segment lock: three access levels (read, update,
//! write) packed into a single atomic word colocated with each segment's
//! header in shared memory, plus a holder PID used for dead-holder
//! detection across process boundaries.
//!
//! State word layout (bit 31 is the MSB):
//!
//! ```text
//! [ W | U | ------------- reader count (30 bits) ------------- ]
//! ```
//!
//! `Write` excludes every other holder. `Update` is upgradeable-exclusive:
//! at most one holder, but compatible with any number of concurrent
//! `Read` holders. `Read` is plain shared access.

use crate::backoff::Backoff;
use crate::futex;
use std::sync::atomic::{AtomicU32, Ordering};

const WRITE_HELD: u32 = 1 << 31;
const UPDATE_HELD: u32 = 1 << 30;
const READER_MASK: u32 = UPDATE_HELD - 1;

/// Flag bit in a segment's flags word: the lock was forcibly reclaimed
/// from a dead holder and the segment's contents must not be trusted
/// until recovery runs.
pub const FLAG_MAYBE_INCONSISTENT: u32 = 1 << 0;

/// The level at which a lock is held.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockLevel {
    /// Shared read access.
    Read,
    /// Upgradeable-exclusive access, compatible with concurrent readers.
    Update,
    /// Fully exclusive access.
    Write,
}

/// A view over one segment's lock word, holder PID, and flags, living at a
/// fixed offset inside the mapped region.
///
/// Cheap to construct; callers typically build one per `QueryContext`
/// rather than holding it long-term.
pub struct SegmentLock {
    state: &'static AtomicU32,
    holder_pid: &'static AtomicU32,
    flags: &'static AtomicU32,
}

impl SegmentLock {
    /// Builds a view over a segment's lock state word, holder-PID field,
    /// and flags field, as laid out in that segment's header.
    ///
    /// The three fields need not be contiguous; [`crate::segment::SegHdr`]
    /// interleaves `entry_count`/`tier_count`/`head_tier_ix` between
    /// `lock_word` and `last_holder_pid` to match the on-disk format
    /// table, so each pointer is computed independently by the caller.
    ///
    /// # Safety
    ///
    /// Each pointer must be 4-byte aligned and point at a live `u32` in
    /// the mapped region that every process sharing it agrees refers to
    /// this segment's lock, for as long as any `SegmentLock` built from it
    /// is used.
    pub unsafe fn new(state_ptr: *mut u8, holder_pid_ptr: *mut u8, flags_ptr: *mut u8) -> Self {
        Self {
            state: AtomicU32::from_ptr(state_ptr.cast()),
            holder_pid: AtomicU32::from_ptr(holder_pid_ptr.cast()),
            flags: AtomicU32::from_ptr(flags_ptr.cast()),
        }
    }

    /// Whether the segment is flagged `MAYBE_INCONSISTENT`.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_MAYBE_INCONSISTENT != 0
    }

    /// Clears the `MAYBE_INCONSISTENT` flag; only [`crate::recovery`] does
    /// this, after a successful scan.
    pub fn clear_poison(&self) {
        self.flags
            .fetch_and(!FLAG_MAYBE_INCONSISTENT, Ordering::Release);
    }

    fn mark_poisoned(&self) {
        self.flags.fetch_or(FLAG_MAYBE_INCONSISTENT, Ordering::Release);
    }

    /// Forces the `MAYBE_INCONSISTENT` flag on, for tests that need to
    /// exercise poisoned-segment handling without an actual dead holder.
    #[cfg(test)]
    pub(crate) fn force_poison_for_test(&self) {
        self.mark_poisoned();
    }

    /// Checks whether the last exclusive holder's process is still alive;
    /// if not, forcibly clears the lock word and flags the segment.
    fn reclaim_dead_holder(&self) {
        let pid = self.holder_pid.load(Ordering::Acquire);
        if pid != 0 && !process_alive(pid) {
            self.state.store(0, Ordering::Release);
            self.holder_pid.store(0, Ordering::Release);
            self.mark_poisoned();
            futex::wake_all(self.state);
        }
    }

    fn park_or_spin(&self, backoff: &mut Backoff, observed: u32) {
        if backoff.is_maxed() {
            futex::wait(self.state, observed, None);
        } else {
            backoff.spin();
        }
    }

    /// Attempts to acquire a read lock without blocking.
    pub fn try_read(&self) -> bool {
        self.reclaim_dead_holder();
        let current = self.state.load(Ordering::Relaxed);
        current & WRITE_HELD == 0
            && self
                .state
                .compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Acquires a read lock, blocking until available.
    pub fn read(&self) {
        let mut backoff = Backoff::new();
        loop {
            self.reclaim_dead_holder();
            let current = self.state.load(Ordering::Relaxed);
            if current & WRITE_HELD == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.park_or_spin(&mut backoff, current);
        }
    }

    /// Releases a previously acquired read lock.
    pub fn release_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(previous & READER_MASK > 0, "released read lock not held");
        futex::wake_all(self.state);
    }

    /// Attempts to acquire the update lock without blocking.
    pub fn try_update(&self) -> bool {
        self.reclaim_dead_holder();
        let current = self.state.load(Ordering::Relaxed);
        if current & (WRITE_HELD | UPDATE_HELD) != 0 {
            return false;
        }
        let acquired = self
            .state
            .compare_exchange(
                current,
                current | UPDATE_HELD,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok();
        if acquired {
            self.holder_pid.store(current_pid(), Ordering::Release);
        }
        acquired
    }

    /// Acquires the update lock, blocking until available.
    pub fn update(&self) {
        let mut backoff = Backoff::new();
        loop {
            self.reclaim_dead_holder();
            let current = self.state.load(Ordering::Relaxed);
            if current & (WRITE_HELD | UPDATE_HELD) == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        current,
                        current | UPDATE_HELD,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.holder_pid.store(current_pid(), Ordering::Release);
                    return;
                }
                continue;
            }
            self.park_or_spin(&mut backoff, current);
        }
    }

    /// Releases a previously acquired update lock.
    pub fn release_update(&self) {
        self.holder_pid.store(0, Ordering::Relaxed);
        self.state.fetch_and(!UPDATE_HELD, Ordering::Release);
        futex::wake_all(self.state);
    }

    /// Attempts to acquire the write lock without blocking.
    pub fn try_write(&self) -> bool {
        self.reclaim_dead_holder();
        let acquired = self
            .state
            .compare_exchange(0, WRITE_HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if acquired {
            self.holder_pid.store(current_pid(), Ordering::Release);
        }
        acquired
    }

    /// Acquires the write lock, blocking until available.
    pub fn write(&self) {
        let mut backoff = Backoff::new();
        loop {
            self.reclaim_dead_holder();
            let current = self.state.load(Ordering::Relaxed);
            if current == 0 {
                if self
                    .state
                    .compare_exchange_weak(0, WRITE_HELD, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.holder_pid.store(current_pid(), Ordering::Release);
                    return;
                }
                continue;
            }
            self.park_or_spin(&mut backoff, current);
        }
    }

    /// Releases a previously acquired write lock.
    pub fn release_write(&self) {
        self.holder_pid.store(0, Ordering::Relaxed);
        self.state.store(0, Ordering::Release);
        futex::wake_all(self.state);
    }

    /// Upgrades a held read lock to update, releasing the caller's own
    /// reader slot atomically with taking the update bit. Blocks until no
    /// other context holds update.
    pub fn upgrade_read_to_update(&self) {
        let mut backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & UPDATE_HELD == 0 {
                let desired = (current - 1) | UPDATE_HELD;
                if self
                    .state
                    .compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.holder_pid.store(current_pid(), Ordering::Release);
                    return;
                }
                continue;
            }
            self.park_or_spin(&mut backoff, current);
        }
    }

    /// Upgrades a held update lock to write, blocking until every reader
    /// has drained.
    pub fn upgrade_update_to_write(&self) {
        let mut backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Relaxed);
            debug_assert!(current & UPDATE_HELD != 0, "upgrade requires update held");
            if current & READER_MASK == 0 {
                if self
                    .state
                    .compare_exchange_weak(current, WRITE_HELD, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.park_or_spin(&mut backoff, current);
        }
    }

    /// Downgrades a held write lock back to update, without releasing
    /// exclusion against other update/write holders in between.
    pub fn downgrade_write_to_update(&self) {
        self.state.store(UPDATE_HELD, Ordering::Release);
        futex::wake_all(self.state);
    }

    /// Downgrades a held update lock back to read.
    pub fn downgrade_update_to_read(&self) {
        self.state.store(1, Ordering::Release);
        self.holder_pid.store(0, Ordering::Relaxed);
        futex::wake_all(self.state);
    }
}

fn current_pid() -> u32 {
    // SAFETY: `getpid` has no preconditions.
    unsafe { libc::getpid() as u32 }
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_lock() -> (Box<[u32; 3]>, SegmentLock) {
        let mut storage = Box::new([0u32; 3]);
        let base = storage.as_mut_ptr().cast::<u8>();
        // SAFETY: `storage` outlives the returned `SegmentLock` because
        // both are returned together and the test keeps the box alive;
        // each word is 4-byte aligned since it comes from a `[u32; 3]`.
        let lock = unsafe { SegmentLock::new(base, base.add(4), base.add(8)) };
        (storage, lock)
    }

    #[test]
    fn multiple_readers_allowed() {
        let (_storage, lock) = new_lock();
        assert!(lock.try_read());
        assert!(lock.try_read());
        lock.release_read();
        lock.release_read();
    }

    #[test]
    fn write_excludes_everything() {
        let (_storage, lock) = new_lock();
        assert!(lock.try_write());
        assert!(!lock.try_read());
        assert!(!lock.try_update());
        lock.release_write();

        assert!(lock.try_read());
        assert!(!lock.try_write());
    }

    #[test]
    fn update_is_compatible_with_readers() {
        let (_storage, lock) = new_lock();
        assert!(lock.try_read());
        assert!(lock.try_update());
        assert!(lock.try_read());
        assert!(!lock.try_update());
        assert!(!lock.try_write());
    }

    #[test]
    fn upgrade_read_to_update_releases_own_reader_slot() {
        let (_storage, lock) = new_lock();
        assert!(lock.try_read());
        lock.upgrade_read_to_update();
        // Another reader should still be admitted (update is compatible
        // with readers), but a second update holder must not be.
        assert!(lock.try_read());
        lock.release_read();
        assert!(!lock.try_update());
    }

    #[test]
    fn dead_holder_is_reclaimed_and_segment_flagged_poisoned() {
        let (mut storage, lock) = new_lock();
        assert!(lock.try_write());

        // A pid that is guaranteed dead: spawn a trivial child and wait
        // for it, so it has already been reaped.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        storage[1] = dead_pid;

        assert!(!lock.is_poisoned());
        assert!(lock.try_read());
        assert!(lock.is_poisoned());

        lock.clear_poison();
        assert!(!lock.is_poisoned());
    }

    #[test]
    fn upgrade_update_to_write_waits_for_readers() {
        let (_storage, lock) = new_lock();
        assert!(lock.try_update());
        assert!(lock.try_read());
        // Can't verify blocking without threads here; assert the reader
        // count is visible instead, then drain and upgrade.
        lock.release_read();
        lock.upgrade_update_to_write();
        assert!(!lock.try_read());
    }
}
