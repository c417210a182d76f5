// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! OS parking primitive for segment locks, used once spin-backoff has
//! reached its ceiling. The lock word lives in shared memory and may be
//! waited on by threads in other processes, which rules out any
//! process-local primitive (`Condvar`, `Thread::park`, ...).

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Parks the calling thread while `*word == expected`, returning promptly
/// once the value changes or a wake arrives. Spurious wakeups are possible
/// and expected; callers re-check their own predicate after returning.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    imp::wait(word, expected, timeout);
}

/// Wakes at least one thread parked on `word`.
pub fn wake_one(word: &AtomicU32) {
    imp::wake_one(word);
}

/// Wakes every thread parked on `word`.
pub fn wake_all(word: &AtomicU32) {
    imp::wake_all(word);
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{AtomicU32, Duration};
    use std::sync::atomic::Ordering;

    pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: i64::from(d.subsec_nanos()),
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| std::ptr::from_ref(t));

        // SAFETY: `word` is a valid, live `AtomicU32` for the duration of
        // the call; FUTEX_WAIT only ever reads it and blocks, it never
        // writes through the pointer.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                std::ptr::from_ref(word).cast::<u32>(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0,
            );
        }

        // The futex call may return EAGAIN (value already changed),
        // EINTR, or ETIMEDOUT; in every case the caller re-checks its
        // predicate, so the result is deliberately discarded.
        let _ = word.load(Ordering::Relaxed);
    }

    pub fn wake_one(word: &AtomicU32) {
        wake(word, 1);
    }

    pub fn wake_all(word: &AtomicU32) {
        wake(word, i32::MAX);
    }

    fn wake(word: &AtomicU32, count: i32) {
        // SAFETY: see `wait`; FUTEX_WAKE never writes through the pointer.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                std::ptr::from_ref(word).cast::<u32>(),
                libc::FUTEX_WAKE,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0,
            );
        }
    }
}

/// Fallback for platforms without a shared-memory futex syscall: a bounded
/// busy-poll. Correct, but wastes CPU under heavy contention; only Linux
/// gets the real OS park.
#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{AtomicU32, Duration};
    use std::sync::atomic::Ordering;

    pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);

        loop {
            if word.load(Ordering::Relaxed) != expected {
                return;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    return;
                }
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    pub fn wake_one(_word: &AtomicU32) {}

    pub fn wake_all(_word: &AtomicU32) {}
}
