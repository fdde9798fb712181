//! `queue-sync`: a cross-process mutex over a single 8-byte cell living
//! inside a memory-mapped region.
//!
//! The cell holds either `UNLOCKED` (0) or the wall-clock millisecond
//! timestamp at which the current holder acquired it. Acquisition is a CAS
//! loop that also repairs two failure modes without ever blocking forever:
//! a holder whose clock runs ahead of ours (pulled back to `now`), and a
//! holder that crashed without releasing (reclaimed once its timestamp is
//! older than [`MAX_LOCK_DURATION_MS`]).
//!
//! This generalizes the single-writer seqlock idiom the rest of the
//! workspace uses for the broadcast ring (load/CAS with explicit
//! `Acquire`/`Release` ordering, `spin_loop()` hints) into a general-purpose
//! blocking mutex suitable for guarding multi-file mutations.

use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel value stored in the lock cell when nobody holds it.
pub const UNLOCKED: u64 = 0;

/// A holder's timestamp older than this (relative to `now`) is considered
/// abandoned and may be forcibly reclaimed.
pub const MAX_LOCK_DURATION_MS: u64 = 5 * 60 * 1000;

/// Delay between retries while spinning on a live holder.
const RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Supplies wall-clock milliseconds. Abstracted so tests can inject a
/// controllable clock to exercise stale-owner reclaim and skew correction
/// deterministically.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Real wall-clock time via `SystemTime`.
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }
}

/// A mutex backed by an 8-byte cell inside a shared mapping.
///
/// # Safety
///
/// The pointer passed to [`ByteBufferLock::at`] must address at least 8
/// live, writable, 8-byte-aligned bytes for as long as any `ByteBufferLock`
/// built from it is in use, and that memory must be visible to every
/// process that wants to share the lock (i.e. it must come from a shared
/// memory mapping of the same file).
pub struct ByteBufferLock {
    cell: *const AtomicU64,
}

// The cell lives in a shared mapping; all synchronization is done through
// atomic operations on it, so sharing the handle across threads is sound.
unsafe impl Send for ByteBufferLock {}
unsafe impl Sync for ByteBufferLock {}

/// RAII guard returned by [`ByteBufferLock::acquire`]. Releases the lock on
/// drop, including on an unwinding panic, so a mutation that panics
/// mid-way never leaves the lock held forever.
pub struct LockGuard<'a> {
    lock: &'a ByteBufferLock,
    acquired_at: u64,
    released: bool,
}

impl ByteBufferLock {
    /// Wraps an existing 8-byte cell at `ptr`. Does not initialize it —
    /// callers that create a fresh file must zero the cell themselves
    /// (e.g. via `MappedFile::create`'s zero-filled backing store).
    ///
    /// # Safety
    /// See the struct-level safety section.
    pub unsafe fn at(ptr: *mut u8) -> Self {
        debug_assert_eq!(ptr.align_offset(align_of::<AtomicU64>()), 0, "lock cell must be 8-byte aligned");
        Self {
            cell: ptr as *const AtomicU64,
        }
    }

    #[inline]
    fn atomic(&self) -> &AtomicU64 {
        // SAFETY: constructing `ByteBufferLock` requires the pointer to
        // address live, aligned memory for the lock's lifetime.
        unsafe { &*self.cell }
    }

    /// Blocks until the lock is acquired, using the real system clock.
    pub fn acquire(&self) -> LockGuard<'_> {
        self.acquire_with_clock(&SystemClock)
    }

    /// Same as [`Self::acquire`] but with an injectable clock, used by
    /// tests to simulate clock skew and stale-owner recovery without
    /// sleeping for real wall-clock minutes.
    pub fn acquire_with_clock(&self, clock: &dyn Clock) -> LockGuard<'_> {
        loop {
            let now = clock.now_millis();
            match self
                .atomic()
                .compare_exchange(UNLOCKED, now, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    fence(Ordering::Acquire);
                    return LockGuard {
                        lock: self,
                        acquired_at: now,
                        released: false,
                    };
                }
                Err(current) => {
                    if current == UNLOCKED {
                        // Lost a race with another acquirer; retry immediately.
                        continue;
                    }
                    if current > now {
                        // The holder's clock is ahead of ours. Pull it back
                        // to `now` rather than clobbering a live holder with
                        // UNLOCKED.
                        let _ = self.atomic().compare_exchange(
                            current,
                            now,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                        continue;
                    }
                    if current + MAX_LOCK_DURATION_MS < now {
                        // Stale-owner recovery: the holder has been dead
                        // for longer than any operation should ever take.
                        let _ = self.atomic().compare_exchange(
                            current,
                            UNLOCKED,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                        continue;
                    }
                    thread::sleep(RETRY_SLEEP);
                }
            }
        }
    }
}

impl LockGuard<'_> {
    /// Releases the lock early (equivalent to dropping it).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        fence(Ordering::Release);
        // If this fails, another holder already forcibly reclaimed the
        // lock (clock skew pullback or stale-owner recovery) — it's
        // already theirs, so there is nothing left for us to do.
        let _ = self.lock.atomic().compare_exchange(
            self.acquired_at,
            UNLOCKED,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::atomic::Ordering as StdOrdering;

    struct FakeClock(StdAtomicU64);

    impl Clock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.0.load(StdOrdering::Relaxed)
        }
    }

    fn new_cell() -> (Box<AtomicU64>, ByteBufferLock) {
        let mut cell = Box::new(AtomicU64::new(UNLOCKED));
        let ptr = cell.as_mut() as *mut AtomicU64 as *mut u8;
        let lock = unsafe { ByteBufferLock::at(ptr) };
        (cell, lock)
    }

    #[test]
    fn acquire_release_roundtrip() {
        let (_cell, lock) = new_cell();
        let clock = FakeClock(StdAtomicU64::new(1_000));
        {
            let _g = lock.acquire_with_clock(&clock);
            assert_eq!(lock.atomic().load(Ordering::Relaxed), 1_000);
        }
        assert_eq!(lock.atomic().load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn stale_owner_is_reclaimed() {
        let (_cell, lock) = new_cell();
        let clock = FakeClock(StdAtomicU64::new(1_000));
        // Simulate a crashed holder: cell holds an old timestamp, never released.
        lock.atomic().store(1_000, Ordering::Relaxed);
        clock.0.store(1_000 + MAX_LOCK_DURATION_MS + 1, StdOrdering::Relaxed);
        let guard = lock.acquire_with_clock(&clock);
        assert_eq!(guard.acquired_at, 1_000 + MAX_LOCK_DURATION_MS + 1);
    }

    #[test]
    fn future_dated_holder_is_pulled_back_then_reclaimed() {
        let mut cell = Box::new(AtomicU64::new(UNLOCKED));
        let ptr = cell.as_mut() as *mut AtomicU64 as *mut u8;
        let lock = Arc::new(unsafe { ByteBufferLock::at(ptr) });
        // A holder whose clock was ahead of ours wrote a future timestamp;
        // nobody will ever release it (simulating a crash right after a
        // clock-skewed acquire).
        lock.atomic().store(5_000, Ordering::Relaxed);
        let clock = Arc::new(FakeClock(StdAtomicU64::new(1_000)));

        let lock2 = Arc::clone(&lock);
        let clock2 = Arc::clone(&clock);
        let handle = thread::spawn(move || lock2.acquire_with_clock(&*clock2));

        // Give the spinning thread a few iterations to observe the future
        // timestamp and CAS-pull it back to `now` (1_000).
        thread::sleep(Duration::from_millis(10));
        assert_eq!(lock.atomic().load(Ordering::Relaxed), 1_000);

        // Advance the clock far enough that the pulled-back holder now
        // looks abandoned, triggering stale-owner reclaim.
        clock
            .0
            .store(1_000 + MAX_LOCK_DURATION_MS + 1, StdOrdering::Relaxed);

        let guard = handle.join().unwrap();
        assert_eq!(guard.acquired_at, 1_000 + MAX_LOCK_DURATION_MS + 1);
        drop(cell);
    }

    #[test]
    fn concurrent_threads_serialize() {
        let mut cell = Box::new(AtomicU64::new(UNLOCKED));
        let ptr = cell.as_mut() as *mut AtomicU64 as *mut u8;
        let lock = Arc::new(unsafe { ByteBufferLock::at(ptr) });
        let counter = Arc::new(std::sync::Mutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _g = lock.acquire();
                    let mut c = counter.lock().unwrap();
                    *c += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
        // keep cell alive until after threads join
        drop(cell);
    }
}
