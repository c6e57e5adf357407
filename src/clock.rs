//! Monotonic millisecond clock with a cached fast path.
//!
//! Reading the OS monotonic source on every delay comparison is wasteful and,
//! worse, makes ordering decisions inconsistent: two delay computations inside
//! one queue reorder could observe different instants. [`Clock`] therefore
//! keeps a cached millisecond value that is cheap to read, and offers a
//! *forcing-update suspension* bracket: between [`Clock::stop_forcing_update`]
//! and [`Clock::resume_forcing_update`], [`Clock::accurate_time`] returns the
//! cached value, so an entire reorder appears to occur at a single instant.
//! Callers refresh the cache once inside the bracket with
//! [`Clock::update_clock`]. [`Clock::freeze`] packages the bracket as an RAII
//! guard.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond clock.
///
/// All values are milliseconds since the clock was constructed. The cached
/// value only moves forward.
#[derive(Debug)]
pub struct Clock {
    anchor: Instant,
    cached_ms: AtomicU64,
    suspensions: AtomicU32,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            cached_ms: AtomicU64::new(0),
            suspensions: AtomicU32::new(0),
        }
    }

    fn raw_now(&self) -> u64 {
        u64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the cached time without touching the OS clock.
    #[must_use]
    pub fn last_known_time(&self) -> u64 {
        self.cached_ms.load(Ordering::Acquire)
    }

    /// Returns a fresh reading, refreshing the cache. While forced updates
    /// are suspended, the cached value is returned instead.
    pub fn accurate_time(&self) -> u64 {
        if self.suspensions.load(Ordering::Acquire) > 0 {
            self.last_known_time()
        } else {
            self.update_clock()
        }
    }

    /// Unconditionally refreshes the cache from the OS monotonic source and
    /// returns the new value. Works even while forced updates are suspended.
    pub fn update_clock(&self) -> u64 {
        let now = self.raw_now();
        let prev = self.cached_ms.fetch_max(now, Ordering::AcqRel);
        now.max(prev)
    }

    /// Suspends forced updates. Nestable; pair with
    /// [`Clock::resume_forcing_update`].
    pub fn stop_forcing_update(&self) {
        self.suspensions.fetch_add(1, Ordering::AcqRel);
    }

    /// Resumes forced updates after [`Clock::stop_forcing_update`].
    pub fn resume_forcing_update(&self) {
        let prev = self.suspensions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "resume_forcing_update without matching stop");
    }

    /// Suspends forced updates, refreshes the cache once, and returns a guard
    /// that resumes on drop. While the guard lives, every [`Clock::accurate_time`]
    /// observes the same instant.
    pub fn freeze(&self) -> ClockFreeze<'_> {
        self.stop_forcing_update();
        self.update_clock();
        ClockFreeze { clock: self }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a forcing-update suspension bracket.
#[derive(Debug)]
pub struct ClockFreeze<'a> {
    clock: &'a Clock,
}

impl Drop for ClockFreeze<'_> {
    fn drop(&mut self) {
        self.clock.resume_forcing_update();
    }
}
