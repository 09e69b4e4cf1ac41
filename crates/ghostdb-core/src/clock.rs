//! Day-relative access clock.
//!
//! Access times are stored as seconds since the start of the (UTC) day and
//! wrap at [`SECONDS_PER_DAY`]. Ages computed with [`elapsed_since`] stay
//! correct across one midnight rollover, so a cache must be shrunk at least
//! once a day for the ordering to hold.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the access-time cycle.
pub const SECONDS_PER_DAY: u32 = 86_400;

/// Source of the current seconds-of-day value.
pub trait DayClock: Send + Sync {
    /// Seconds since the start of the current day, in `0..SECONDS_PER_DAY`.
    fn seconds_of_day(&self) -> u32;
}

/// Wall-clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDayClock;

impl DayClock for SystemDayClock {
    fn seconds_of_day(&self) -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (secs % u64::from(SECONDS_PER_DAY)) as u32
    }
}

/// Clock pinned to a settable value. Used by tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualDayClock {
    now: AtomicU32,
}

impl ManualDayClock {
    /// Creates a clock reading `now` (taken modulo one day).
    #[must_use]
    pub fn new(now: u32) -> Self {
        Self {
            now: AtomicU32::new(now % SECONDS_PER_DAY),
        }
    }

    /// Moves the clock to `now` (taken modulo one day).
    pub fn set(&self, now: u32) {
        self.now.store(now % SECONDS_PER_DAY, Ordering::Relaxed);
    }

    /// Advances the clock, wrapping at midnight.
    pub fn advance(&self, secs: u32) {
        let next = (u64::from(self.now.load(Ordering::Relaxed)) + u64::from(secs))
            % u64::from(SECONDS_PER_DAY);
        self.now.store(next as u32, Ordering::Relaxed);
    }
}

impl DayClock for ManualDayClock {
    fn seconds_of_day(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Seconds elapsed between `last_access` and `now` on the wrapping clock.
///
/// A `last_access` greater than `now` was recorded before the last midnight.
#[must_use]
pub fn elapsed_since(last_access: u32, now: u32) -> u32 {
    if last_access > now {
        SECONDS_PER_DAY.saturating_sub(last_access) + now
    } else {
        now - last_access
    }
}
