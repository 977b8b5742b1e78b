//! Monotonic time sources for deadline arithmetic.
//!
//! The lock never reads the clock directly; every deadline computation
//! and expiry check goes through a [`TimeService`]. Production code uses
//! [`MonotonicClock`]. Tests (and deterministic harnesses) construct the
//! lock with a [`ManualClock`] and advance it explicitly, so timeout
//! behaviour is reproducible without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic deadlines and expiry checks.
///
/// Implementations must be monotone: once `expired(d)` returns `true`
/// for a deadline `d`, it returns `true` forever.
pub trait TimeService: fmt::Debug + Send + Sync {
    /// Computes the absolute deadline for an operation starting now.
    fn expected_end(&self, timeout: Duration) -> Instant;

    /// Returns the time left until `deadline`, saturating to zero once
    /// the deadline has passed.
    fn remaining(&self, deadline: Instant) -> Duration;

    /// Returns `true` iff `deadline` has been reached.
    fn expired(&self, deadline: Instant) -> bool;
}

/// Deadline far enough out that it never expires in practice.
///
/// `Instant + Duration` panics on overflow; callers passing
/// `Duration::MAX`-style timeouts get this cap instead.
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86400 * 365 * 30)
}

/// [`TimeService`] backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Creates a new monotonic clock.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TimeService for MonotonicClock {
    fn expected_end(&self, timeout: Duration) -> Instant {
        let now = Instant::now();
        now.checked_add(timeout).unwrap_or_else(|| far_future(now))
    }

    fn remaining(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }

    fn expired(&self, deadline: Instant) -> bool {
        Instant::now() >= deadline
    }
}

/// Manually advanced [`TimeService`] for deterministic tests.
///
/// The clock starts at an arbitrary anchor and only moves when
/// [`advance`](ManualClock::advance) is called. Timeout paths can then be
/// exercised exactly, without real sleeps.
pub struct ManualClock {
    anchor: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at its anchor instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::Release);
    }

    /// The clock's current reading.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.anchor + Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("offset_nanos", &self.offset_nanos.load(Ordering::Acquire))
            .finish()
    }
}

impl TimeService for ManualClock {
    fn expected_end(&self, timeout: Duration) -> Instant {
        let now = self.now();
        now.checked_add(timeout).unwrap_or_else(|| far_future(now))
    }

    fn remaining(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(self.now())
    }

    fn expired(&self, deadline: Instant) -> bool {
        self.now() >= deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn monotonic_deadline_is_in_the_future() {
        init_test("monotonic_deadline_is_in_the_future");
        let clock = MonotonicClock::new();
        let deadline = clock.expected_end(Duration::from_secs(60));
        crate::assert_with_log!(
            !clock.expired(deadline),
            "fresh deadline not expired",
            false,
            clock.expired(deadline)
        );
        let remaining = clock.remaining(deadline);
        crate::assert_with_log!(
            remaining > Duration::from_secs(59),
            "remaining close to timeout",
            true,
            remaining > Duration::from_secs(59)
        );
        crate::test_complete!("monotonic_deadline_is_in_the_future");
    }

    #[test]
    fn monotonic_zero_timeout_expires_immediately() {
        init_test("monotonic_zero_timeout_expires_immediately");
        let clock = MonotonicClock::new();
        let deadline = clock.expected_end(Duration::ZERO);
        crate::assert_with_log!(
            clock.expired(deadline),
            "zero timeout expired",
            true,
            clock.expired(deadline)
        );
        crate::assert_with_log!(
            clock.remaining(deadline) == Duration::ZERO,
            "remaining saturates to zero",
            Duration::ZERO,
            clock.remaining(deadline)
        );
        crate::test_complete!("monotonic_zero_timeout_expires_immediately");
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        init_test("huge_timeout_does_not_overflow");
        let clock = MonotonicClock::new();
        let deadline = clock.expected_end(Duration::MAX);
        crate::assert_with_log!(
            !clock.expired(deadline),
            "capped deadline not expired",
            false,
            clock.expired(deadline)
        );
        crate::test_complete!("huge_timeout_does_not_overflow");
    }

    #[test]
    fn manual_clock_only_moves_on_advance() {
        init_test("manual_clock_only_moves_on_advance");
        let clock = ManualClock::new();
        let deadline = clock.expected_end(Duration::from_millis(50));

        crate::assert_with_log!(
            !clock.expired(deadline),
            "not expired before advance",
            false,
            clock.expired(deadline)
        );
        crate::assert_with_log!(
            clock.remaining(deadline) == Duration::from_millis(50),
            "full timeout remaining",
            Duration::from_millis(50),
            clock.remaining(deadline)
        );

        clock.advance(Duration::from_millis(49));
        crate::assert_with_log!(
            !clock.expired(deadline),
            "not expired one tick early",
            false,
            clock.expired(deadline)
        );

        clock.advance(Duration::from_millis(1));
        crate::assert_with_log!(
            clock.expired(deadline),
            "expired at the deadline",
            true,
            clock.expired(deadline)
        );
        crate::assert_with_log!(
            clock.remaining(deadline) == Duration::ZERO,
            "remaining zero after expiry",
            Duration::ZERO,
            clock.remaining(deadline)
        );
        crate::test_complete!("manual_clock_only_moves_on_advance");
    }
}
