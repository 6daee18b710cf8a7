//! Monotonic time helpers for stall tracking and receive-duration measurement.

use std::time::{Duration, Instant};

/// Microseconds between two monotonic samples, saturating at zero when the clock steps
/// backwards across suspend.
#[must_use]
pub fn diff_usecs(start: Instant, finish: Instant) -> u64 {
    finish
        .checked_duration_since(start)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

/// True when `last_activity` is older than `timeout` relative to `now`.
#[must_use]
pub fn is_stalled(now: Instant, last_activity: Instant, timeout: Duration) -> bool {
    now.checked_duration_since(last_activity)
        .map_or(false, |idle| idle > timeout)
}

#[cfg(test)]
mod tests {
    use super::{diff_usecs, is_stalled};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::{Duration, Instant};

    #[rstest]
    fn diff_is_zero_for_reversed_samples() {
        let now = Instant::now();
        let later = now + Duration::from_millis(5);
        assert_that!(diff_usecs(later, now), eq(0));
        assert_that!(diff_usecs(now, later), eq(5000));
    }

    #[rstest]
    fn stall_requires_timeout_to_elapse() {
        let now = Instant::now();
        let recent = now - Duration::from_millis(100);
        let old = now - Duration::from_secs(3);
        let timeout = Duration::from_secs(1);
        assert_that!(is_stalled(now, recent, timeout), eq(false));
        assert_that!(is_stalled(now, old, timeout), eq(true));
    }
}
