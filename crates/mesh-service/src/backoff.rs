// SPDX-License-Identifier: Apache-2.0
//! Exponential backoff for peer dial retries (spec.md §4.6).

use std::time::Duration;

/// Delay before dial attempt number `attempt` (0-indexed), doubling from
/// `base` and capped at `max`.
#[must_use]
pub fn next_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.checked_mul(1u32 << attempt.min(16)).map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::next_delay;
    use std::time::Duration;

    #[test]
    fn doubles_each_attempt_until_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(next_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(next_delay(1, base, max), Duration::from_millis(200));
        assert_eq!(next_delay(2, base, max), Duration::from_millis(400));
        assert_eq!(next_delay(5, base, max), max);
    }
}
