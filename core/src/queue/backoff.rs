//! Retry backoff
//!
//! Exponential delay, capped, with additive jitter. A server-imposed
//! retry-after acts as a floor so rate limits are always honored.

use std::time::Duration;

use rand::Rng;

/// Deterministic exponential delay for the given retry attempt
/// (1-based): `base * 2^(attempt-1)`, capped at `cap`.
pub fn base_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << shift);
    delay.min(cap)
}

/// Full backoff delay: exponential part plus up to 25% jitter, floored
/// by a server-imposed retry-after when present.
pub fn backoff_delay(
    attempt: u32,
    base: Duration,
    cap: Duration,
    floor: Option<Duration>,
) -> Duration {
    let delay = base_delay(attempt, base, cap);
    let jitter_max = (delay / 4).as_millis() as u64;
    let jitter = if jitter_max > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_max))
    } else {
        Duration::ZERO
    };
    let jittered = delay + jitter;
    match floor {
        Some(floor) => jittered.max(floor),
        None => jittered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(500);
    const CAP: Duration = Duration::from_secs(30);

    #[test]
    fn test_base_delay_doubles() {
        assert_eq!(base_delay(1, BASE, CAP), Duration::from_millis(500));
        assert_eq!(base_delay(2, BASE, CAP), Duration::from_millis(1000));
        assert_eq!(base_delay(3, BASE, CAP), Duration::from_millis(2000));
        assert_eq!(base_delay(4, BASE, CAP), Duration::from_millis(4000));
    }

    #[test]
    fn test_base_delay_strictly_increasing_until_cap() {
        let mut prev = Duration::ZERO;
        for attempt in 1..=6 {
            let delay = base_delay(attempt, BASE, CAP);
            assert!(delay > prev, "attempt {} not increasing", attempt);
            prev = delay;
        }
    }

    #[test]
    fn test_base_delay_capped() {
        assert_eq!(base_delay(10, BASE, CAP), CAP);
        assert_eq!(base_delay(64, BASE, CAP), CAP);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let delay = base_delay(u32::MAX, BASE, CAP);
        assert_eq!(delay, CAP);
    }

    #[test]
    fn test_jitter_bounded() {
        for attempt in 1..=8 {
            let expected = base_delay(attempt, BASE, CAP);
            for _ in 0..16 {
                let delay = backoff_delay(attempt, BASE, CAP, None);
                assert!(delay >= expected);
                assert!(delay <= expected + expected / 4);
            }
        }
    }

    #[test]
    fn test_retry_after_floor_is_honored() {
        let floor = Duration::from_secs(5);
        let delay = backoff_delay(1, BASE, CAP, Some(floor));
        assert!(delay >= floor);
    }

    #[test]
    fn test_floor_below_backoff_changes_nothing() {
        let floor = Duration::from_millis(1);
        let delay = backoff_delay(3, BASE, CAP, Some(floor));
        assert!(delay >= base_delay(3, BASE, CAP));
    }
}
