//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use std::time::Duration;

use rand::Rng;

/// First connect retry waits about this long
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Longest wait between connect attempts
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Exponential backoff with up to 25% random jitter.
///
/// `attempt` counts from 1; attempt 1 waits about `base`, each later attempt
/// doubles it, and the result never exceeds `max` before jitter.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(max);
    let jitter = rand::thread_rng().gen_range(0.0..=0.25);
    delay + delay.mul_f64(jitter)
}

/// Converts a duration to a floating-point number of seconds
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        for attempt in 1..=4 {
            let expected = BACKOFF_BASE * 2u32.pow(attempt - 1);
            let delay = backoff_delay(attempt, BACKOFF_BASE, BACKOFF_MAX);
            assert!(delay >= expected, "attempt {}: {:?}", attempt, delay);
            assert!(delay <= expected.mul_f64(1.25), "attempt {}: {:?}", attempt, delay);
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = backoff_delay(40, BACKOFF_BASE, BACKOFF_MAX);
        assert!(delay >= BACKOFF_MAX);
        assert!(delay <= BACKOFF_MAX.mul_f64(1.25));
        assert_eq!(backoff_delay(1, Duration::ZERO, BACKOFF_MAX), Duration::ZERO);
    }

    #[test]
    fn test_duration_conversion() {
        assert_eq!(duration_to_secs(Duration::from_millis(1500)), 1.5);
    }
}
