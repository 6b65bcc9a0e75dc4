//! Exponential backoff with optional jitter.
//!
//! delay = min(base × 2^(attempt − 1), max), with the attempt number
//! clamped to a configured ceiling. Full jitter multiplies by U(0,1);
//! equal jitter by (0.5 + 0.5·U(0,1)).

use std::time::Duration;

use rand::Rng;

/// Jitter mode applied to the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
}

/// Compute the delay before retry `attempt` (1-based).
///
/// Attempt values of zero are treated as one; values above `max_attempts`
/// are clamped, so the result never exceeds `max_delay`.
pub fn calculate_backoff(
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
) -> Duration {
    let attempt = attempt.clamp(1, max_attempts.max(1));

    // Cap the exponent so the shift cannot overflow before the min().
    let exponent = (attempt - 1).min(63);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let delay = base_delay
        .checked_mul(factor.min(u32::MAX as u64) as u32)
        .unwrap_or(max_delay)
        .min(max_delay);

    match jitter {
        Jitter::None => delay,
        Jitter::Full => delay.mul_f64(rand::thread_rng().gen_range(0.0..1.0)),
        Jitter::Equal => delay.mul_f64(0.5 + 0.5 * rand::thread_rng().gen_range(0.0..1.0)),
    }
}

/// Backoff settings carried by dispatch retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: Jitter,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter: Jitter::None,
        }
    }
}

impl Backoff {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.max_attempts,
            self.base_delay,
            self.max_delay,
            self.jitter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(5);

    #[test]
    fn doubles_per_attempt_without_jitter() {
        assert_eq!(
            calculate_backoff(1, 10, BASE, MAX, Jitter::None),
            Duration::from_millis(100)
        );
        assert_eq!(
            calculate_backoff(2, 10, BASE, MAX, Jitter::None),
            Duration::from_millis(200)
        );
        assert_eq!(
            calculate_backoff(3, 10, BASE, MAX, Jitter::None),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn monotone_and_capped() {
        let mut last = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = calculate_backoff(attempt, 10, BASE, MAX, Jitter::None);
            assert!(delay >= last, "backoff must be non-decreasing");
            assert!(delay <= MAX);
            last = delay;
        }
    }

    #[test]
    fn attempts_beyond_ceiling_are_clamped() {
        let at_ceiling = calculate_backoff(10, 10, BASE, MAX, Jitter::None);
        let beyond = calculate_backoff(1000, 10, BASE, MAX, Jitter::None);
        assert_eq!(at_ceiling, beyond);
        assert!(beyond <= MAX);
    }

    #[test]
    fn zero_attempt_is_treated_as_first() {
        assert_eq!(
            calculate_backoff(0, 10, BASE, MAX, Jitter::None),
            calculate_backoff(1, 10, BASE, MAX, Jitter::None)
        );
    }

    #[test]
    fn huge_exponent_does_not_overflow() {
        let delay = calculate_backoff(64, 64, BASE, MAX, Jitter::None);
        assert_eq!(delay, MAX);
    }

    #[test]
    fn full_jitter_stays_below_the_deterministic_delay() {
        for _ in 0..100 {
            let jittered = calculate_backoff(4, 10, BASE, MAX, Jitter::Full);
            let plain = calculate_backoff(4, 10, BASE, MAX, Jitter::None);
            assert!(jittered <= plain);
        }
    }

    #[test]
    fn equal_jitter_stays_in_the_upper_half() {
        for _ in 0..100 {
            let jittered = calculate_backoff(4, 10, BASE, MAX, Jitter::Equal);
            let plain = calculate_backoff(4, 10, BASE, MAX, Jitter::None);
            assert!(jittered >= plain.mul_f64(0.5));
            assert!(jittered <= plain);
        }
    }
}
