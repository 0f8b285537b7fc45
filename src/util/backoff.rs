use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Delays are jittered by up to this fraction of the base delay in either direction.
pub const RANDOM_FACTOR: f64 = 0.5;

/// Exponential backoff with jitter for reconnect attempts.
///
/// The first delay after a reset is zero; every following delay grows by
/// `backoff_factor` until it reaches `max_delay`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    current_base: Duration,
    rng: StdRng,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_DELAY)
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        Self::with_rng(initial_delay, backoff_factor, max_delay, StdRng::from_entropy())
    }

    pub fn with_rng(initial_delay: Duration, backoff_factor: f64, max_delay: Duration, rng: StdRng) -> Self {
        Self {
            initial_delay,
            backoff_factor,
            max_delay,
            current_base: Duration::ZERO,
            rng,
        }
    }

    /// Delay to wait before the next attempt; advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let base_millis = self.current_base.as_millis() as f64;
        let jitter = (self.rng.gen::<f64>() - 0.5) * 2.0 * RANDOM_FACTOR * base_millis;
        let delay = Duration::from_millis((base_millis + jitter).max(0.0).round() as u64);
        if !self.current_base.is_zero() {
            debug!(
                "Backing off for {} ms (base delay {} ms)",
                delay.as_millis(),
                self.current_base.as_millis()
            );
        }

        let next = self.current_base.mul_f64(self.backoff_factor);
        self.current_base = next.clamp(self.initial_delay, self.max_delay);
        delay
    }

    /// The next attempt happens immediately.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// The next attempt waits the maximum delay, used when the server is overloaded.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(seed: u64) -> ExponentialBackoff {
        ExponentialBackoff::with_rng(
            Duration::from_millis(1_000),
            2.0,
            Duration::from_millis(10_000),
            StdRng::seed_from_u64(seed),
        )
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = backoff(7);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_millis(1_000));
    }

    #[test]
    fn delays_grow_within_jitter_bounds_and_cap() {
        let mut backoff = backoff(42);
        backoff.next_delay();
        let mut expected_base = 1_000u64;
        for _ in 0..8 {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(delay >= expected_base / 2 && delay <= expected_base * 3 / 2, "{delay} vs {expected_base}");
            expected_base = (expected_base * 2).min(10_000);
        }
        assert_eq!(backoff.current_base(), Duration::from_millis(10_000));
    }

    #[test]
    fn seeded_backoff_is_deterministic() {
        let mut left = backoff(3);
        let mut right = backoff(3);
        let left: Vec<Duration> = (0..5).map(|_| left.next_delay()).collect();
        let right: Vec<Duration> = (0..5).map(|_| right.next_delay()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn reset_to_max_jumps_to_the_cap() {
        let mut backoff = backoff(1);
        backoff.reset_to_max();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(5_000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
