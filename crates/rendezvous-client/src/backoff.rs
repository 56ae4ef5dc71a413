use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Doubling delay calculator with symmetric jitter.
///
/// The un-jittered delay for attempt `n` is `min(base * 2^n, max)`; `next` then moves it
/// by up to `jitter * delay` in either direction, never below zero.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let jitter = if config.jitter.is_finite() {
            config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base: config.base,
            max: config.max.max(config.base),
            jitter,
            attempt: 0,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.jittered(self.base_delay(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Un-jittered delay the next call to [`next`](Self::next) is centred on.
    pub fn peek(&self) -> Duration {
        self.base_delay(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(base_ms: u64, max_ms: u64, jitter: f64) -> ExponentialBackoff {
        ExponentialBackoff::new(BackoffConfig {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter,
        })
    }

    #[test_timeout::timeout]
    fn unjittered_delay_doubles_until_capped() {
        let mut backoff = backoff(100, 1_000, 0.0);
        let delays: Vec<_> = (0..6).map(|_| backoff.next().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test_timeout::timeout]
    fn jittered_delay_stays_within_bounds() {
        let max = Duration::from_millis(5_000);
        let jitter = 0.5;
        let upper = max.as_secs_f64() * (1.0 + jitter);
        let mut backoff = backoff(250, 5_000, jitter);
        for attempt in 0..64u32 {
            let centre = backoff.base_delay(attempt).as_secs_f64();
            assert_eq!(
                backoff.base_delay(attempt),
                Duration::from_millis(250)
                    .checked_mul(2u32.saturating_pow(attempt))
                    .map_or(max, |d| d.min(max))
            );
            let delay = backoff.next().as_secs_f64();
            assert!(delay >= 0.0 && delay <= upper + 1e-6, "attempt {attempt}: {delay}");
            assert!((delay - centre).abs() <= centre * jitter + 1e-6);
        }
    }

    #[test_timeout::timeout]
    fn peek_does_not_advance_and_reset_restarts() {
        let mut backoff = backoff(1_000, 30_000, 0.2);
        assert_eq!(backoff.peek(), Duration::from_secs(1));
        assert_eq!(backoff.peek(), Duration::from_secs(1));
        backoff.next();
        backoff.next();
        assert_eq!(backoff.peek(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.peek(), Duration::from_secs(1));
    }

    #[test_timeout::timeout]
    fn out_of_range_jitter_is_clamped() {
        let mut backoff = backoff(100, 100, 7.0);
        for _ in 0..32 {
            assert!(backoff.next() <= Duration::from_millis(200));
        }
    }
}
