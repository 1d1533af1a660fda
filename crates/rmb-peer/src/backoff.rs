use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Fraction of the nominal delay added or removed at random.
const JITTER: f64 = 0.25;

/// Reconnect delay schedule: grows by `factor` per attempt up to `max`,
/// with ±25% jitter so relay restarts don't see synchronized reconnects.
///
/// With the default configuration (`factor = 1.0`, `initial = max = 2s`)
/// this is a fixed, jittered two second pause.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
        )
    }
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use rmb_peer::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let mut backoff = ExponentialBackoff::new(
    ///     Duration::from_millis(2000),
    ///     Duration::from_millis(2000),
    ///     1.0,
    /// );
    /// let delay = backoff.next_delay();
    /// assert!(delay >= Duration::from_millis(1500));
    /// assert!(delay <= Duration::from_millis(2500));
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }

    /// Nominal delay of the next attempt, before jitter.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    /// Compute the next delay (with jitter) and advance the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let current_ms = u64::try_from(self.current.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);

        // float-to-int casts saturate, so neither product can overflow
        let jitter = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        let delay = Duration::from_millis((current_ms as f64 * jitter) as u64);

        let next_ms = (current_ms as f64 * self.factor) as u64;
        self.current = Duration::from_millis(next_ms.min(max_ms));

        delay
    }

    /// Reset the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(delay: Duration, nominal: Duration) -> bool {
        delay >= nominal.mul_f64(1.0 - JITTER) && delay <= nominal.mul_f64(1.0 + JITTER)
    }

    #[test]
    fn test_default_config_is_fixed_two_seconds() {
        let mut backoff = ExponentialBackoff::from(&ReconnectConfig::default());

        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(
                within_jitter(delay, Duration::from_secs(2)),
                "delay {delay:?} outside 2s ±25%"
            );
        }
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_delays_grow_until_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(800), 2.0);

        let nominals: Vec<Duration> = (0..6)
            .map(|_| {
                let n = backoff.current();
                backoff.next_delay();
                n
            })
            .collect();

        assert_eq!(
            nominals,
            [100, 200, 400, 800, 800, 800].map(Duration::from_millis)
        );
    }

    #[test]
    fn test_delays_never_exceed_max_with_jitter() {
        let max = Duration::from_millis(1000);
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), max, 3.0);

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= max.mul_f64(1.0 + JITTER), "{delay:?} exceeds max");
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let initial = Duration::from_millis(100);
        let mut backoff = ExponentialBackoff::new(initial, Duration::from_millis(5000), 2.0);

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_millis(5000));

        backoff.reset();
        assert_eq!(backoff.current(), initial);
        assert!(within_jitter(backoff.next_delay(), initial));
    }

    #[test]
    fn test_huge_max_does_not_overflow() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::MAX, 10.0);

        for _ in 0..100 {
            assert!(backoff.next_delay() > Duration::ZERO);
        }
    }
}
