//! Reconnect backoff with jitter and a failure ceiling

use std::time::Duration;

use rand::Rng;

/// Reconnect policy for a watcher
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failure
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up (0 = never give up)
    pub max_consecutive_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_consecutive_failures: 10,
        }
    }
}

/// Running backoff state for one watcher
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
    delay: Duration,
}

impl Backoff {
    /// Fresh state for `config`
    pub fn new(config: BackoffConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            failures: 0,
            delay,
        }
    }

    /// Consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.config.initial_delay;
    }

    /// Forget previous failures when a stream stayed up for at least
    /// `max_delay`. Shorter runs keep counting toward the ceiling.
    pub fn record_uptime(&mut self, uptime: Duration) {
        if uptime >= self.config.max_delay {
            self.reset();
        }
    }

    /// Record a failure and return how long to wait before retrying.
    ///
    /// Returns `None` once the failure ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.config.max_consecutive_failures > 0
            && self.failures >= self.config.max_consecutive_failures
        {
            return None;
        }

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * jitter).min(self.config.max_delay.as_secs_f64()),
        );

        // Exponential backoff, capped at max_delay
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        Some(jittered)
    }
}
