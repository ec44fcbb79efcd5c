//! Exponential backoff for reconnection

use std::time::Duration;

use hawser_core::config::BackoffConfig;

/// Exponential backoff for reconnection attempts.
///
/// Delays grow by the configured multiplier up to the cap and never
/// shrink between resets, so an operator reading the log can tell how
/// long an outage has lasted from the current delay alone.
pub struct ExponentialBackoff {
    /// Delay for the next attempt
    current: Duration,
    /// Delay after a reset
    initial: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier applied after each attempt
    multiplier: f64,
    /// Attempts since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: initial,
            initial,
            max,
            // A multiplier below 1.0 would shrink delays
            multiplier: multiplier.max(1.0),
            attempts: 0,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);

        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        delay
    }

    /// Attempts taken since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Return to the initial delay after a successful connect
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}
