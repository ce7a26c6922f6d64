//! Reconnect backoff: capped exponential delay with bounded jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

/// Fraction of the base delay added as uniform jitter.
pub const JITTER_RATIO: f64 = 0.2;

/// Attempt exponent is clamped so `2^n` always fits.
const MAX_EXPONENT: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, jitter_ratio: JITTER_RATIO }
    }

    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.reconnect_interval, config.reconnect_cap)
    }

    /// `min(base * 2^(attempt-1), cap)` for a 1-based attempt number.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let factor = f64::from(2_u32.pow(exponent));
        let secs = (self.base.as_secs_f64() * factor).min(self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Base delay plus jitter drawn from `[0, jitter_ratio * base)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let spread = base.as_secs_f64() * self.jitter_ratio;
        if spread <= 0.0 {
            return base;
        }
        base + Duration::from_secs_f64(rng.random_range(0.0..spread))
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
