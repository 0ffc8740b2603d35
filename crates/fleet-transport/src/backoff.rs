//! Exponential reconnection backoff with additive jitter.
//!
//! Attempt `n` waits `min(base * 2^n, cap)` plus a uniform jitter in
//! `[0, base)` so that a fleet losing the same peer does not retry in
//! lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.retry_delay(), config.max_retry_delay())
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Deterministic part of the wait before attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn jitter(&self) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..base_ms))
    }

    /// Wait for the current attempt, then advance the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt) + self.jitter();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
