//! Attempt counter over a fixed window.
//!
//! Owned by whatever needs limiting (the wallet holds one per operation),
//! never global, so tests get a fresh limiter per case and can [`reset`]
//! one explicitly.
//!
//! [`reset`]: RateLimiter::reset

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::RateLimitConfig;
use crate::error::WalletError;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    count: u32,
    window_start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            count: 0,
            window_start: None,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_secs(config.window_secs))
    }

    /// Record an attempt at `now`, failing with the remaining cooldown when
    /// the window's budget is spent.
    pub fn check_at(&mut self, now: Instant) -> Result<(), WalletError> {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < self.window => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
        if self.count >= self.max_attempts {
            let remaining_secs = self.remaining_at(now).as_secs().max(1);
            warn!(remaining_secs, "rate limit reached");
            return Err(WalletError::RateLimited { remaining_secs });
        }
        self.count += 1;
        Ok(())
    }

    pub fn check(&mut self) -> Result<(), WalletError> {
        self.check_at(Instant::now())
    }

    /// Time until the current window closes.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.window_start {
            Some(start) => self.window.saturating_sub(now.saturating_duration_since(start)),
            None => Duration::ZERO,
        }
    }

    /// Attempts left in the current window.
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.count)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }
}
