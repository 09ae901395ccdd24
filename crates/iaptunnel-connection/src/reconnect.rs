//! Reconnection logic with exponential backoff and jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::duration_ms;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(with = "duration_ms", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    pub jitter: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(6),
        }
    }
}

impl ReconnectConfig {
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Longest total time spent waiting across every attempt
    ///
    /// `None` when attempts are unlimited.
    pub fn max_total_backoff(&self) -> Option<Duration> {
        let attempts = self.max_attempts?;
        let mut backoff = self.initial_backoff;
        let mut total = Duration::ZERO;
        for _ in 0..attempts {
            total += backoff.mul_f64(1.0 + self.jitter.max(0.0));
            backoff = next_backoff(backoff, self.multiplier, self.max_backoff);
        }
        Some(total)
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),
}

/// Backoff state consulted by the connection driver between resume attempts
#[derive(Debug)]
pub struct Reconnector {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Reconnector {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Start the next attempt and return how long to wait before it
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt >= max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(self.attempt));
            }
        }

        self.attempt += 1;

        let delay = self.jittered(self.current_backoff);
        self.current_backoff = next_backoff(
            self.current_backoff,
            self.config.multiplier,
            self.config.max_backoff,
        );

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );

        Ok(delay)
    }

    /// Reset backoff (call after a successful resume)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get the un-jittered backoff for the next attempt
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return backoff;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        backoff.mul_f64(factor)
    }
}

fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::from_secs_f64(current.as_secs_f64() * multiplier).min(max)
}
