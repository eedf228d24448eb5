//! Retry with exponential backoff.
//!
//! [`RetryPolicy::backoff`] is a pure delay computation. The policy also
//! implements [`backon::BackoffBuilder`], which is how the fallback chain
//! drives its per-backend retry loop: the built iterator yields one delay
//! per permitted retry, so `max_retries` bounds the attempts beyond the
//! first.

use backon::BackoffBuilder;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{option_duration_secs, ConfigError};

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.5;

/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.5;

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,

    /// Delay before the first retry, in seconds
    pub backoff_base: f64,

    /// Growth factor per retry
    pub backoff_multiplier: f64,

    /// Scale each delay by a uniform factor in [0.5, 1.5]
    pub jitter: bool,

    /// Upper bound applied after jitter
    #[serde(
        default,
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: 1.0,
            backoff_multiplier: 2.0,
            jitter: true,
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: f64, multiplier: f64) -> Self {
        self.backoff_base = base;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_base.is_finite() || self.backoff_base < 0.0 {
            return Err(ConfigError::invalid(
                "backoff_base",
                format!("must be a non-negative number of seconds, got {}", self.backoff_base),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be at least 1.0, got {}", self.backoff_multiplier),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `base * multiplier^attempt`, scaled by a random factor in
    /// [`JITTER_MIN`, `JITTER_MAX`] when jitter is on.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.backoff_base * self.backoff_multiplier.powi(exponent);
        if self.jitter {
            secs *= rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        }

        let delay = if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        };

        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl BackoffBuilder for RetryPolicy {
    type Backoff = RetryBackoff;

    fn build(self) -> Self::Backoff {
        RetryBackoff {
            policy: self,
            attempt: 0,
        }
    }
}

/// Delays for one retry loop, produced by [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Iterator for RetryBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.backoff(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
