//! Backoff and jitter policies for arbor background pipelines.
//!
//! The archival and removal pipelines retry failed storage writes with
//! randomized sleeps so that many cells recovering at once do not hammer the
//! storage service in lockstep. This crate provides:
//! - [`BackoffConfig`] - strategy (exponential, linear, constant) with a cap
//! - [`jittered_between`] - a uniformly random delay inside a window, the
//!   shape used between archival attempts
//! - [`BackoffState`] - per-pipeline attempt bookkeeping
//!
//! # Example
//!
//! ```
//! use arbor_retry::{BackoffConfig, BackoffStrategy, delay_for_attempt};
//! use std::time::Duration;
//!
//! let config = BackoffConfig {
//!     strategy: BackoffStrategy::Exponential,
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(30),
//!     jitter: 0.0,
//! };
//! assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(4));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for one backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Base delay for the first attempt.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Cap applied after growth.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Jitter factor: the final delay is scaled by a uniform factor in
    /// `[1 - jitter, 1 + jitter]`. Zero disables jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Computes the delay before the given 1-indexed attempt.
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        BackoffStrategy::Constant => config.base_delay,
    };

    let capped = raw.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Scales a delay by a uniform factor in `[1 - jitter, 1 + jitter]`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
    let millis = (delay.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// A uniformly random delay in `[min, max]`.
///
/// This is the sleep shape between archival retries: not growing, just
/// spread across the window so recovering cells desynchronize.
pub fn jittered_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::random_range(0..=span))
}

/// Attempt bookkeeping for one retried pipeline step.
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Registers a failure and returns the delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        delay_for_attempt(&self.config, self.attempt)
    }

    /// Resets the state after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
