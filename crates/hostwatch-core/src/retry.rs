//! Retry policy and the async retry executor.
//!
//! - [`RetryPolicy`]: attempt budget and exponential backoff parameters
//! - [`RetryExecutor`]: runs a fallible async operation under a policy,
//!   recording every failure and honouring cancellation at each wait

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error_log::ErrorLog;
use crate::errors::{AppError, ErrorKind, Severity};

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
/// Default delay ceiling, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
/// Default growth factor between retries.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Retry budget and backoff shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in ms (default: 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay ceiling in ms (default: 60000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per retry (default: 2.0).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (zero-based).
    ///
    /// `min(max_delay, initial_delay * factor^attempt)`
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let exp = attempt.min(1024) as i32;
        let raw = self.initial_delay_ms as f64 * factor.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The cancellation token fired before or between attempts.
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
    /// The operation failed and was not retried further.
    #[error("operation failed after {attempts} attempt(s): {last}")]
    Failed {
        /// Attempts made.
        attempts: u32,
        /// The last recorded failure.
        last: AppError,
    },
}

impl RetryError {
    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Runs async operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    errors: Arc<ErrorLog>,
}

impl RetryExecutor {
    /// Create an executor that records failures into `errors`.
    pub fn new(policy: RetryPolicy, errors: Arc<ErrorLog>) -> Self {
        Self { policy, errors }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails non-retryably, exhausts the attempt
    /// budget, or `cancel` fires.
    ///
    /// Each failure is wrapped as an [`AppError`] of `kind` and recorded.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        kind: ErrorKind,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }

            let result = tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                r = op() => r,
            };
            attempt += 1;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => AppError::wrap(
                    kind,
                    Severity::Medium,
                    format!("attempt {attempt}/{max_attempts} failed"),
                    e,
                ),
            };
            self.errors.record(&err);

            if !err.retryable() || attempt >= max_attempts {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            debug!(attempt, delay_ms = delay.as_millis(), "retrying after backoff");
            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
