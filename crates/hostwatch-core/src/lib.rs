//! # hostwatch-core
//!
//! Building blocks shared by the agent and the dashboard:
//!
//! - [`errors`]: classified [`AppError`] with derived retryability
//! - [`error_log`]: bounded recent-error history with per-kind counters
//! - [`retry`]: [`RetryPolicy`] and the cancellable [`RetryExecutor`]
//! - [`snapshot`]: the metric [`Snapshot`] wire type and [`StatusView`]
//! - [`protocol`]: handshake headers and browser message envelope
//! - [`supervise`]: panic-isolating task supervision
//! - [`shutdown`]: cancellation plus exactly-once close
//! - [`logging`]: tracing subscriber setup

#![deny(unsafe_code)]

pub mod error_log;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod shutdown;
pub mod snapshot;
pub mod supervise;

pub use error_log::{ErrorLog, ErrorStats};
pub use errors::{AppError, ErrorKind, Severity, is_retryable};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
pub use shutdown::ShutdownCoordinator;
pub use snapshot::{Snapshot, StatusView};
pub use supervise::supervise;

/// Current time as unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
