//! Bounded record of recent errors with per-kind counters.

use std::collections::{HashMap, VecDeque};

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::errors::{AppError, ErrorKind, Severity};

/// Default number of errors retained.
pub const DEFAULT_HISTORY: usize = 100;

struct Inner {
    recent: VecDeque<AppError>,
    counts: HashMap<ErrorKind, u64>,
    total: u64,
}

/// Ring buffer of the most recent [`AppError`]s plus running counters.
///
/// Every recorded error is also emitted through `tracing` at a level derived
/// from its severity.
pub struct ErrorLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

/// Point-in-time counters from an [`ErrorLog`].
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStats {
    /// Errors recorded since creation.
    pub total: u64,
    /// Errors recorded, by kind.
    pub by_kind: HashMap<ErrorKind, u64>,
    /// Errors currently held in the ring buffer.
    pub retained: usize,
}

impl ErrorLog {
    /// Create a log retaining [`DEFAULT_HISTORY`] errors.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }

    /// Create a log retaining at most `capacity` errors (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                recent: VecDeque::with_capacity(capacity),
                counts: HashMap::new(),
                total: 0,
            }),
        }
    }

    /// Record an error, evicting the oldest when full.
    pub fn record(&self, err: &AppError) {
        emit(err);
        counter!("errors_total", "kind" => err.kind().to_string()).increment(1);

        let mut inner = self.inner.lock();
        if inner.recent.len() == self.capacity {
            let _ = inner.recent.pop_front();
        }
        inner.recent.push_back(err.clone());
        *inner.counts.entry(err.kind()).or_insert(0) += 1;
        inner.total += 1;
    }

    /// The `n` most recent errors, newest last.
    pub fn recent(&self, n: usize) -> Vec<AppError> {
        let inner = self.inner.lock();
        let skip = inner.recent.len().saturating_sub(n);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    /// Number of errors recorded for `kind`.
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.inner.lock().counts.get(&kind).copied().unwrap_or(0)
    }

    /// Snapshot of all counters.
    pub fn stats(&self) -> ErrorStats {
        let inner = self.inner.lock();
        ErrorStats {
            total: inner.total,
            by_kind: inner.counts.clone(),
            retained: inner.recent.len(),
        }
    }

    /// Log a one-line summary of the counters.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(total = stats.total, retained = stats.retained, by_kind = ?stats.by_kind, "error statistics");
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

fn emit(err: &AppError) {
    let kind = err.kind();
    let cause = err.cause_message();
    match err.severity() {
        Severity::Low => debug!(%kind, ?cause, "{}", err.message()),
        Severity::Medium => warn!(%kind, ?cause, "{}", err.message()),
        Severity::High => error!(%kind, ?cause, "{}", err.message()),
        Severity::Critical => error!(%kind, ?cause, critical = true, "{}", err.message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_counts_by_kind() {
        let log = ErrorLog::new();
        log.record(&AppError::network("a"));
        log.record(&AppError::network("b"));
        log.record(&AppError::validation("c"));
        assert_eq!(log.count(ErrorKind::Network), 2);
        assert_eq!(log.count(ErrorKind::Validation), 1);
        assert_eq!(log.count(ErrorKind::Config), 0);
        assert_eq!(log.stats().total, 3);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let log = ErrorLog::with_capacity(3);
        for i in 0..10 {
            log.record(&AppError::network(format!("e{i}")));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message(), "e7");
        assert_eq!(recent[2].message(), "e9");
        // counters keep counting past the buffer
        assert_eq!(log.stats().total, 10);
        assert_eq!(log.stats().retained, 3);
    }

    #[test]
    fn recent_returns_newest_n() {
        let log = ErrorLog::new();
        for i in 0..5 {
            log.record(&AppError::validation(format!("v{i}")));
        }
        let last_two: Vec<_> = log.recent(2).iter().map(|e| e.message().to_string()).collect();
        assert_eq!(last_two, vec!["v3", "v4"]);
    }

    #[test]
    fn zero_capacity_clamped() {
        let log = ErrorLog::with_capacity(0);
        log.record(&AppError::network("x"));
        assert_eq!(log.recent(5).len(), 1);
    }
}
