//! Cooperative shutdown: one cancellation signal per manager, a guarded
//! close flag, and a bounded wait for background tasks.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time allowed for tracked tasks to finish.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause between signalling cancellation and closing resources.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Owns a manager's cancellation signal and its exactly-once close flag.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    closed: Mutex<bool>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with [`DEFAULT_GRACE_PERIOD`].
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE_PERIOD)
    }

    /// Create a coordinator with a custom grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            closed: Mutex::new(false),
            grace,
        }
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether cancellation has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether [`begin_close`](Self::begin_close) has already succeeded.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Claim the close. Returns `true` exactly once; the winner cancels the
    /// token and is responsible for releasing resources.
    pub fn begin_close(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        drop(closed);
        self.token.cancel();
        true
    }

    /// Sleep for the grace period so loops can observe the cancellation.
    pub async fn grace(&self) {
        tokio::time::sleep(self.grace).await;
    }

    /// Wait up to `timeout` for `handles`, then abort stragglers.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        info!(
            task_count = handles.len(),
            timeout_ms = timeout.as_millis(),
            "waiting for tasks to complete"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let all = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_close_wins_once() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_closed());
        assert!(coord.begin_close());
        assert!(!coord.begin_close());
        assert!(coord.is_closed());
        assert!(coord.is_shutting_down());
    }

    #[test]
    fn token_clones_observe_cancel() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        let _ = coord.begin_close();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });
        let _ = coord.begin_close();
        coord.drain(vec![handle], Some(Duration::from_secs(1))).await;
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stuck_tasks() {
        let coord = ShutdownCoordinator::new();
        let stuck = tokio::spawn(std::future::pending::<()>());
        let abort = stuck.abort_handle();
        coord.drain(vec![stuck], Some(Duration::from_millis(50))).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }
}
