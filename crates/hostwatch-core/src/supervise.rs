//! Panic-isolating supervision for background tasks.
//!
//! A supervised task runs inside its own tokio task. If it panics, the panic
//! is recorded as a critical [`ErrorKind::System`] error and the task is
//! restarted after [`RESTART_DELAY`], unless the cancellation token has fired.
//! A task that returns normally is not restarted.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error_log::ErrorLog;
use crate::errors::{AppError, ErrorKind, Severity};

/// Pause between a panic and the restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Aborts the wrapped task when dropped, so aborting a supervisor also stops
/// the task it is watching.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn `factory()` under supervision.
///
/// `factory` is called again for every restart, so it must build a fresh
/// future each time.
pub fn supervise<F, Fut>(
    name: &'static str,
    errors: Arc<ErrorLog>,
    cancel: CancellationToken,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let mut task = AbortOnDrop(tokio::spawn(factory()));
            match (&mut task.0).await {
                Ok(()) => {
                    debug!(task = name, "supervised task finished");
                    break;
                }
                Err(e) if e.is_panic() => {
                    let reason = panic_message(e.into_panic().as_ref());
                    errors.record(&AppError::new(
                        ErrorKind::System,
                        Severity::Critical,
                        format!("task {name} panicked: {reason}"),
                    ));
                    counter!("task_panics_total", "task" => name).increment(1);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RESTART_DELAY) => {}
                    }
                    debug!(task = name, "restarting supervised task");
                }
                Err(_) => break,
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn normal_completion_not_restarted() {
        let errors = Arc::new(ErrorLog::new());
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = supervise("once", errors.clone(), CancellationToken::new(), move || {
            let counter = counter.clone();
            async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(errors.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_recorded_and_restarted() {
        let errors = Arc::new(ErrorLog::new());
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = supervise("flaky", errors.clone(), CancellationToken::new(), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                assert!(n >= 2, "boom {n}");
            }
        });
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(errors.count(ErrorKind::System), 2);
        let last = errors.recent(1).pop().unwrap();
        assert_eq!(last.severity(), Severity::Critical);
        assert!(last.message().contains("flaky"));
        assert!(last.message().contains("boom 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_restart_loop() {
        let errors = Arc::new(ErrorLog::new());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = supervise("always-panics", errors.clone(), cancel.clone(), move || {
            let token = token.clone();
            async move {
                token.cancel();
                panic!("down");
            }
        });
        handle.await.unwrap();
        assert_eq!(errors.count(ErrorKind::System), 1);
    }

    #[test]
    fn panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
