//! File watcher that reports settings changes.
//!
//! The parent directory is watched rather than the file itself so that
//! editors which replace the file on save are still observed. Bursts of
//! events are coalesced into one notification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::Result;

/// Quiet period used to coalesce bursts of file events.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches one settings file.
pub struct SettingsWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<()>,
    path: PathBuf,
}

impl SettingsWatcher {
    /// Start watching `path`.
    pub fn new(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let file_name = path.file_name().map(ToOwned::to_owned);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if relevant && (event.kind.is_modify() || event.kind.is_create()) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "settings watcher error"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!(?path, "watching settings file");

        Ok(Self {
            _watcher: watcher,
            rx,
            path,
        })
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next change. Returns `None` if the watcher stopped.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await?;
        loop {
            match tokio::time::timeout(DEBOUNCE, self.rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) | Err(_) => return Some(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_file_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.json");
        std::fs::write(&path, "{}").unwrap();

        let mut watcher = SettingsWatcher::new(&path).unwrap();
        assert_eq!(watcher.path(), path.as_path());

        std::fs::write(&path, r#"{"port": 9000}"#).unwrap();
        let changed = tokio::time::timeout(Duration::from_secs(5), watcher.changed()).await;
        assert_eq!(changed.ok().flatten(), Some(()));
    }
}
