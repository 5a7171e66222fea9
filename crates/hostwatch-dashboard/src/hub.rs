//! Browser fan-out.
//!
//! Every browser session owns a bounded outbound channel. The hub serializes
//! the fleet view once per tick and hands the same `Arc<String>` to each
//! session with `try_send`, so a stalled browser loses frames instead of
//! holding up the push loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use hostwatch_core::protocol::FrontendMessage;
use hostwatch_core::{AppError, ErrorKind, ErrorLog, Severity, now_unix};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{FRONTEND_BROADCASTS_TOTAL, FRONTEND_DROPPED_TOTAL, FRONTEND_SESSIONS_ACTIVE};
use crate::store::SnapshotStore;

/// Outbound buffer per browser.
pub const BROWSER_CHANNEL_CAPACITY: usize = 64;

/// One connected browser.
pub struct BrowserSession {
    /// Unique session id.
    pub id: String,
    tx: mpsc::Sender<Arc<String>>,
    /// When the browser connected.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped: AtomicU64,
}

impl BrowserSession {
    /// Create a session writing into `tx`.
    pub fn new(id: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame. Returns `false` and counts a drop when the channel is
    /// full or closed.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Frames dropped for this session.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record a pong (or any control frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong, or since connect.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Read and clear the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }
}

/// Hub counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Connected browsers.
    pub sessions: usize,
    /// Pushes performed.
    pub broadcasts: u64,
    /// Frames dropped on full channels.
    pub dropped: u64,
    /// Unparseable browser messages.
    pub invalid_messages: u64,
}

/// Browser session set plus the periodic push.
pub struct BroadcastHub {
    sessions: RwLock<HashMap<String, Arc<BrowserSession>>>,
    store: Arc<SnapshotStore>,
    errors: Arc<ErrorLog>,
    report_max_secs: i64,
    broadcasts: AtomicU64,
    dropped: AtomicU64,
    invalid: AtomicU64,
}

impl BroadcastHub {
    /// Create a hub reading from `store`. Hosts silent for more than
    /// `report_max_secs` are shown offline.
    pub fn new(store: Arc<SnapshotStore>, errors: Arc<ErrorLog>, report_max_secs: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            errors,
            report_max_secs,
            broadcasts: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
        }
    }

    /// Register a session and push the current view to it right away.
    pub fn add(&self, session: Arc<BrowserSession>) {
        let frame = self.encode(now_unix());
        let replaced = self
            .sessions
            .write()
            .insert(session.id.clone(), session.clone());
        if replaced.is_none() {
            gauge!(FRONTEND_SESSIONS_ACTIVE).increment(1.0);
        }
        if let Some(frame) = frame {
            let _ = self.deliver(&session, frame);
        }
    }

    /// Unregister a session.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            gauge!(FRONTEND_SESSIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Drop every session. Their channels close once the session tasks exit.
    pub fn clear(&self) {
        let n = {
            let mut sessions = self.sessions.write();
            let n = sessions.len();
            sessions.clear();
            n
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!(FRONTEND_SESSIONS_ACTIVE).decrement(n as f64);
    }

    /// Aggregated fleet view as of `now`.
    pub fn build_view(&self, now: i64) -> FrontendMessage {
        FrontendMessage::ServerStatusUpdate {
            data: self.store.status_views(now, self.report_max_secs),
            timestamp: now,
        }
    }

    fn encode(&self, now: i64) -> Option<Arc<String>> {
        match serde_json::to_string(&self.build_view(now)) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!(error = %e, "failed to serialize status update");
                None
            }
        }
    }

    fn deliver(&self, session: &BrowserSession, frame: Arc<String>) -> bool {
        if session.send(frame) {
            return true;
        }
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!(FRONTEND_DROPPED_TOTAL).increment(1);
        debug!(session = %session.id, "browser channel full, frame dropped");
        false
    }

    /// Push the current view to every session. Returns the number of
    /// sessions that accepted the frame; 0 without doing any work when
    /// nobody is connected.
    pub fn broadcast(&self) -> usize {
        if self.session_count() == 0 {
            return 0;
        }
        let Some(frame) = self.encode(now_unix()) else {
            return 0;
        };
        let recipients: Vec<Arc<BrowserSession>> = self.sessions.read().values().cloned().collect();
        let delivered = recipients
            .iter()
            .filter(|s| self.deliver(s, frame.clone()))
            .count();
        let _ = self.broadcasts.fetch_add(1, Ordering::Relaxed);
        counter!(FRONTEND_BROADCASTS_TOTAL).increment(1);
        delivered
    }

    /// Handle one text message from a browser.
    pub fn handle_client_text(&self, session: &BrowserSession, text: &str) {
        match serde_json::from_str::<FrontendMessage>(text) {
            Ok(FrontendMessage::Ping) => {
                let pong = FrontendMessage::Pong {
                    timestamp: now_unix(),
                };
                if let Ok(json) = serde_json::to_string(&pong) {
                    let _ = self.deliver(session, Arc::new(json));
                }
            }
            Ok(other) => debug!(session = %session.id, message = ?other, "ignoring browser message"),
            Err(e) => {
                let _ = self.invalid.fetch_add(1, Ordering::Relaxed);
                self.errors.record(&AppError::wrap(
                    ErrorKind::Validation,
                    Severity::Low,
                    format!("invalid message from browser {}", session.id),
                    e,
                ));
            }
        }
    }

    /// Broadcast every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let _ = self.broadcast();
        }
    }

    /// Connected browsers.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Counters.
    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.session_count(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            invalid_messages: self.invalid.load(Ordering::Relaxed),
        }
    }
}
