//! Agent-facing session registry.
//!
//! Owns the bidirectional identity ↔ session index. Both maps live behind a
//! single mutex so every mutation leaves them consistent, and at most one
//! session per identity is ever indexed: admitting a new session for an
//! identity evicts the old one in the same critical section.
//!
//! Errors are recorded into the [`ErrorLog`] only after the index lock is
//! released.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hostwatch_core::{AppError, ErrorKind, ErrorLog, Severity, Snapshot, now_unix};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{
    AGENT_AUTH_FAILURES_TOTAL, AGENT_CONNECTIONS_TOTAL, AGENT_EVICTIONS_TOTAL,
    AGENT_MESSAGE_ERRORS_TOTAL, AGENT_MESSAGES_TOTAL, AGENT_SESSIONS_ACTIVE,
};
use crate::roster::{Roster, RosterEntry};
use crate::store::SnapshotStore;

// ─────────────────────────────────────────────────────────────────────────────
// Session handles
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque, monotonically assigned session key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionToken(u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Why the registry closed a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// A newer connection for the same identity was admitted.
    Replaced,
    /// No message or heartbeat within the timeout.
    HeartbeatTimeout,
    /// The identity was removed from the roster.
    Removed,
    /// The dashboard is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Close-frame text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced by a newer connection",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::Removed => "identity removed",
            Self::Shutdown => "server shutting down",
        }
    }
}

/// Kill switch shared between the registry and one session task.
#[derive(Debug, Default)]
pub struct SessionControl {
    kill: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl SessionControl {
    /// Ask the session task to close. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.kill.cancel();
    }

    /// Whether a close was requested.
    pub fn is_closed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Resolves once a close is requested.
    pub async fn closed(&self) -> CloseReason {
        self.kill.cancelled().await;
        self.reason.get().copied().unwrap_or(CloseReason::Shutdown)
    }
}

/// What a session task receives when admitted.
#[derive(Debug)]
pub struct Admission {
    /// Index key for every later call.
    pub token: SessionToken,
    /// Authenticated identity.
    pub identity: String,
    /// Kill switch.
    pub control: Arc<SessionControl>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection info
// ─────────────────────────────────────────────────────────────────────────────

/// Connection state as reported in diagnostics.
///
/// Only `Connected` sessions are indexed. When a session ends without being
/// replaced, its last info is kept per identity with one of the other two
/// states until that identity connects again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Indexed and live.
    Connected,
    /// Closed by the dashboard for good: identity removed or shutdown.
    Disconnected,
    /// Dropped or timed out while still authorized; the agent's transport
    /// is expected to dial back.
    Reconnecting,
}

/// Per-session diagnostics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Identity.
    pub server_id: String,
    /// Session key.
    pub session: SessionToken,
    /// State.
    pub status: ConnectionStatus,
    /// Unix seconds at admission.
    pub connected_at: i64,
    /// Unix seconds of the last ping/pong; 0 if none.
    pub last_heartbeat: i64,
    /// Unix seconds of the last accepted report; 0 if none.
    pub last_message: i64,
    /// Peer address.
    pub remote_addr: Option<String>,
    /// Reports accepted.
    pub message_count: u64,
    /// Frames rejected.
    pub error_count: u64,
}

struct SessionEntry {
    info: ConnectionInfo,
    control: Arc<SessionControl>,
    last_activity: Instant,
}

#[derive(Default)]
struct Index {
    by_identity: HashMap<String, SessionToken>,
    by_session: HashMap<SessionToken, SessionEntry>,
    departed: HashMap<String, ConnectionInfo>,
}

impl Index {
    /// Remove `token` and its identity mapping if it still points here.
    fn remove_session(&mut self, token: SessionToken) -> Option<SessionEntry> {
        let entry = self.by_session.remove(&token)?;
        if self.by_identity.get(&entry.info.server_id) == Some(&token) {
            let _ = self.by_identity.remove(&entry.info.server_id);
        }
        Some(entry)
    }

    /// Remove `token` and remember its info under `status`, unless a newer
    /// session already holds the identity.
    fn retire(&mut self, token: SessionToken, status: ConnectionStatus) -> Option<SessionEntry> {
        let entry = self.remove_session(token)?;
        if !self.by_identity.contains_key(&entry.info.server_id) {
            let mut info = entry.info.clone();
            info.status = status;
            let _ = self.departed.insert(info.server_id.clone(), info);
        }
        Some(entry)
    }
}

/// Aggregate counters plus per-session info.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Sessions ever admitted.
    pub total_connections: u64,
    /// Sessions currently indexed.
    pub active_connections: usize,
    /// Reports accepted.
    pub total_messages: u64,
    /// Frames rejected plus failed handshakes.
    pub total_errors: u64,
    /// One entry per identity, live or departed, sorted by identity.
    pub sessions: Vec<ConnectionInfo>,
}

/// Outcome of [`AgentSessionRegistry::on_message`].
#[derive(Debug, PartialEq, Eq)]
pub enum Ingest {
    /// Stored for the given identity.
    Stored(String),
    /// Not a valid snapshot; the connection stays open.
    Invalid,
    /// The session is no longer indexed.
    UnknownSession,
    /// The identity is no longer in the roster.
    UnknownIdentity,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Inbound agent session manager.
pub struct AgentSessionRegistry {
    roster: Arc<dyn Roster>,
    store: Arc<SnapshotStore>,
    errors: Arc<ErrorLog>,
    index: Mutex<Index>,
    next_token: AtomicU64,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    total_errors: AtomicU64,
}

impl AgentSessionRegistry {
    /// Create an empty registry.
    pub fn new(roster: Arc<dyn Roster>, store: Arc<SnapshotStore>, errors: Arc<ErrorLog>) -> Self {
        Self {
            roster,
            store,
            errors,
            index: Mutex::new(Index::default()),
            next_token: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Check credentials against the roster. Empty values never match.
    pub fn authenticate(&self, secret: &str, identity: &str) -> Result<RosterEntry, AppError> {
        if secret.is_empty() || identity.is_empty() {
            return Err(AppError::authentication("missing credentials"));
        }
        match self.roster.lookup(identity) {
            Some(entry) if entry.secret == secret => Ok(entry),
            Some(_) => Err(AppError::authentication(format!("bad secret for {identity}"))),
            None => Err(AppError::authentication(format!("unknown server id {identity}"))),
        }
    }

    /// Record a rejected handshake.
    pub fn reject(&self, err: &AppError) {
        let _ = self.total_errors.fetch_add(1, Ordering::Relaxed);
        counter!(AGENT_AUTH_FAILURES_TOTAL).increment(1);
        self.errors.record(err);
    }

    /// Authenticate and admit a session, evicting any live session for the
    /// same identity.
    ///
    /// On failure the registry is unchanged and the error is recorded.
    pub fn on_connect(
        &self,
        secret: &str,
        identity: &str,
        remote: Option<SocketAddr>,
    ) -> Result<Admission, AppError> {
        if let Err(e) = self.authenticate(secret, identity) {
            self.reject(&e);
            return Err(e);
        }

        let token = SessionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let control = Arc::new(SessionControl::default());
        let entry = SessionEntry {
            info: ConnectionInfo {
                server_id: identity.to_string(),
                session: token,
                status: ConnectionStatus::Connected,
                connected_at: now_unix(),
                last_heartbeat: 0,
                last_message: 0,
                remote_addr: remote.map(|a| a.to_string()),
                message_count: 0,
                error_count: 0,
            },
            control: control.clone(),
            last_activity: Instant::now(),
        };

        let evicted = {
            let mut index = self.index.lock();
            let evicted = index
                .by_identity
                .get(identity)
                .copied()
                .and_then(|old| index.remove_session(old));
            let _ = index.by_identity.insert(identity.to_string(), token);
            let _ = index.by_session.insert(token, entry);
            let _ = index.departed.remove(identity);
            evicted
        };

        if let Some(old) = evicted {
            old.control.close(CloseReason::Replaced);
            counter!(AGENT_EVICTIONS_TOTAL, "reason" => "replaced").increment(1);
            warn!(server_id = %identity, old = %old.info.session, new = %token, "evicted previous session");
        } else {
            gauge!(AGENT_SESSIONS_ACTIVE).increment(1.0);
        }

        let _ = self.total_connections.fetch_add(1, Ordering::Relaxed);
        counter!(AGENT_CONNECTIONS_TOTAL).increment(1);
        info!(server_id = %identity, session = %token, remote = ?remote, "agent connected");

        Ok(Admission {
            token,
            identity: identity.to_string(),
            control,
        })
    }

    /// Ingest one report frame.
    pub fn on_message(&self, token: SessionToken, text: &str) -> Ingest {
        let parsed = serde_json::from_str::<Snapshot>(text);

        let identity = {
            let mut index = self.index.lock();
            index.by_session.get_mut(&token).map(|entry| {
                if parsed.is_ok() {
                    entry.info.message_count += 1;
                    entry.info.last_message = now_unix();
                    entry.last_activity = Instant::now();
                } else {
                    entry.info.error_count += 1;
                }
                entry.info.server_id.clone()
            })
        };
        let Some(identity) = identity else {
            self.errors.record(&AppError::new(
                ErrorKind::Protocol,
                Severity::Low,
                format!("message from unknown session {token}"),
            ));
            return Ingest::UnknownSession;
        };

        let mut snapshot = match parsed {
            Ok(s) => s,
            Err(e) => {
                self.frame_error(&identity, e);
                return Ingest::Invalid;
            }
        };

        let Some(entry) = self.roster.lookup(&identity) else {
            debug!(server_id = %identity, "report for identity no longer in roster");
            return Ingest::UnknownIdentity;
        };
        snapshot.id.clone_from(&identity);
        snapshot.name = entry.meta.name.clone();
        snapshot.group = entry.meta.group.clone();
        if let Some(loc) = entry.meta.loc() {
            snapshot.loc = loc;
        }
        snapshot.last_report_time = now_unix();
        self.store.put(snapshot);
        // Reload swaps the roster before purging snapshots, so a miss here
        // means the purge may already have run and this put must be undone.
        if self.roster.lookup(&identity).is_none() {
            let _ = self.store.remove(&identity);
            debug!(server_id = %identity, "identity removed while report was stored");
            return Ingest::UnknownIdentity;
        }

        let _ = self.total_messages.fetch_add(1, Ordering::Relaxed);
        counter!(AGENT_MESSAGES_TOTAL).increment(1);
        Ingest::Stored(identity)
    }

    /// Count a frame that could not be decoded at all (e.g. non-UTF-8).
    pub fn on_bad_frame(&self, token: SessionToken, reason: &str) {
        let identity = {
            let mut index = self.index.lock();
            index.by_session.get_mut(&token).map(|entry| {
                entry.info.error_count += 1;
                entry.info.server_id.clone()
            })
        };
        if let Some(identity) = identity {
            self.frame_error(&identity, reason.to_string());
        }
    }

    fn frame_error<E>(&self, identity: &str, cause: E)
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let _ = self.total_errors.fetch_add(1, Ordering::Relaxed);
        counter!(AGENT_MESSAGE_ERRORS_TOTAL).increment(1);
        self.errors.record(&AppError::wrap(
            ErrorKind::Validation,
            Severity::Low,
            format!("invalid report from {identity}"),
            cause,
        ));
    }

    /// Record a protocol ping or pong.
    pub fn on_heartbeat(&self, token: SessionToken) {
        let mut index = self.index.lock();
        if let Some(entry) = index.by_session.get_mut(&token) {
            entry.info.last_heartbeat = now_unix();
            entry.last_activity = Instant::now();
        }
    }

    /// Drop a session from the index. A session that was already evicted
    /// only removes itself, never its replacement.
    pub fn on_disconnect(&self, token: SessionToken) {
        let removed = {
            let mut index = self.index.lock();
            let authorized = index
                .by_session
                .get(&token)
                .is_some_and(|e| self.roster.lookup(&e.info.server_id).is_some());
            let status = if authorized {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Disconnected
            };
            index.retire(token, status)
        };
        if let Some(entry) = removed {
            gauge!(AGENT_SESSIONS_ACTIVE).decrement(1.0);
            info!(server_id = %entry.info.server_id, session = %token, "agent disconnected");
        }
    }

    /// Force-close sessions idle for longer than `timeout` as of `now`.
    /// Returns the evicted identities.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired: Vec<SessionEntry> = {
            let mut index = self.index.lock();
            let tokens: Vec<SessionToken> = index
                .by_session
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_activity) > timeout)
                .map(|(t, _)| *t)
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| index.retire(t, ConnectionStatus::Reconnecting))
                .collect()
        };

        let mut evicted = Vec::with_capacity(expired.len());
        for entry in expired {
            entry.control.close(CloseReason::HeartbeatTimeout);
            gauge!(AGENT_SESSIONS_ACTIVE).decrement(1.0);
            counter!(AGENT_EVICTIONS_TOTAL, "reason" => "heartbeat_timeout").increment(1);
            self.errors.record(&AppError::new(
                ErrorKind::Network,
                Severity::Medium,
                format!("{} idle for over {}s, closing", entry.info.server_id, timeout.as_secs()),
            ));
            evicted.push(entry.info.server_id);
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until cancelled.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = tick.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let evicted = self.sweep(Instant::now(), timeout);
            if !evicted.is_empty() {
                info!(count = evicted.len(), "heartbeat sweep evicted sessions");
            }
        }
    }

    /// Force-close the session for `identity`, if any.
    pub fn evict(&self, identity: &str, reason: CloseReason) -> bool {
        let removed = {
            let mut index = self.index.lock();
            index
                .by_identity
                .get(identity)
                .copied()
                .and_then(|t| index.retire(t, ConnectionStatus::Disconnected))
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.control.close(reason);
        gauge!(AGENT_SESSIONS_ACTIVE).decrement(1.0);
        counter!(AGENT_EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        info!(server_id = %identity, reason = reason.as_str(), "session evicted");
        true
    }

    /// Close every session.
    pub fn close_all(&self, reason: CloseReason) {
        let entries: Vec<SessionEntry> = {
            let mut index = self.index.lock();
            index.by_identity.clear();
            let entries: Vec<SessionEntry> = index.by_session.drain().map(|(_, e)| e).collect();
            for entry in &entries {
                let mut info = entry.info.clone();
                info.status = ConnectionStatus::Disconnected;
                let _ = index.departed.insert(info.server_id.clone(), info);
            }
            entries
        };
        for entry in entries {
            entry.control.close(reason);
            gauge!(AGENT_SESSIONS_ACTIVE).decrement(1.0);
        }
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.index.lock().by_session.len()
    }

    /// Diagnostics for `identity`: its live session, else the last one that
    /// ended.
    pub fn connection_info(&self, identity: &str) -> Option<ConnectionInfo> {
        let index = self.index.lock();
        index
            .by_identity
            .get(identity)
            .and_then(|token| index.by_session.get(token))
            .map(|e| e.info.clone())
            .or_else(|| index.departed.get(identity).cloned())
    }

    /// Diagnostics for every identity seen, live or departed, sorted by
    /// identity.
    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        let index = self.index.lock();
        let mut all: Vec<ConnectionInfo> = index
            .by_session
            .values()
            .map(|e| e.info.clone())
            .chain(index.departed.values().cloned())
            .collect();
        drop(index);
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    /// Identities with a live session, sorted.
    pub fn online_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index.lock().by_identity.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Aggregate counters.
    pub fn stats(&self) -> RegistryStats {
        let sessions = self.all_connections();
        RegistryStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.session_count(),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            sessions,
        }
    }

    /// Whether the two index directions agree exactly and no identity is
    /// both live and departed.
    pub fn indexes_consistent(&self) -> bool {
        let index = self.index.lock();
        index.by_identity.len() == index.by_session.len()
            && index.departed.keys().all(|id| !index.by_identity.contains_key(id))
            && index.by_identity.iter().all(|(id, token)| {
                index
                    .by_session
                    .get(token)
                    .is_some_and(|e| &e.info.server_id == id)
            })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hostwatch_settings::ServerEntry;
    use proptest::prelude::*;

    use super::*;
    use crate::roster::StaticRoster;

    fn server(id: &str) -> ServerEntry {
        ServerEntry {
            name: format!("{id} name"),
            id: id.into(),
            group: "prod".into(),
            secret: format!("{id}-secret"),
            country_code: "DE".into(),
        }
    }

    fn registry() -> (AgentSessionRegistry, Arc<SnapshotStore>, Arc<ErrorLog>) {
        let roster = Arc::new(StaticRoster::from_entries(&[
            server("srv-1"),
            server("srv-2"),
            server("srv-3"),
        ]));
        let store = Arc::new(SnapshotStore::new());
        let errors = Arc::new(ErrorLog::new());
        (
            AgentSessionRegistry::new(roster, store.clone(), errors.clone()),
            store,
            errors,
        )
    }

    fn connect(reg: &AgentSessionRegistry, id: &str) -> Admission {
        reg.on_connect(&format!("{id}-secret"), id, None).unwrap()
    }

    #[test]
    fn authenticate_rules() {
        let (reg, _, _) = registry();
        assert!(reg.authenticate("srv-1-secret", "srv-1").is_ok());
        assert!(reg.authenticate("srv-2-secret", "srv-1").is_err());
        assert!(reg.authenticate("srv-1-secret", "nope").is_err());
        assert!(reg.authenticate("", "srv-1").is_err());
        assert!(reg.authenticate("srv-1-secret", "").is_err());
        let err = reg.authenticate("x", "srv-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn failed_connect_leaves_registry_untouched() {
        let (reg, _, errors) = registry();
        assert_matches!(reg.on_connect("wrong", "srv-1", None), Err(_));
        assert_eq!(reg.session_count(), 0);
        assert_eq!(errors.count(ErrorKind::Authentication), 1);
        assert_eq!(reg.stats().total_errors, 1);
    }

    #[test]
    fn second_connect_evicts_first() {
        let (reg, _, _) = registry();
        let first = connect(&reg, "srv-1");
        let second = connect(&reg, "srv-1");

        assert!(first.control.is_closed());
        assert!(!second.control.is_closed());
        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.connection_info("srv-1").unwrap().session, second.token);

        // The evicted session's disconnect must not remove its replacement.
        reg.on_disconnect(first.token);
        assert_eq!(reg.session_count(), 1);
        assert!(reg.indexes_consistent());

        reg.on_disconnect(second.token);
        assert_eq!(reg.session_count(), 0);
    }

    #[tokio::test]
    async fn evicted_session_learns_reason() {
        let (reg, _, _) = registry();
        let first = connect(&reg, "srv-1");
        let _second = connect(&reg, "srv-1");
        assert_eq!(first.control.closed().await, CloseReason::Replaced);
    }

    #[test]
    fn message_is_stamped_and_stored() {
        let (reg, store, _) = registry();
        let adm = connect(&reg, "srv-1");
        let body = r#"{"id":"spoofed","name":"spoofed","cpuInfo":{"percent":12.5},"loc":"xx"}"#;
        assert_eq!(reg.on_message(adm.token, body), Ingest::Stored("srv-1".into()));

        let snap = store.get("srv-1").unwrap();
        assert_eq!(snap.id, "srv-1");
        assert_eq!(snap.name, "srv-1 name");
        assert_eq!(snap.group, "prod");
        assert_eq!(snap.loc, "de");
        assert!(snap.last_report_time > 0);
        assert!(store.get("spoofed").is_none());

        let info = reg.connection_info("srv-1").unwrap();
        assert_eq!(info.message_count, 1);
        assert!(info.last_message > 0);
    }

    /// Roster whose next lookup, once armed, lets a reload land right
    /// after it answers: the identity leaves the roster and its snapshot is
    /// purged.
    struct ReloadMidLookup {
        inner: StaticRoster,
        store: Arc<SnapshotStore>,
        armed: std::sync::atomic::AtomicBool,
    }

    impl Roster for ReloadMidLookup {
        fn lookup(&self, identity: &str) -> Option<RosterEntry> {
            let found = self.inner.lookup(identity);
            if self.armed.swap(false, Ordering::SeqCst) {
                for id in self.inner.replace(&[]) {
                    let _ = self.store.remove(&id);
                }
            }
            found
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn reload_during_report_leaves_no_snapshot() {
        let store = Arc::new(SnapshotStore::new());
        let roster = Arc::new(ReloadMidLookup {
            inner: StaticRoster::from_entries(&[server("srv-1")]),
            store: store.clone(),
            armed: std::sync::atomic::AtomicBool::new(false),
        });
        let reg = AgentSessionRegistry::new(roster.clone(), store.clone(), Arc::new(ErrorLog::new()));
        let adm = connect(&reg, "srv-1");

        roster.armed.store(true, Ordering::SeqCst);
        assert_eq!(reg.on_message(adm.token, "{}"), Ingest::UnknownIdentity);
        assert!(store.get("srv-1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn invalid_message_counted_and_connection_kept() {
        let (reg, store, errors) = registry();
        let adm = connect(&reg, "srv-1");
        assert_eq!(reg.on_message(adm.token, "not json"), Ingest::Invalid);
        assert_eq!(reg.on_message(adm.token, "[1,2]"), Ingest::Invalid);

        assert_eq!(errors.count(ErrorKind::Validation), 2);
        assert_eq!(reg.connection_info("srv-1").unwrap().error_count, 2);
        assert_eq!(reg.session_count(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn message_from_unknown_session_is_protocol_error() {
        let (reg, store, errors) = registry();
        let adm = connect(&reg, "srv-1");
        reg.on_disconnect(adm.token);
        assert_eq!(reg.on_message(adm.token, "{}"), Ingest::UnknownSession);
        assert_eq!(errors.count(ErrorKind::Protocol), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn bad_frame_counted() {
        let (reg, _, errors) = registry();
        let adm = connect(&reg, "srv-1");
        reg.on_bad_frame(adm.token, "binary frame is not utf-8");
        assert_eq!(reg.connection_info("srv-1").unwrap().error_count, 1);
        assert_eq!(errors.count(ErrorKind::Validation), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions_only() {
        let (reg, _, errors) = registry();
        let idle = connect(&reg, "srv-1");
        let chatty = connect(&reg, "srv-2");
        let pinging = connect(&reg, "srv-3");

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(matches!(reg.on_message(chatty.token, "{}"), Ingest::Stored(_)));
        reg.on_heartbeat(pinging.token);

        tokio::time::advance(Duration::from_secs(25)).await;
        let evicted = reg.sweep(Instant::now(), Duration::from_secs(60));

        assert_eq!(evicted, vec!["srv-1".to_string()]);
        assert!(idle.control.is_closed());
        assert!(!chatty.control.is_closed());
        assert!(!pinging.control.is_closed());
        assert_eq!(reg.online_ids(), vec!["srv-2", "srv-3"]);
        assert_eq!(errors.count(ErrorKind::Network), 1);
        assert!(reg.indexes_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_loop_evicts() {
        let (reg, _, _) = registry();
        let reg = Arc::new(reg);
        let adm = connect(&reg, "srv-1");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reg.clone().run_sweeper(
            Duration::from_secs(30),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(adm.control.closed().await, CloseReason::HeartbeatTimeout);
        assert_eq!(reg.session_count(), 0);
        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn evict_and_stats() {
        let (reg, _, _) = registry();
        let a = connect(&reg, "srv-1");
        let _b = connect(&reg, "srv-2");
        assert!(reg.evict("srv-1", CloseReason::Removed));
        assert!(!reg.evict("srv-1", CloseReason::Removed));
        assert!(a.control.is_closed());

        let stats = reg.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.sessions.len(), 2);
        assert_eq!(stats.sessions[0].server_id, "srv-1");
        assert_eq!(stats.sessions[0].status, ConnectionStatus::Disconnected);
        assert_eq!(stats.sessions[1].status, ConnectionStatus::Connected);
        assert_eq!(reg.online_ids(), vec!["srv-2"]);
    }

    #[test]
    fn ended_sessions_keep_their_last_state() {
        let (reg, _, _) = registry();
        let a = connect(&reg, "srv-1");
        assert_eq!(reg.on_message(a.token, "{}"), Ingest::Stored("srv-1".into()));
        reg.on_disconnect(a.token);

        let info = reg.connection_info("srv-1").unwrap();
        assert_eq!(info.status, ConnectionStatus::Reconnecting);
        assert_eq!(info.session, a.token);
        assert_eq!(info.message_count, 1);
        assert_eq!(reg.session_count(), 0);
        assert!(reg.online_ids().is_empty());

        // Coming back replaces the departed entry with the live one.
        let b = connect(&reg, "srv-1");
        let info = reg.connection_info("srv-1").unwrap();
        assert_eq!(info.status, ConnectionStatus::Connected);
        assert_eq!(info.session, b.token);
        assert_eq!(reg.all_connections().len(), 1);
        assert!(reg.indexes_consistent());

        // A replaced session leaves nothing behind.
        let c = connect(&reg, "srv-1");
        reg.on_disconnect(b.token);
        assert_eq!(reg.connection_info("srv-1").unwrap().session, c.token);
        assert_eq!(reg.all_connections().len(), 1);
    }

    #[test]
    fn timed_out_session_is_reconnecting() {
        let (reg, _, _) = registry();
        let _a = connect(&reg, "srv-1");
        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(reg.sweep(later, Duration::from_secs(60)), vec!["srv-1"]);
        assert_eq!(
            reg.connection_info("srv-1").unwrap().status,
            ConnectionStatus::Reconnecting
        );
    }

    #[test]
    fn close_all_empties_index() {
        let (reg, _, _) = registry();
        let a = connect(&reg, "srv-1");
        let b = connect(&reg, "srv-2");
        reg.close_all(CloseReason::Shutdown);
        assert!(a.control.is_closed() && b.control.is_closed());
        assert_eq!(reg.session_count(), 0);
        assert!(reg.indexes_consistent());
        assert!(
            reg.all_connections()
                .iter()
                .all(|c| c.status == ConnectionStatus::Disconnected)
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Connect(usize),
        Disconnect(usize),
        Evict(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3).prop_map(Op::Connect),
            (0usize..16).prop_map(Op::Disconnect),
            (0usize..3).prop_map(Op::Evict),
        ]
    }

    proptest! {
        #[test]
        fn index_stays_consistent(ops in prop::collection::vec(op(), 0..64)) {
            let (reg, _, _) = registry();
            let ids = ["srv-1", "srv-2", "srv-3"];
            let mut admitted: Vec<Admission> = Vec::new();
            let mut gone = std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Connect(i) => admitted.push(connect(&reg, ids[i])),
                    Op::Disconnect(n) => {
                        if !admitted.is_empty() {
                            let adm = &admitted[n % admitted.len()];
                            reg.on_disconnect(adm.token);
                            let _ = gone.insert(adm.token);
                        }
                    }
                    Op::Evict(i) => {
                        let _ = reg.evict(ids[i], CloseReason::Removed);
                    }
                }
                prop_assert!(reg.indexes_consistent());
                prop_assert!(reg.session_count() <= ids.len());
                for id in ids {
                    let live = admitted
                        .iter()
                        .filter(|a| a.identity == id && !a.control.is_closed() && !gone.contains(&a.token))
                        .count();
                    prop_assert!(live <= 1);
                }
            }
        }
    }
}
