//! The dashboard: owns every manager and wires them into the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use hostwatch_core::error_log::ErrorStats;
use hostwatch_core::{ErrorLog, ShutdownCoordinator, supervise};
use hostwatch_settings::{DashboardSettings, ServerEntry, SettingsWatcher};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::hub::{BroadcastHub, HubStats};
use crate::registry::{AgentSessionRegistry, CloseReason, RegistryStats};
use crate::roster::{Roster, StaticRoster};
use crate::server::{self, AppState};
use crate::store::SnapshotStore;

/// Time allowed for background tasks to wind down on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure to start serving.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The bound address could not be read back.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
    /// [`Dashboard::stop`] already ran.
    #[error("dashboard is stopped")]
    Stopped,
}

/// Outcome of [`Dashboard::reload_identities`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    /// Identities no longer configured; their sessions and snapshots are gone.
    pub removed: Vec<String>,
    /// Identities configured after the reload.
    pub configured: usize,
}

/// Dashboard-wide counters.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    /// Agent side.
    pub registry: RegistryStats,
    /// Browser side.
    pub hub: HubStats,
    /// Recorded errors.
    pub errors: ErrorStats,
    /// Stored snapshots.
    pub snapshots: usize,
}

/// The running dashboard.
pub struct Dashboard {
    settings: Arc<RwLock<DashboardSettings>>,
    roster: Arc<StaticRoster>,
    store: Arc<SnapshotStore>,
    registry: Arc<AgentSessionRegistry>,
    hub: Arc<BroadcastHub>,
    errors: Arc<ErrorLog>,
    metrics: Option<PrometheusHandle>,
    shutdown: ShutdownCoordinator,
    start_time: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dashboard {
    /// Build the dashboard from validated settings. Nothing runs until
    /// [`listen`](Self::listen).
    pub fn new(
        settings: DashboardSettings,
        errors: Arc<ErrorLog>,
        metrics: Option<PrometheusHandle>,
    ) -> Arc<Self> {
        let roster = Arc::new(StaticRoster::from_entries(&settings.servers));
        let store = Arc::new(SnapshotStore::new());
        let registry = Arc::new(AgentSessionRegistry::new(
            roster.clone(),
            store.clone(),
            errors.clone(),
        ));
        let hub = Arc::new(BroadcastHub::new(
            store.clone(),
            errors.clone(),
            settings.report_time_interval_max,
        ));
        Arc::new(Self {
            settings: Arc::new(RwLock::new(settings)),
            roster,
            store,
            registry,
            hub,
            errors,
            metrics,
            shutdown: ShutdownCoordinator::new(),
            start_time: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Agent session registry.
    pub fn registry(&self) -> &Arc<AgentSessionRegistry> {
        &self.registry
    }

    /// Browser hub.
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Snapshot store.
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Current settings: those the dashboard was built with, plus the
    /// latest reloaded server list.
    pub fn settings(&self) -> DashboardSettings {
        self.settings.read().clone()
    }

    /// Build the HTTP router.
    pub fn router(&self) -> Router {
        let roster: Arc<dyn Roster> = self.roster.clone();
        let settings = self.settings.read();
        let state = AppState {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            store: self.store.clone(),
            roster,
            errors: self.errors.clone(),
            cancel: self.shutdown.token(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            report_max_secs: settings.report_time_interval_max,
            max_message_size: settings.max_message_size,
        };
        server::router(state, &settings.web_socket_path)
    }

    /// Bind `addr`, start the heartbeat sweep and push loop, and serve until
    /// [`stop`](Self::stop). Returns the bound address.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, ServeError> {
        if self.shutdown.is_shutting_down() {
            return Err(ServeError::Stopped);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })?;
        let local = listener.local_addr().map_err(ServeError::LocalAddr)?;

        let settings = self.settings();
        let app = self.router();
        let mut tasks = self.tasks.lock();
        let cancel = self.shutdown.token();

        let (registry, cancel_sweep) = (self.registry.clone(), cancel.clone());
        let (interval, timeout) = (settings.heartbeat_interval(), settings.heartbeat_timeout());
        tasks.push(supervise("dashboard-sweep", self.errors.clone(), cancel.clone(), move || {
            registry.clone().run_sweeper(interval, timeout, cancel_sweep.clone())
        }));

        let (hub, cancel_push) = (self.hub.clone(), cancel.clone());
        let push_interval = settings.push_interval();
        tasks.push(supervise("dashboard-push", self.errors.clone(), cancel.clone(), move || {
            hub.clone().run(push_interval, cancel_push.clone())
        }));

        tasks.push(tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
            if let Err(e) = served {
                error!(error = %e, "http server failed");
            }
        }));

        info!(
            %local,
            agent_path = %settings.web_socket_path,
            servers = self.roster.len(),
            "dashboard listening"
        );
        Ok(local)
    }

    /// Swap in a new server list.
    ///
    /// Sessions and snapshots of removed identities are dropped. Identities
    /// that remain keep their sessions and get fresh display metadata.
    pub fn reload_identities(&self, servers: &[ServerEntry]) -> ReloadSummary {
        self.settings.write().servers = servers.to_vec();
        let removed = self.roster.replace(servers);
        for id in &removed {
            let _ = self.registry.evict(id, CloseReason::Removed);
            let _ = self.store.remove(id);
        }
        for id in self.roster.ids() {
            if let Some(entry) = self.roster.lookup(&id) {
                self.store.restamp(&id, &entry.meta);
            }
        }
        let configured = self.roster.len();
        info!(removed = removed.len(), configured, "server list reloaded");
        ReloadSummary { removed, configured }
    }

    /// Apply every change to the watched settings file until `cancel` fires.
    /// A file that fails to load or validate is logged and the running list
    /// kept.
    pub async fn follow_settings(self: Arc<Self>, mut watcher: SettingsWatcher, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = watcher.changed() => {
                    if changed.is_none() {
                        break;
                    }
                }
            }
            match hostwatch_settings::load_dashboard_settings(watcher.path()) {
                Ok(next) => {
                    let _ = self.reload_identities(&next.servers);
                }
                Err(e) => warn!(error = %e, "ignoring invalid settings change"),
            }
        }
    }

    /// Counters across all managers.
    pub fn stats(&self) -> DashboardStats {
        DashboardStats {
            registry: self.registry.stats(),
            hub: self.hub.stats(),
            errors: self.errors.stats(),
            snapshots: self.store.len(),
        }
    }

    /// Shut down: cancel, wait the grace period, close every session once,
    /// then wait for background tasks. Later calls are no-ops.
    pub async fn stop(&self) {
        if !self.shutdown.begin_close() {
            return;
        }
        self.shutdown.grace().await;
        self.registry.close_all(CloseReason::Shutdown);
        self.hub.clear();
        let handles = std::mem::take(&mut *self.tasks.lock());
        self.shutdown.drain(handles, Some(STOP_TIMEOUT)).await;
        self.errors.log_stats();
        info!("dashboard stopped");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hostwatch_core::Snapshot;

    use super::*;
    use crate::registry::Ingest;

    fn server(id: &str, name: &str) -> ServerEntry {
        ServerEntry {
            name: name.into(),
            id: id.into(),
            group: "prod".into(),
            secret: format!("{id}-secret"),
            country_code: "fr".into(),
        }
    }

    fn dashboard() -> Arc<Dashboard> {
        let settings = DashboardSettings {
            servers: vec![server("srv-1", "one"), server("srv-2", "two")],
            ..DashboardSettings::default()
        };
        Dashboard::new(settings, Arc::new(ErrorLog::new()), None)
    }

    #[test]
    fn reload_removes_sessions_and_snapshots() {
        let dash = dashboard();
        let gone = dash.registry().on_connect("srv-1-secret", "srv-1", None).unwrap();
        let kept = dash.registry().on_connect("srv-2-secret", "srv-2", None).unwrap();
        assert_matches!(dash.registry().on_message(gone.token, "{}"), Ingest::Stored(_));
        assert_matches!(dash.registry().on_message(kept.token, "{}"), Ingest::Stored(_));

        let summary = dash.reload_identities(&[server("srv-2", "renamed"), server("srv-3", "three")]);

        assert_eq!(summary.removed, vec!["srv-1"]);
        assert_eq!(summary.configured, 2);
        let ids: Vec<String> = dash.settings().servers.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["srv-2", "srv-3"]);
        assert!(gone.control.is_closed());
        assert!(!kept.control.is_closed());
        assert!(dash.store().get("srv-1").is_none());
        assert_eq!(dash.store().get("srv-2").unwrap().name, "renamed");
        assert_eq!(dash.registry().online_ids(), vec!["srv-2"]);
        assert!(dash.registry().on_connect("srv-1-secret", "srv-1", None).is_err());
    }

    #[test]
    fn stats_aggregate_managers() {
        let dash = dashboard();
        dash.store().put(Snapshot {
            id: "srv-1".into(),
            ..Snapshot::default()
        });
        let stats = dash.stats();
        assert_eq!(stats.snapshots, 1);
        assert_eq!(stats.registry.active_connections, 0);
        assert_eq!(stats.hub.sessions, 0);
    }

    #[tokio::test]
    async fn listen_then_stop() {
        let dash = dashboard();
        let addr = dash.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);

        let adm = dash.registry().on_connect("srv-1-secret", "srv-1", None).unwrap();
        dash.stop().await;
        assert!(adm.control.is_closed());
        assert_eq!(dash.registry().session_count(), 0);

        // Second stop is a no-op, and a stopped dashboard cannot listen again.
        dash.stop().await;
        assert_matches!(
            dash.listen("127.0.0.1:0".parse().unwrap()).await,
            Err(ServeError::Stopped)
        );
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap();
        let dash = dashboard();
        assert_matches!(dash.listen(taken).await, Err(ServeError::Bind { .. }));
    }
}
