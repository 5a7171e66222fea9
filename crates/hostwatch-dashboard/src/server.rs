//! Axum router: agent and browser upgrades, REST, health, metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use hostwatch_core::protocol::{AUTH_SECRET_HEADER, FRONTEND_PATH, SERVER_ID_HEADER};
use hostwatch_core::{ErrorLog, StatusView, now_unix};
use hostwatch_settings::validate::validate_dashboard;
use hostwatch_settings::{DashboardSettings, IssueLevel, ValidationIssue};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::hub::BroadcastHub;
use crate::registry::AgentSessionRegistry;
use crate::response::ApiResponse;
use crate::roster::Roster;
use crate::store::SnapshotStore;
use crate::websocket::{run_agent_session, run_browser_session};

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    /// Agent session index.
    pub registry: Arc<AgentSessionRegistry>,
    /// Browser fan-out.
    pub hub: Arc<BroadcastHub>,
    /// Latest snapshots.
    pub store: Arc<SnapshotStore>,
    /// Authorized identities.
    pub roster: Arc<dyn Roster>,
    /// Recent errors.
    pub errors: Arc<ErrorLog>,
    /// Fires on shutdown; browser sessions watch it.
    pub cancel: CancellationToken,
    /// When the dashboard started.
    pub start_time: Instant,
    /// Prometheus renderer, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
    /// Current settings, updated on reload.
    pub settings: Arc<RwLock<DashboardSettings>>,
    /// Seconds of silence before a host is shown offline.
    pub report_max_secs: i64,
    /// Largest accepted agent frame, bytes.
    pub max_message_size: usize,
}

/// Build the router. Agents connect on `agent_path`.
pub fn router(state: AppState, agent_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(agent_path, get(agent_ws_handler))
        .route(FRONTEND_PATH, get(frontend_ws_handler))
        .route("/api/server/statusInfo", get(status_info_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/config/info", get(config_info_handler))
        .route("/api/config/validation", get(config_validation_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `/health` body.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while serving.
    pub status: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Live agent sessions.
    pub agent_sessions: usize,
    /// Live browser sessions.
    pub frontend_sessions: usize,
}

/// `/api/statistics` payload.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    /// Identities with a live session.
    pub online_ids: Vec<String>,
    /// Live agent sessions.
    pub session_map_len: usize,
    /// Stored snapshots.
    pub report_map_len: usize,
    /// Configured identities.
    pub config_servers_len: usize,
    /// Agent sessions ever admitted.
    pub total_connections: u64,
    /// Reports accepted.
    pub total_messages: u64,
    /// Rejected frames and handshakes.
    pub total_errors: u64,
    /// Live browser sessions.
    pub frontend_sessions: usize,
}

/// `/api/config/info` payload. Secrets are never included.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInfo {
    /// Bind address.
    pub address: String,
    /// Bind port.
    pub port: u16,
    /// Agent upgrade path.
    pub web_socket_path: String,
    /// Seconds of silence before a host is shown offline.
    pub report_time_interval_max: i64,
    /// Sweep interval, seconds.
    pub heartbeat_interval_secs: u64,
    /// Idle limit before a session is evicted, seconds.
    pub heartbeat_timeout_secs: u64,
    /// Browser push interval, milliseconds.
    pub push_interval_ms: u64,
    /// Log filter.
    pub log_level: String,
    /// Configured identities.
    pub server_count: usize,
    /// One entry per configured identity.
    pub servers: Vec<ServerInfo>,
}

/// A configured identity with its secret redacted.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Identity.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Display group.
    pub group: String,
    /// Country code as configured.
    pub country_code: String,
    /// Whether a secret is set.
    pub has_secret: bool,
    /// Secret length in characters.
    pub secret_length: usize,
}

impl From<&DashboardSettings> for ConfigInfo {
    fn from(s: &DashboardSettings) -> Self {
        Self {
            address: s.address.clone(),
            port: s.port,
            web_socket_path: s.web_socket_path.clone(),
            report_time_interval_max: s.report_time_interval_max,
            heartbeat_interval_secs: s.heartbeat_interval_secs,
            heartbeat_timeout_secs: s.heartbeat_timeout_secs,
            push_interval_ms: s.push_interval_ms,
            log_level: s.log_level.clone(),
            server_count: s.servers.len(),
            servers: s
                .servers
                .iter()
                .map(|e| ServerInfo {
                    id: e.id.clone(),
                    name: e.name.clone(),
                    group: e.group.clone(),
                    country_code: e.country_code.clone(),
                    has_secret: !e.secret.is_empty(),
                    secret_length: e.secret.chars().count(),
                })
                .collect(),
        }
    }
}

/// `/api/config/validation` payload.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// No error-level issues.
    pub valid: bool,
    /// Every issue found.
    pub issues: Vec<ValidationIssue>,
    /// Error-level issues.
    pub error_count: usize,
    /// Warning-level issues.
    pub warning_count: usize,
    /// Info-level issues.
    pub info_count: usize,
}

impl ValidationReport {
    fn new(issues: Vec<ValidationIssue>) -> Self {
        let count = |level| issues.iter().filter(|i| i.level == level).count();
        let (error_count, warning_count, info_count) =
            (count(IssueLevel::Error), count(IssueLevel::Warning), count(IssueLevel::Info));
        Self {
            valid: error_count == 0,
            issues,
            error_count,
            warning_count,
            info_count,
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        agent_sessions: state.registry.session_count(),
        frontend_sessions: state.hub.session_count(),
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// GET <agent path>: authenticate, then upgrade.
async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let secret = header(&headers, AUTH_SECRET_HEADER);
    let identity = header(&headers, SERVER_ID_HEADER);

    let admission = match state.registry.on_connect(secret, identity, Some(remote)) {
        Ok(admission) => admission,
        Err(e) => {
            warn!(%remote, server_id = identity, error = %e, "agent handshake rejected");
            return ApiResponse::unauthorized().into_response();
        }
    };

    let registry = state.registry.clone();
    ws.max_message_size(state.max_message_size)
        .max_frame_size(state.max_message_size)
        .on_failed_upgrade({
            let registry = state.registry.clone();
            let token = admission.token;
            move |e| {
                warn!(error = %e, "agent upgrade failed");
                registry.on_disconnect(token);
            }
        })
        .on_upgrade(move |socket| run_agent_session(socket, admission, registry))
}

/// GET /ws-frontend
async fn frontend_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let session_id = uuid::Uuid::now_v7().to_string();
    let hub = state.hub.clone();
    let cancel = state.cancel.clone();
    ws.on_upgrade(move |socket| run_browser_session(socket, session_id, hub, cancel))
}

/// GET /api/server/statusInfo
async fn status_info_handler(State(state): State<AppState>) -> ApiResponse<Vec<StatusView>> {
    ApiResponse::success(state.store.status_views(now_unix(), state.report_max_secs))
}

/// GET /api/statistics
async fn statistics_handler(State(state): State<AppState>) -> ApiResponse<Statistics> {
    let stats = state.registry.stats();
    ApiResponse::success(Statistics {
        online_ids: state.registry.online_ids(),
        session_map_len: stats.active_connections,
        report_map_len: state.store.len(),
        config_servers_len: state.roster.len(),
        total_connections: stats.total_connections,
        total_messages: stats.total_messages,
        total_errors: stats.total_errors,
        frontend_sessions: state.hub.session_count(),
    })
}

/// GET /api/config/info
async fn config_info_handler(State(state): State<AppState>) -> ApiResponse<ConfigInfo> {
    ApiResponse::success(ConfigInfo::from(&*state.settings.read()))
}

/// GET /api/config/validation
async fn config_validation_handler(State(state): State<AppState>) -> ApiResponse<ValidationReport> {
    let issues = validate_dashboard(&state.settings.read());
    ApiResponse::success(ValidationReport::new(issues))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
