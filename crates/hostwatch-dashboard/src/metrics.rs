//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Agent handshakes accepted (counter).
pub const AGENT_CONNECTIONS_TOTAL: &str = "agent_connections_total";
/// Live agent sessions (gauge).
pub const AGENT_SESSIONS_ACTIVE: &str = "agent_sessions_active";
/// Agent reports accepted (counter).
pub const AGENT_MESSAGES_TOTAL: &str = "agent_messages_total";
/// Agent frames rejected (counter).
pub const AGENT_MESSAGE_ERRORS_TOTAL: &str = "agent_message_errors_total";
/// Agent sessions force-closed (counter, labels: reason).
pub const AGENT_EVICTIONS_TOTAL: &str = "agent_evictions_total";
/// Agent handshakes rejected (counter).
pub const AGENT_AUTH_FAILURES_TOTAL: &str = "agent_auth_failures_total";
/// Live browser sessions (gauge).
pub const FRONTEND_SESSIONS_ACTIVE: &str = "frontend_sessions_active";
/// Status pushes fanned out (counter).
pub const FRONTEND_BROADCASTS_TOTAL: &str = "frontend_broadcasts_total";
/// Frames dropped on full browser channels (counter).
pub const FRONTEND_DROPPED_TOTAL: &str = "frontend_dropped_total";
/// Browser session duration (histogram, seconds).
pub const FRONTEND_SESSION_DURATION_SECONDS: &str = "frontend_session_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        for name in [
            AGENT_CONNECTIONS_TOTAL,
            AGENT_SESSIONS_ACTIVE,
            AGENT_MESSAGES_TOTAL,
            AGENT_MESSAGE_ERRORS_TOTAL,
            AGENT_EVICTIONS_TOTAL,
            AGENT_AUTH_FAILURES_TOTAL,
            FRONTEND_SESSIONS_ACTIVE,
            FRONTEND_BROADCASTS_TOTAL,
            FRONTEND_DROPPED_TOTAL,
            FRONTEND_SESSION_DURATION_SECONDS,
        ] {
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{name}");
        }
    }
}
