//! Agent and dashboard settings.

use std::time::Duration;

use hostwatch_core::RetryPolicy;
use hostwatch_core::protocol::DEFAULT_AGENT_PATH;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// Default agent reporting interval in seconds.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 2;

/// Settings for the per-host agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Dashboard endpoint, e.g. `ws://dash.example:8900/ws-report`.
    pub server_addr: String,
    /// This host's identity in the dashboard roster.
    pub server_id: String,
    /// Shared secret for `server_id`.
    pub auth_secret: String,
    /// Base reporting interval in seconds.
    pub report_interval_secs: u64,
    /// Skip the public IP / location lookup.
    pub disable_ip_lookup: bool,
    /// Default log filter.
    pub log_level: String,
    /// Protocol ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Reconnect if no pong arrives within this many seconds.
    pub heartbeat_timeout_secs: u64,
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Longest a send may wait for queue space, in milliseconds.
    pub enqueue_timeout_ms: u64,
    /// Dial backoff within one reconnect cycle.
    pub reconnect: RetryPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_addr: format!("ws://127.0.0.1:8900{DEFAULT_AGENT_PATH}"),
            server_id: String::new(),
            auth_secret: String::new(),
            report_interval_secs: DEFAULT_REPORT_INTERVAL_SECS,
            disable_ip_lookup: false,
            log_level: "info".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 45,
            send_queue_capacity: 100,
            enqueue_timeout_ms: 5000,
            reconnect: RetryPolicy {
                max_attempts: 10,
                initial_delay_ms: 3000,
                max_delay_ms: 600_000,
                backoff_factor: 1.2,
            },
        }
    }
}

impl AgentSettings {
    /// Base reporting interval.
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Protocol ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Pong deadline.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Longest a send may wait for queue space.
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dashboard
// ─────────────────────────────────────────────────────────────────────────────

/// Default offline threshold in seconds.
pub const DEFAULT_REPORT_TIME_INTERVAL_MAX: i64 = 30;

/// One roster entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerEntry {
    /// Display name.
    pub name: String,
    /// Identity.
    pub id: String,
    /// Display group.
    pub group: String,
    /// Shared secret.
    pub secret: String,
    /// ISO 3166 alpha-2 country code shown as the host location.
    pub country_code: String,
}

/// Settings for the central dashboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardSettings {
    /// Bind address.
    pub address: String,
    /// Bind port.
    pub port: u16,
    /// Agent endpoint path.
    pub web_socket_path: String,
    /// A host whose last report is older than this many seconds is offline.
    pub report_time_interval_max: i64,
    /// Agent liveness sweep interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Evict agents idle for longer than this many seconds.
    pub heartbeat_timeout_secs: u64,
    /// Browser push interval in milliseconds.
    pub push_interval_ms: u64,
    /// Largest accepted agent frame in bytes.
    pub max_message_size: usize,
    /// Default log filter.
    pub log_level: String,
    /// Authorized hosts.
    pub servers: Vec<ServerEntry>,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8900,
            web_socket_path: DEFAULT_AGENT_PATH.to_string(),
            report_time_interval_max: DEFAULT_REPORT_TIME_INTERVAL_MAX,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            push_interval_ms: 1000,
            max_message_size: 64 * 1024,
            log_level: "info".to_string(),
            servers: Vec::new(),
        }
    }
}

impl DashboardSettings {
    /// Agent liveness sweep interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Agent idle timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Browser push interval.
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    /// `address:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
