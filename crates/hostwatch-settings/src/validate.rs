//! Settings validation.
//!
//! Validation never mutates settings; it returns a list of issues. Only
//! [`IssueLevel::Error`] issues make loading fail. Warnings and notes are
//! logged by the loader and otherwise ignored.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::types::{AgentSettings, DashboardSettings, ServerEntry};

/// Severity of a validation finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    /// Loading fails.
    Error,
    /// Suspicious but usable.
    Warning,
    /// Informational.
    Info,
}

/// One validation finding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong.
    pub message: String,
    /// How serious it is.
    pub level: IssueLevel,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Default)]
struct Issues(Vec<ValidationIssue>);

impl Issues {
    fn push(&mut self, level: IssueLevel, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            level,
        });
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(IssueLevel::Error, field, message);
    }

    fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(IssueLevel::Warning, field, message);
    }
}

/// Whether any issue is error-level.
pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.level == IssueLevel::Error)
}

/// `; `-joined error-level issues.
pub fn error_summary(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .filter(|i| i.level == IssueLevel::Error)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Identities are 3–50 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_identity(id: &str) -> bool {
    (3..=50).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];
const WEAK_SECRETS: [&str; 3] = ["123456", "password", "admin"];
const RESERVED_PATHS: [&str; 7] = [
    "/health",
    "/metrics",
    "/ws-frontend",
    "/api/server/statusInfo",
    "/api/statistics",
    "/api/config/info",
    "/api/config/validation",
];

fn check_log_level(issues: &mut Issues, level: &str) {
    if !level.is_empty() && !LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
        issues.error(
            "logLevel",
            format!("unknown log level, expected one of {}", LOG_LEVELS.join(", ")),
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// Validate agent settings.
pub fn validate_agent(settings: &AgentSettings) -> Vec<ValidationIssue> {
    let mut issues = Issues::default();

    if settings.server_addr.is_empty() {
        issues.error("serverAddr", "required");
    } else {
        let rest = settings
            .server_addr
            .strip_prefix("ws://")
            .or_else(|| settings.server_addr.strip_prefix("wss://"));
        match rest {
            None => issues.error("serverAddr", "must start with ws:// or wss://"),
            Some(rest) if rest.split('/').next().is_none_or(str::is_empty) => {
                issues.error("serverAddr", "must include a host");
            }
            Some(_) => {}
        }
    }

    if settings.server_id.is_empty() {
        issues.error("serverId", "required");
    } else if !is_valid_identity(&settings.server_id) {
        issues.error(
            "serverId",
            "must be 3-50 characters of letters, digits, '-' or '_'",
        );
    }

    let secret = &settings.auth_secret;
    if secret.is_empty() {
        issues.error("authSecret", "required");
    } else {
        if !(8..=256).contains(&secret.len()) {
            issues.error("authSecret", "must be 8-256 characters long");
        }
        if secret.contains(' ') {
            issues.error("authSecret", "must not contain spaces");
        }
    }

    if !(1..=300).contains(&settings.report_interval_secs) {
        issues.error("reportIntervalSecs", "must be between 1 and 300 seconds");
    }
    if settings.heartbeat_timeout_secs <= settings.heartbeat_interval_secs {
        issues.warn(
            "heartbeatTimeoutSecs",
            "should exceed heartbeatIntervalSecs or every missed pong forces a reconnect",
        );
    }
    if settings.send_queue_capacity == 0 {
        issues.error("sendQueueCapacity", "must be at least 1");
    }

    check_log_level(&mut issues, &settings.log_level);
    issues.0
}

// ─────────────────────────────────────────────────────────────────────────────
// Dashboard
// ─────────────────────────────────────────────────────────────────────────────

/// Validate dashboard settings.
pub fn validate_dashboard(settings: &DashboardSettings) -> Vec<ValidationIssue> {
    let mut issues = Issues::default();

    if settings.address.parse::<IpAddr>().is_err() {
        issues.error("address", "not a valid IP address");
    }
    if settings.port == 0 {
        issues.push(IssueLevel::Info, "port", "port 0 binds an ephemeral port");
    } else if settings.port <= 1024 {
        issues.warn("port", "ports <= 1024 usually need elevated privileges");
    }

    if settings.web_socket_path.contains(' ') {
        issues.error("webSocketPath", "must not contain spaces");
    }
    if RESERVED_PATHS.contains(&settings.web_socket_path.as_str()) {
        issues.error("webSocketPath", "collides with a built-in route");
    }
    if settings.report_time_interval_max > 300 {
        issues.warn(
            "reportTimeIntervalMax",
            "over 300 seconds delays offline detection",
        );
    }
    if settings.heartbeat_timeout_secs < settings.heartbeat_interval_secs {
        issues.warn(
            "heartbeatTimeoutSecs",
            "shorter than heartbeatIntervalSecs; idle agents are evicted late",
        );
    }

    check_log_level(&mut issues, &settings.log_level);
    validate_servers(&mut issues, &settings.servers);
    issues.0
}

fn validate_servers(issues: &mut Issues, servers: &[ServerEntry]) {
    if servers.is_empty() {
        issues.error("servers", "no servers configured");
        return;
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();

    for (i, server) in servers.iter().enumerate() {
        let field = |name: &str| format!("servers[{i}].{name}");

        if server.id.is_empty() {
            issues.error(field("id"), "required");
        } else {
            if !ids.insert(server.id.as_str()) {
                issues.error(field("id"), "duplicate server id");
            }
            if !is_valid_identity(&server.id) {
                issues.error(
                    field("id"),
                    "must be 3-50 characters of letters, digits, '-' or '_'",
                );
            }
        }

        if server.name.is_empty() {
            issues.error(field("name"), "required");
        } else {
            if !names.insert(server.name.as_str()) {
                issues.warn(field("name"), "duplicate name");
            }
            if server.name.len() > 100 {
                issues.warn(field("name"), "longer than 100 characters");
            }
        }

        if server.secret.is_empty() {
            issues.error(field("secret"), "required");
        } else {
            if server.secret.len() < 8 {
                issues.warn(field("secret"), "shorter than 8 characters");
            }
            if WEAK_SECRETS.contains(&server.secret.as_str()) {
                issues.warn(field("secret"), "weak secret");
            }
        }

        if !server.country_code.is_empty() && server.country_code.len() != 2 {
            issues.warn(field("countryCode"), "should be a 2-letter country code");
        }
        if server.group.len() > 50 {
            issues.warn(field("group"), "longer than 50 characters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_agent() -> AgentSettings {
        AgentSettings {
            server_id: "srv-1".into(),
            auth_secret: "correct-horse".into(),
            ..AgentSettings::default()
        }
    }

    fn entry(id: &str, name: &str) -> ServerEntry {
        ServerEntry {
            name: name.into(),
            id: id.into(),
            group: "prod".into(),
            secret: "long-enough-secret".into(),
            country_code: "DE".into(),
        }
    }

    fn fields(issues: &[ValidationIssue], level: IssueLevel) -> Vec<String> {
        issues
            .iter()
            .filter(|i| i.level == level)
            .map(|i| i.field.clone())
            .collect()
    }

    #[test]
    fn identity_rules() {
        assert!(is_valid_identity("srv-1"));
        assert!(is_valid_identity("a_b"));
        assert!(!is_valid_identity("ab"));
        assert!(!is_valid_identity("has space"));
        assert!(!is_valid_identity(&"x".repeat(51)));
    }

    #[test]
    fn valid_agent_passes() {
        assert!(!has_errors(&validate_agent(&valid_agent())));
    }

    #[test]
    fn agent_requires_credentials() {
        let issues = validate_agent(&AgentSettings::default());
        let errors = fields(&issues, IssueLevel::Error);
        assert!(errors.contains(&"serverId".to_string()));
        assert!(errors.contains(&"authSecret".to_string()));
    }

    #[test]
    fn agent_rejects_http_scheme_and_missing_host() {
        let mut s = valid_agent();
        s.server_addr = "http://dash:8900/ws-report".into();
        assert_eq!(fields(&validate_agent(&s), IssueLevel::Error), vec!["serverAddr"]);

        s.server_addr = "wss:///ws-report".into();
        assert_eq!(fields(&validate_agent(&s), IssueLevel::Error), vec!["serverAddr"]);
    }

    #[test]
    fn agent_secret_rules() {
        let mut s = valid_agent();
        s.auth_secret = "short".into();
        assert!(has_errors(&validate_agent(&s)));
        s.auth_secret = "has a space".into();
        assert!(error_summary(&validate_agent(&s)).contains("spaces"));
    }

    #[test]
    fn agent_interval_range() {
        let mut s = valid_agent();
        s.report_interval_secs = 301;
        assert!(has_errors(&validate_agent(&s)));
    }

    #[test]
    fn dashboard_requires_servers() {
        let issues = validate_dashboard(&DashboardSettings::default());
        assert_eq!(fields(&issues, IssueLevel::Error), vec!["servers"]);
    }

    #[test]
    fn dashboard_duplicate_ids_are_errors_duplicate_names_warnings() {
        let s = DashboardSettings {
            servers: vec![entry("srv-1", "web"), entry("srv-1", "web")],
            ..DashboardSettings::default()
        };
        let issues = validate_dashboard(&s);
        assert_eq!(fields(&issues, IssueLevel::Error), vec!["servers[1].id"]);
        assert_eq!(fields(&issues, IssueLevel::Warning), vec!["servers[1].name"]);
    }

    #[test]
    fn dashboard_weak_secret_warns() {
        let mut weak = entry("srv-1", "web");
        weak.secret = "admin".into();
        let s = DashboardSettings {
            servers: vec![weak],
            ..DashboardSettings::default()
        };
        let issues = validate_dashboard(&s);
        assert!(!has_errors(&issues));
        assert_eq!(fields(&issues, IssueLevel::Warning).len(), 2);
    }

    #[test]
    fn dashboard_bad_address_and_path() {
        let s = DashboardSettings {
            address: "not-an-ip".into(),
            web_socket_path: "/ws report".into(),
            servers: vec![entry("srv-1", "web")],
            ..DashboardSettings::default()
        };
        let errors = fields(&validate_dashboard(&s), IssueLevel::Error);
        assert_eq!(errors, vec!["address", "webSocketPath"]);
    }

    #[test]
    fn dashboard_path_must_not_shadow_builtin_routes() {
        let s = DashboardSettings {
            web_socket_path: "/ws-frontend".into(),
            servers: vec![entry("srv-1", "web")],
            ..DashboardSettings::default()
        };
        let errors = fields(&validate_dashboard(&s), IssueLevel::Error);
        assert_eq!(errors, vec!["webSocketPath"]);
    }

    #[test]
    fn bad_log_level() {
        let mut s = valid_agent();
        s.log_level = "loud".into();
        assert_eq!(fields(&validate_agent(&s), IssueLevel::Error), vec!["logLevel"]);
    }
}
