//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled defaults
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HOSTWATCH_*` environment overrides (highest priority)
//! 4. Normalize, then validate; error-level issues fail the load

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{
    AgentSettings, DEFAULT_REPORT_INTERVAL_SECS, DEFAULT_REPORT_TIME_INTERVAL_MAX,
    DashboardSettings,
};
use crate::validate::{
    IssueLevel, ValidationIssue, error_summary, has_errors, validate_agent, validate_dashboard,
};

/// Smallest accepted offline threshold; lower values fall back to the default.
pub const MIN_REPORT_TIME_INTERVAL_MAX: i64 = 5;

/// Load, override, normalize, and validate agent settings.
pub fn load_agent_settings(path: &Path) -> Result<AgentSettings> {
    let mut settings: AgentSettings = load_merged(path)?;
    apply_agent_overrides(&mut settings, &env_lookup);
    normalize_agent(&mut settings);
    check(&validate_agent(&settings))?;
    Ok(settings)
}

/// Load, override, normalize, and validate dashboard settings.
pub fn load_dashboard_settings(path: &Path) -> Result<DashboardSettings> {
    let mut settings: DashboardSettings = load_merged(path)?;
    apply_dashboard_overrides(&mut settings, &env_lookup);
    normalize_dashboard(&mut settings);
    check(&validate_dashboard(&settings))?;
    Ok(settings)
}

fn load_merged<T: Default + Serialize + DeserializeOwned>(path: &Path) -> Result<T> {
    let defaults = serde_json::to_value(T::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        info!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

fn check(issues: &[ValidationIssue]) -> Result<()> {
    for issue in issues {
        match issue.level {
            IssueLevel::Warning => warn!(field = %issue.field, "{}", issue.message),
            IssueLevel::Info => info!(field = %issue.field, "{}", issue.message),
            IssueLevel::Error => {}
        }
    }
    if has_errors(issues) {
        return Err(SettingsError::Invalid {
            count: issues.iter().filter(|i| i.level == IssueLevel::Error).count(),
            summary: error_summary(issues),
        });
    }
    Ok(())
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

// ── Normalization ───────────────────────────────────────────────────────────

/// Fill in values that are present but unusable.
pub fn normalize_agent(settings: &mut AgentSettings) {
    if settings.report_interval_secs == 0 {
        settings.report_interval_secs = DEFAULT_REPORT_INTERVAL_SECS;
    }
}

/// Fill in values that are present but unusable.
pub fn normalize_dashboard(settings: &mut DashboardSettings) {
    if settings.address.is_empty() {
        settings.address = "0.0.0.0".to_string();
    }
    if settings.web_socket_path.is_empty() {
        settings.web_socket_path = hostwatch_core::protocol::DEFAULT_AGENT_PATH.to_string();
    } else if !settings.web_socket_path.starts_with('/') {
        settings.web_socket_path = format!("/{}", settings.web_socket_path);
    }
    if settings.report_time_interval_max < MIN_REPORT_TIME_INTERVAL_MAX {
        warn!(
            value = settings.report_time_interval_max,
            "reportTimeIntervalMax below minimum, using default"
        );
        settings.report_time_interval_max = DEFAULT_REPORT_TIME_INTERVAL_MAX;
    }
    for server in &mut settings.servers {
        server.id = server.id.trim().to_string();
    }
}

// ── Environment overrides ───────────────────────────────────────────────────

/// Apply `HOSTWATCH_*` overrides to agent settings using `lookup`.
pub fn apply_agent_overrides(settings: &mut AgentSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = Env(lookup);
    if let Some(v) = env.string("HOSTWATCH_SERVER_ADDR") {
        settings.server_addr = v;
    }
    if let Some(v) = env.string("HOSTWATCH_SERVER_ID") {
        settings.server_id = v;
    }
    if let Some(v) = env.string("HOSTWATCH_AUTH_SECRET") {
        settings.auth_secret = v;
    }
    if let Some(v) = env.u64("HOSTWATCH_REPORT_INTERVAL", 1, 300) {
        settings.report_interval_secs = v;
    }
    if let Some(v) = env.bool("HOSTWATCH_DISABLE_IP_LOOKUP") {
        settings.disable_ip_lookup = v;
    }
    if let Some(v) = env.string("HOSTWATCH_LOG_LEVEL") {
        settings.log_level = v;
    }
}

/// Apply `HOSTWATCH_*` overrides to dashboard settings using `lookup`.
pub fn apply_dashboard_overrides(
    settings: &mut DashboardSettings,
    lookup: &dyn Fn(&str) -> Option<String>,
) {
    let env = Env(lookup);
    if let Some(v) = env.string("HOSTWATCH_ADDRESS") {
        settings.address = v;
    }
    if let Some(v) = env.u64("HOSTWATCH_PORT", 1, 65535) {
        settings.port = u16::try_from(v).unwrap_or(settings.port);
    }
    if let Some(v) = env.string("HOSTWATCH_WS_PATH") {
        settings.web_socket_path = v;
    }
    if let Some(v) = env.u64("HOSTWATCH_REPORT_INTERVAL_MAX", 5, 86_400) {
        settings.report_time_interval_max = i64::try_from(v).unwrap_or(settings.report_time_interval_max);
    }
    if let Some(v) = env.string("HOSTWATCH_LOG_LEVEL") {
        settings.log_level = v;
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.0)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.0)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn write_settings(value: &Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(value.to_string().as_bytes()).unwrap();
        file
    }

    #[test]
    fn deep_merge_nested_objects() {
        let target = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let source = json!({"a": {"b": 10}, "e": 5});
        assert_eq!(
            deep_merge(target, source),
            json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 5})
        );
    }

    #[test]
    fn deep_merge_arrays_replaced_nulls_skipped() {
        let target = json!({"list": [1, 2], "keep": "x"});
        let source = json!({"list": [3], "keep": null});
        assert_eq!(deep_merge(target, source), json!({"list": [3], "keep": "x"}));
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 1, 10), None);
    }

    #[test]
    fn agent_overrides_apply() {
        let mut s = AgentSettings::default();
        let lookup = lookup_from(&[
            ("HOSTWATCH_SERVER_ID", "srv-9"),
            ("HOSTWATCH_REPORT_INTERVAL", "15"),
            ("HOSTWATCH_DISABLE_IP_LOOKUP", "true"),
        ]);
        apply_agent_overrides(&mut s, &lookup);
        assert_eq!(s.server_id, "srv-9");
        assert_eq!(s.report_interval_secs, 15);
        assert!(s.disable_ip_lookup);
    }

    #[test]
    fn invalid_override_ignored() {
        let mut s = DashboardSettings::default();
        let lookup = lookup_from(&[("HOSTWATCH_PORT", "99999"), ("HOSTWATCH_ADDRESS", "")]);
        apply_dashboard_overrides(&mut s, &lookup);
        assert_eq!(s.port, 8900);
        assert_eq!(s.address, "0.0.0.0");
    }

    #[test]
    fn normalize_dashboard_path_and_interval() {
        let mut s = DashboardSettings {
            web_socket_path: "agents".into(),
            report_time_interval_max: 2,
            ..DashboardSettings::default()
        };
        normalize_dashboard(&mut s);
        assert_eq!(s.web_socket_path, "/agents");
        assert_eq!(s.report_time_interval_max, 30);
    }

    #[test]
    fn load_dashboard_from_file() {
        let file = write_settings(&json!({
            "port": 9100,
            "webSocketPath": "ws-agents",
            "servers": [{"name": "web", "id": "srv-1", "secret": "long-enough-secret"}]
        }));
        let s = load_dashboard_settings(file.path()).unwrap();
        assert_eq!(s.port, 9100);
        assert_eq!(s.web_socket_path, "/ws-agents");
        assert_eq!(s.servers.len(), 1);
        assert_eq!(s.report_time_interval_max, 30);
    }

    #[test]
    fn load_dashboard_without_servers_fails() {
        let file = write_settings(&json!({"port": 9100}));
        let err = load_dashboard_settings(file.path()).unwrap_err();
        assert_matches!(err, SettingsError::Invalid { ref summary, .. } if summary.contains("servers"));
    }

    #[test]
    fn load_agent_from_file() {
        let file = write_settings(&json!({
            "serverAddr": "ws://10.0.0.1:8900/ws-report",
            "serverId": "srv-1",
            "authSecret": "long-enough-secret",
            "reconnect": {"maxAttempts": 4}
        }));
        let s = load_agent_settings(file.path()).unwrap();
        assert_eq!(s.server_id, "srv-1");
        assert_eq!(s.reconnect.max_attempts, 4);
        assert_eq!(s.reconnect.initial_delay_ms, 3000);
    }

    #[test]
    fn malformed_json_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert_matches!(load_agent_settings(file.path()), Err(SettingsError::Parse { .. }));
    }
}
