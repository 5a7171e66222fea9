//! # hostwatch-settings
//!
//! Layered settings for the agent and the dashboard.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`AgentSettings::default()`] / [`DashboardSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `HOSTWATCH_*` overrides (highest priority)
//!
//! The merged result is normalized and validated; see [`validate`].
//! [`SettingsWatcher`] reports file changes so the dashboard can reload its
//! roster without a restart.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;
pub mod validate;
pub mod watcher;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_agent_settings, load_dashboard_settings};
pub use types::{AgentSettings, DashboardSettings, ServerEntry};
pub use validate::{IssueLevel, ValidationIssue, is_valid_identity};
pub use watcher::SettingsWatcher;
