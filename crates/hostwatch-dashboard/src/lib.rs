//! # hostwatch-dashboard
//!
//! Central aggregator. Terminates authenticated agent sockets, keeps the
//! latest snapshot per host, and pushes the fleet view to browsers.
//!
//! - [`roster`]: authorized identities ([`Roster`], [`StaticRoster`])
//! - [`registry`]: [`AgentSessionRegistry`], one live session per identity
//! - [`store`]: [`SnapshotStore`]
//! - [`hub`]: [`BroadcastHub`], browser fan-out
//! - [`websocket`]: per-connection session loops
//! - [`server`]: axum router and REST handlers
//! - [`service`]: [`Dashboard`], lifecycle and reload

#![deny(unsafe_code)]

pub mod hub;
pub mod metrics;
pub mod registry;
pub mod response;
pub mod roster;
pub mod server;
pub mod service;
pub mod store;
pub mod websocket;

pub use hub::{BroadcastHub, BrowserSession, HubStats};
pub use registry::{
    Admission, AgentSessionRegistry, CloseReason, ConnectionInfo, ConnectionStatus, Ingest,
    RegistryStats, SessionToken,
};
pub use response::ApiResponse;
pub use roster::{Roster, RosterEntry, RosterMeta, StaticRoster};
pub use service::{Dashboard, DashboardStats, ReloadSummary, ServeError};
pub use store::SnapshotStore;
