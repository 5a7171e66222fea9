//! # hostwatch-agent
//!
//! Per-host agent. Samples system metrics and streams them to the dashboard
//! over an authenticated, self-healing WebSocket.
//!
//! - [`transport`]: [`AgentTransport`], the managed outbound connection
//! - [`adaptive`]: [`AdaptiveIntervalController`], load-driven cadence
//! - [`sampler`]: [`MetricsSampler`] and the `sysinfo` implementation
//! - [`netstats`]: interface throughput collector
//! - [`locate`]: public IP lookup
//! - [`service`]: [`AgentService`], the reporting loop
//! - [`pool`]: reusable serialization buffers

#![deny(unsafe_code)]

pub mod adaptive;
pub mod locate;
pub mod netstats;
pub mod pool;
pub mod sampler;
pub mod service;
pub mod transport;

pub use adaptive::{AdaptiveConfig, AdaptiveIntervalController, LoadInfo};
pub use sampler::{LoadSample, MetricsSampler, SampleError, SysinfoSampler};
pub use service::AgentService;
pub use transport::{AgentTransport, TransportConfig, TransportError, TransportStats, TransportStatus};
