//! WebSocket session loops for agents and browsers.

pub mod agent_session;
pub mod browser_session;

pub use agent_session::run_agent_session;
pub use browser_session::run_browser_session;
