//! Wire constants and the browser-facing message envelope.

use serde::{Deserialize, Serialize};

use crate::snapshot::StatusView;

/// Handshake header carrying the agent's shared secret (`X-AUTH-SECRET`).
///
/// Stored lower-case; HTTP header names compare case-insensitively.
pub const AUTH_SECRET_HEADER: &str = "x-auth-secret";
/// Handshake header carrying the agent's identity (`X-SERVER-ID`).
pub const SERVER_ID_HEADER: &str = "x-server-id";

/// Default agent endpoint path.
pub const DEFAULT_AGENT_PATH: &str = "/ws-report";
/// Browser endpoint path.
pub const FRONTEND_PATH: &str = "/ws-frontend";

/// Messages exchanged on the browser socket, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrontendMessage {
    /// Server push of the full fleet view.
    ServerStatusUpdate {
        /// One entry per known host.
        data: Vec<StatusView>,
        /// Unix seconds when the view was built.
        timestamp: i64,
    },
    /// Application-level ping from the browser.
    Ping,
    /// Reply to [`FrontendMessage::Ping`].
    Pong {
        /// Unix seconds.
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_parses_from_bare_type() {
        let msg: FrontendMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, FrontendMessage::Ping);
    }

    #[test]
    fn pong_wire_shape() {
        let json = serde_json::to_value(FrontendMessage::Pong { timestamp: 17 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "pong", "timestamp": 17}));
    }

    #[test]
    fn status_update_wire_shape() {
        let json = serde_json::to_value(FrontendMessage::ServerStatusUpdate {
            data: vec![],
            timestamp: 5,
        })
        .unwrap();
        assert_eq!(json["type"], "server_status_update");
        assert_eq!(json["data"], serde_json::json!([]));
        assert_eq!(json["timestamp"], 5);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(serde_json::from_str::<FrontendMessage>(r#"{"type":"subscribe"}"#).is_err());
    }
}
