//! Inbound agent connection, from upgrade to disconnect.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, instrument};

use crate::registry::{Admission, AgentSessionRegistry, CloseReason};

fn close_frame(reason: CloseReason) -> CloseFrame {
    let code = match reason {
        CloseReason::Shutdown => close_code::AWAY,
        CloseReason::Replaced | CloseReason::HeartbeatTimeout | CloseReason::Removed => {
            close_code::POLICY
        }
    };
    CloseFrame {
        code,
        reason: reason.as_str().into(),
    }
}

/// Pump one admitted agent socket until it closes or the registry kills it.
///
/// Reports are handed to the registry one at a time, so processing is
/// serialized per session. Control frames count as heartbeats; the socket
/// layer answers pings on its own.
#[instrument(skip_all, fields(server_id = %admission.identity, session = %admission.token))]
pub async fn run_agent_session(
    ws: WebSocket,
    admission: Admission,
    registry: Arc<AgentSessionRegistry>,
) {
    let Admission { token, control, .. } = admission;
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            reason = control.closed() => {
                info!(reason = reason.as_str(), "closing agent session");
                let _ = ws_tx.send(Message::Close(Some(close_frame(reason)))).await;
                break;
            }
            frame = ws_rx.next() => {
                let Some(Ok(msg)) = frame else {
                    debug!("agent socket ended");
                    break;
                };
                match msg {
                    Message::Text(text) => {
                        let _ = registry.on_message(token, text.as_str());
                    }
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            let _ = registry.on_message(token, text);
                        }
                        Err(_) => registry.on_bad_frame(token, "binary frame is not valid utf-8"),
                    },
                    Message::Ping(_) | Message::Pong(_) => registry.on_heartbeat(token),
                    Message::Close(_) => {
                        debug!("agent sent close frame");
                        break;
                    }
                }
            }
        }
    }

    registry.on_disconnect(token);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes() {
        assert_eq!(close_frame(CloseReason::Shutdown).code, close_code::AWAY);
        let frame = close_frame(CloseReason::Replaced);
        assert_eq!(frame.code, close_code::POLICY);
        assert_eq!(frame.reason.as_str(), "replaced by a newer connection");
    }
}
