//! Browser connection, from upgrade to disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::histogram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::hub::{BROWSER_CHANNEL_CAPACITY, BroadcastHub, BrowserSession};
use crate::metrics::FRONTEND_SESSION_DURATION_SECONDS;

/// Interval between server-initiated Ping frames.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a browser may go without a Pong.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Serve one browser until it leaves, stops answering pings, or `cancel`
/// fires.
#[instrument(skip_all, fields(session = %session_id))]
pub async fn run_browser_session(
    ws: WebSocket,
    session_id: String,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(BROWSER_CHANNEL_CAPACITY);
    let session = Arc::new(BrowserSession::new(session_id.clone(), send_tx));
    info!("browser connected");

    hub.add(session.clone());

    let outbound_session = session.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_session.check_alive()
                        && outbound_session.last_pong_elapsed() > PONG_TIMEOUT
                    {
                        warn!("browser unresponsive for {:?}, disconnecting", PONG_TIMEOUT);
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = &mut outbound => break,
            frame = ws_rx.next() => {
                let Some(Ok(msg)) = frame else { break };
                match msg {
                    Message::Text(text) => hub.handle_client_text(&session, text.as_str()),
                    Message::Binary(data) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            hub.handle_client_text(&session, text);
                        } else {
                            debug!(len = data.len(), "ignoring non-utf-8 binary frame");
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => session.mark_alive(),
                    Message::Close(_) => {
                        debug!("browser sent close frame");
                        break;
                    }
                }
            }
        }
    }

    info!(dropped = session.drop_count(), "browser disconnected");
    histogram!(FRONTEND_SESSION_DURATION_SECONDS).record(session.connected_at.elapsed().as_secs_f64());
    outbound.abort();
    let _ = hub.remove(&session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_timeout_spans_two_ping_intervals() {
        assert_eq!(PONG_TIMEOUT, PING_INTERVAL * 2);
    }
}
