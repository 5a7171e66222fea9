//! Outbound WebSocket transport to the dashboard.
//!
//! State machine: `Disconnected → Connecting → Connected → Disconnected`,
//! driven by three supervised loops sharing one cancellation token:
//!
//! 1. **Connect supervisor**: on every tick while disconnected, dials with
//!    backoff under the reconnect [`RetryPolicy`]. An exhausted cycle is
//!    logged at high severity and retried on the next tick.
//! 2. **Send loop**: drains the bounded outbound queue in FIFO order while
//!    connected. A write failure drops the connection.
//! 3. **Heartbeat loop**: pings on an interval and drops the connection if
//!    no pong has arrived within the timeout.
//!
//! Each live connection also has a reader task. Connections are numbered by
//! a generation counter so a stale reader or writer can never tear down a
//! newer connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hostwatch_core::protocol::{AUTH_SECRET_HEADER, SERVER_ID_HEADER};
use hostwatch_core::{
    AppError, ErrorKind, ErrorLog, RetryError, RetryExecutor, RetryPolicy, Severity,
    ShutdownCoordinator, supervise,
};
use hostwatch_settings::AgentSettings;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::pool::BufferPool;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Upper bound on waiting for a close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    /// No connection; the supervisor will dial on its next tick.
    Disconnected,
    /// A dial cycle is in progress.
    Connecting,
    /// Handshake complete.
    Connected,
}

/// Transport failures surfaced to callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The outbound queue stayed full for the whole enqueue timeout.
    #[error("send queue full, message dropped")]
    QueueFull,
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
    /// The payload could not be encoded.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Handshake or socket failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    /// A credential could not be used as a header value.
    #[error("invalid handshake header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Transport tuning.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Dashboard endpoint.
    pub url: String,
    /// Identity sent as `X-SERVER-ID`.
    pub server_id: String,
    /// Secret sent as `X-AUTH-SECRET`.
    pub auth_secret: String,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Drop the connection if no pong arrives within this window.
    pub heartbeat_timeout: Duration,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Longest [`AgentTransport::send`] waits for queue space.
    pub enqueue_timeout: Duration,
    /// How often the supervisor checks whether to dial.
    pub connect_check_interval: Duration,
    /// Backoff for one dial cycle.
    pub reconnect: RetryPolicy,
    /// Pause between cancelling and releasing resources on close.
    pub close_grace: Duration,
}

impl TransportConfig {
    /// Build from agent settings.
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            url: settings.server_addr.clone(),
            server_id: settings.server_id.clone(),
            auth_secret: settings.auth_secret.clone(),
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            queue_capacity: settings.send_queue_capacity.max(1),
            enqueue_timeout: settings.enqueue_timeout(),
            connect_check_interval: Duration::from_secs(5),
            reconnect: settings.reconnect.clone(),
            close_grace: hostwatch_core::shutdown::DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Point-in-time transport counters.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// Current state.
    pub status: TransportStatus,
    /// Successful handshakes.
    pub connections: u64,
    /// Handshakes after the first.
    pub reconnections: u64,
    /// Frames written.
    pub messages_sent: u64,
    /// Data frames read.
    pub messages_received: u64,
    /// Payloads dropped on a full queue or failed write.
    pub messages_dropped: u64,
    /// Items waiting in the queue.
    pub queued: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

struct Link {
    status: TransportStatus,
    generation: u64,
    last_pong: Instant,
    conn_cancel: CancellationToken,
}

struct ActiveConn {
    generation: u64,
    sink: WsSink,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Shared {
    config: TransportConfig,
    link: Mutex<Link>,
    status_tx: watch::Sender<TransportStatus>,
    writer: tokio::sync::Mutex<Option<ActiveConn>>,
    queue_tx: Mutex<Option<mpsc::Sender<String>>>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    shutdown: ShutdownCoordinator,
    errors: Arc<ErrorLog>,
    counters: Counters,
    pool: BufferPool,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Self-healing client connection to the dashboard.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct AgentTransport {
    shared: Arc<Shared>,
}

impl AgentTransport {
    /// Create a transport. Nothing is dialled until [`start`](Self::start).
    pub fn new(config: TransportConfig, errors: Arc<ErrorLog>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (status_tx, _) = watch::channel(TransportStatus::Disconnected);
        let shutdown = ShutdownCoordinator::with_grace(config.close_grace);
        Self {
            shared: Arc::new(Shared {
                config,
                link: Mutex::new(Link {
                    status: TransportStatus::Disconnected,
                    generation: 0,
                    last_pong: Instant::now(),
                    conn_cancel: CancellationToken::new(),
                }),
                status_tx,
                writer: tokio::sync::Mutex::new(None),
                queue_tx: Mutex::new(Some(queue_tx)),
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                shutdown,
                errors,
                counters: Counters::default(),
                pool: BufferPool::default(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the connect supervisor, send loop, and heartbeat loop.
    ///
    /// Calling this more than once has no effect.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) || self.shared.shutdown.is_closed() {
            return;
        }
        let token = self.shared.shutdown.token();
        let errors = self.shared.errors.clone();

        let s = self.shared.clone();
        let connect = supervise("transport-connect", errors.clone(), token.clone(), move || {
            s.clone().connect_supervisor()
        });
        let s = self.shared.clone();
        let send = supervise("transport-send", errors.clone(), token.clone(), move || {
            s.clone().send_loop()
        });
        let s = self.shared.clone();
        let heartbeat = supervise("transport-heartbeat", errors, token, move || {
            s.clone().heartbeat_loop()
        });
        self.shared.tasks.lock().extend([connect, send, heartbeat]);
        info!(url = %self.shared.config.url, "transport started");
    }

    /// Serialize `payload` and queue it for sending.
    ///
    /// Waits at most the configured enqueue timeout for queue space. On
    /// timeout the payload is dropped, the failure is recorded, and
    /// [`TransportError::QueueFull`] is returned.
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), TransportError> {
        let shared = &self.shared;
        if shared.shutdown.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = shared.pool.encode(payload)?;
        let tx = shared.queue_tx.lock().clone().ok_or(TransportError::Closed)?;

        match tx.send_timeout(text, shared.config.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                let _ = shared.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                counter!("agent_send_dropped_total").increment(1);
                shared.errors.record(&AppError::new(
                    ErrorKind::Network,
                    Severity::Medium,
                    "send queue full, message dropped",
                ));
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Shut down: cancel all loops, wait the grace period, drop the
    /// connection, then close the queue. Idempotent.
    pub async fn close(&self) {
        let shared = &self.shared;
        if !shared.shutdown.begin_close() {
            return;
        }
        shared.shutdown.grace().await;

        let generation = shared.link.lock().generation;
        let _ = shared.mark_disconnected(generation).await;
        drop(shared.queue_tx.lock().take());

        let handles = std::mem::take(&mut *shared.tasks.lock());
        shared.shutdown.drain(handles, Some(Duration::from_secs(2))).await;
        info!("transport closed");
    }

    /// Current state.
    pub fn status(&self) -> TransportStatus {
        self.shared.link.lock().status
    }

    /// Whether a connection is established.
    pub fn is_connected(&self) -> bool {
        self.status() == TransportStatus::Connected
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_closed()
    }

    /// Watch state transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        let connections = c.connections.load(Ordering::Relaxed);
        let queued = self
            .shared
            .queue_tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());
        TransportStats {
            status: self.status(),
            connections,
            reconnections: connections.saturating_sub(1),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            queued,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loops
// ─────────────────────────────────────────────────────────────────────────────

impl Shared {
    fn set_status(&self, link: &mut Link, status: TransportStatus) {
        link.status = status;
        let _ = self.status_tx.send_replace(status);
    }

    /// Move to `Disconnected` if `generation` is still the live connection.
    /// Returns `false` if the connection was already gone or replaced.
    async fn mark_disconnected(&self, generation: u64) -> bool {
        {
            let mut link = self.link.lock();
            if link.generation != generation || link.status == TransportStatus::Disconnected {
                return false;
            }
            link.conn_cancel.cancel();
            self.set_status(&mut link, TransportStatus::Disconnected);
        }

        let taken = {
            let mut slot = self.writer.lock().await;
            if slot.as_ref().is_some_and(|c| c.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(mut conn) = taken {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, conn.sink.close()).await;
        }
        warn!(generation, "disconnected from dashboard");
        true
    }

    async fn connect_supervisor(self: Arc<Self>) {
        let cancel = self.shutdown.token();
        let mut tick = tokio::time::interval(self.config.connect_check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            {
                let mut link = self.link.lock();
                if link.status != TransportStatus::Disconnected {
                    continue;
                }
                self.set_status(&mut link, TransportStatus::Connecting);
            }
            self.connect_cycle(&cancel).await;
        }
    }

    async fn connect_cycle(self: &Arc<Self>, cancel: &CancellationToken) {
        let executor = RetryExecutor::new(self.config.reconnect.clone(), self.errors.clone());
        match executor.run(cancel, ErrorKind::Network, || self.dial()).await {
            Ok(ws) => self.install(ws).await,
            Err(RetryError::Cancelled { .. }) => {
                let mut link = self.link.lock();
                self.set_status(&mut link, TransportStatus::Disconnected);
            }
            Err(RetryError::Failed { attempts, last }) => {
                self.errors.record(&AppError::wrap(
                    ErrorKind::Network,
                    Severity::High,
                    format!("dashboard unreachable after {attempts} attempts, retrying next cycle"),
                    last,
                ));
                let mut link = self.link.lock();
                self.set_status(&mut link, TransportStatus::Disconnected);
            }
        }
    }

    async fn dial(&self) -> Result<WsStream, TransportError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        let _ = headers.insert(
            AUTH_SECRET_HEADER,
            HeaderValue::from_str(&self.config.auth_secret)?,
        );
        let _ = headers.insert(SERVER_ID_HEADER, HeaderValue::from_str(&self.config.server_id)?);

        let (ws, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(status = %response.status(), "handshake complete");
        Ok(ws)
    }

    async fn install(self: &Arc<Self>, ws: WsStream) {
        let (sink, source) = ws.split();
        let conn_cancel = self.shutdown.token().child_token();

        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.generation
        };
        *self.writer.lock().await = Some(ActiveConn {
            generation,
            sink,
            cancel: conn_cancel.clone(),
        });
        {
            let mut link = self.link.lock();
            link.last_pong = Instant::now();
            link.conn_cancel = conn_cancel.clone();
            self.set_status(&mut link, TransportStatus::Connected);
        }

        let connections = self.counters.connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("agent_connections_total").increment(1);
        info!(generation, connections, url = %self.config.url, "connected to dashboard");

        let reader = self.clone();
        drop(tokio::spawn(async move {
            reader.read_loop(source, generation, conn_cancel).await;
        }));
    }

    #[instrument(skip_all, fields(generation = generation))]
    async fn read_loop(&self, mut source: WsSource, generation: u64, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(Message::Pong(_))) => {
                    self.link.lock().last_pong = Instant::now();
                }
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    let _ = self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                    info!(%reason, "dashboard closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    self.errors.record(&AppError::wrap(
                        ErrorKind::Network,
                        Severity::Medium,
                        "read failed",
                        e,
                    ));
                    break;
                }
                None => break,
            }
        }
        let _ = self.mark_disconnected(generation).await;
    }

    /// Write one frame to the live connection. On failure the connection is
    /// dropped and the frame is lost.
    async fn write_frame(&self, message: Message) -> bool {
        let mut slot = self.writer.lock().await;
        let Some(conn) = slot.as_mut() else {
            return false;
        };
        let generation = conn.generation;
        let cancel = conn.cancel.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => Ok(false),
            r = conn.sink.send(message) => r.map(|()| true),
        };
        drop(slot);

        match result {
            Ok(written) => written,
            Err(e) => {
                self.errors.record(&AppError::wrap(
                    ErrorKind::Network,
                    Severity::Medium,
                    "write failed",
                    e,
                ));
                let _ = self.mark_disconnected(generation).await;
                false
            }
        }
    }

    async fn send_loop(self: Arc<Self>) {
        let cancel = self.shutdown.token();
        let mut status = self.status_tx.subscribe();
        let mut queue = self.queue_rx.lock().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                ok = wait_status(&mut status, |s| s == TransportStatus::Connected) => {
                    if !ok { break; }
                }
            }
            let text = tokio::select! {
                () = cancel.cancelled() => break,
                item = queue.recv() => match item {
                    Some(text) => text,
                    None => break,
                },
                _ = wait_status(&mut status, |s| s != TransportStatus::Connected) => continue,
            };
            if self.write_frame(Message::Text(text.into())).await {
                let _ = self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                let _ = self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!("send loop stopped");
    }

    /// Pings every interval and drops the connection once the pong deadline
    /// passes. The deadline is watched independently of the writer, so a
    /// write stalled on a peer that stopped reading cannot hide a missing pong.
    async fn heartbeat_loop(self: Arc<Self>) {
        let cancel = self.shutdown.token();
        let timeout = self.config.heartbeat_timeout;
        let mut status = self.status_tx.subscribe();
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let (connected, generation, last_pong) = {
                let link = self.link.lock();
                (link.status == TransportStatus::Connected, link.generation, link.last_pong)
            };
            if !connected {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    ok = wait_status(&mut status, |s| s == TransportStatus::Connected) => {
                        if !ok { break; }
                    }
                }
                tick.reset();
                continue;
            }

            let deadline = last_pong + timeout;
            if Instant::now() >= deadline {
                self.pong_overdue(generation, last_pong).await;
                continue;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => continue,
                _ = wait_status(&mut status, |s| s != TransportStatus::Connected) => continue,
                _ = tick.tick() => {}
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => {}
                written = self.write_frame(Message::Ping(Vec::new().into())) => {
                    if !written {
                        debug!("heartbeat ping not written");
                    }
                }
            }
        }
    }

    async fn pong_overdue(&self, generation: u64, last_pong: Instant) {
        let silent = last_pong.elapsed();
        self.errors.record(&AppError::new(
            ErrorKind::Network,
            Severity::Medium,
            format!("no pong for {}ms, reconnecting", silent.as_millis()),
        ));
        counter!("agent_heartbeat_timeouts_total").increment(1);
        let _ = self.mark_disconnected(generation).await;
    }
}

async fn wait_status(
    rx: &mut watch::Receiver<TransportStatus>,
    pred: impl Fn(TransportStatus) -> bool,
) -> bool {
    rx.wait_for(|s| pred(*s)).await.is_ok()
}
