//! Agent service: wires the sampler, adaptive controller, network
//! collector, location lookup, and transport into the reporting loop.

use std::sync::Arc;
use std::time::Duration;

use hostwatch_core::{AppError, ErrorKind, ErrorLog, Severity, Snapshot, supervise};
use hostwatch_settings::AgentSettings;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adaptive::{AdaptiveConfig, AdaptiveIntervalController};
use crate::locate::{self, Location};
use crate::netstats::NetSpeedCollector;
use crate::sampler::{MetricsSampler, SampleError};
use crate::transport::{AgentTransport, TransportConfig, TransportError};

/// How often the public location is re-resolved.
const LOCATION_REFRESH: Duration = Duration::from_secs(3600);

/// The running agent.
pub struct AgentService {
    settings: AgentSettings,
    transport: AgentTransport,
    adaptive: Arc<AdaptiveIntervalController>,
    sampler: Arc<dyn MetricsSampler>,
    netstats: Arc<NetSpeedCollector>,
    location: Mutex<Location>,
    errors: Arc<ErrorLog>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentService {
    /// Build the service. Nothing runs until [`start`](Self::start).
    pub fn new(
        settings: AgentSettings,
        sampler: Arc<dyn MetricsSampler>,
        errors: Arc<ErrorLog>,
    ) -> Arc<Self> {
        let transport = AgentTransport::new(TransportConfig::from_settings(&settings), errors.clone());
        let adaptive = Arc::new(AdaptiveIntervalController::new(AdaptiveConfig::with_base(
            settings.report_interval(),
        )));
        Arc::new(Self {
            settings,
            transport,
            adaptive,
            sampler,
            netstats: Arc::new(NetSpeedCollector::new()),
            location: Mutex::new(Location::default()),
            errors,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The transport, for status and stats.
    pub fn transport(&self) -> &AgentTransport {
        &self.transport
    }

    /// The adaptive controller.
    pub fn adaptive(&self) -> &AdaptiveIntervalController {
        &self.adaptive
    }

    /// Start the transport and all background loops.
    pub fn start(self: &Arc<Self>) {
        self.transport.start();
        let mut tasks = self.tasks.lock();

        let svc = self.clone();
        tasks.push(supervise("agent-report", self.errors.clone(), self.cancel.clone(), move || {
            svc.clone().report_loop()
        }));

        let (adaptive, sampler, errors, cancel) = (
            self.adaptive.clone(),
            self.sampler.clone(),
            self.errors.clone(),
            self.cancel.clone(),
        );
        tasks.push(supervise("agent-adaptive", self.errors.clone(), self.cancel.clone(), move || {
            adaptive.clone().run(sampler.clone(), errors.clone(), cancel.clone())
        }));

        let (netstats, cancel) = (self.netstats.clone(), self.cancel.clone());
        tasks.push(supervise("agent-netstats", self.errors.clone(), self.cancel.clone(), move || {
            let (netstats, cancel) = (netstats.clone(), cancel.clone());
            async move { netstats.run(cancel).await }
        }));

        if self.settings.disable_ip_lookup {
            debug!("public ip lookup disabled");
        } else {
            let svc = self.clone();
            tasks.push(supervise("agent-locate", self.errors.clone(), self.cancel.clone(), move || {
                svc.clone().locate_loop()
            }));
        }

        info!(
            server_id = %self.settings.server_id,
            interval_ms = self.adaptive.current_interval().as_millis(),
            "agent started"
        );
    }

    /// Stop all loops, then close the transport.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        self.transport.close().await;
        self.errors.log_stats();
        info!("agent stopped");
    }

    /// Sample and stamp one report.
    pub async fn build_report(&self) -> Result<Snapshot, SampleError> {
        let sampler = self.sampler.clone();
        let mut snapshot = tokio::task::spawn_blocking(move || sampler.sample()).await??;
        snapshot.id.clone_from(&self.settings.server_id);
        snapshot.network_info = self.netstats.latest();
        let location = self.location.lock().clone();
        snapshot.ip = location.ip;
        snapshot.loc = location.loc;
        Ok(snapshot)
    }

    /// Sample and send one report.
    pub async fn report_once(&self) {
        let snapshot = match self.build_report().await {
            Ok(s) => s,
            Err(e) => {
                self.errors.record(&AppError::wrap(
                    ErrorKind::System,
                    Severity::Medium,
                    "metric sample failed",
                    e,
                ));
                return;
            }
        };
        match self.transport.send(&snapshot).await {
            Ok(()) => counter!("agent_reports_total").increment(1),
            // Already recorded by the transport.
            Err(TransportError::QueueFull | TransportError::Closed) => {}
            Err(e) => self.errors.record(&AppError::wrap(
                ErrorKind::Data,
                Severity::Medium,
                "report not sent",
                e,
            )),
        }
    }

    async fn report_loop(self: Arc<Self>) {
        loop {
            self.report_once().await;
            let next = self.adaptive.current_interval();
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(next) => {}
            }
        }
    }

    async fn locate_loop(self: Arc<Self>) {
        let client = reqwest::Client::new();
        loop {
            match locate::lookup(&client, locate::TRACE_URL).await {
                Ok(location) => {
                    info!(ip = %location.ip, loc = %location.loc, "public location resolved");
                    *self.location.lock() = location;
                }
                Err(e) => warn!(error = %e, "public ip lookup failed"),
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(LOCATION_REFRESH) => {}
            }
        }
    }
}
