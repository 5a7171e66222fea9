//! Network throughput collector.
//!
//! Sums byte counters over physical interfaces once per second and derives
//! receive/transmit rates from the delta.

use std::time::Duration;

use hostwatch_core::snapshot::NetworkInfo;
use parking_lot::Mutex;
use sysinfo::Networks;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Collection period.
pub const NET_STAT_TICK: Duration = Duration::from_secs(1);

/// Interfaces whose name contains any of these are virtual and skipped.
const EXCLUDED_INTERFACES: [&str; 8] = ["lo", "tun", "docker", "veth", "br-", "vmbr", "vnet", "kube"];

/// Whether `name` is a virtual or loopback interface.
pub fn is_excluded(name: &str) -> bool {
    EXCLUDED_INTERFACES.iter().any(|p| name.contains(p))
}

#[derive(Debug, Default)]
struct SpeedState {
    last: Option<(Instant, u64, u64)>,
    info: NetworkInfo,
}

/// Tracks interface totals and derives speeds.
pub struct NetSpeedCollector {
    networks: Mutex<Networks>,
    state: Mutex<SpeedState>,
}

impl Default for NetSpeedCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl NetSpeedCollector {
    /// Create a collector over the current interface list.
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            state: Mutex::new(SpeedState::default()),
        }
    }

    /// Latest totals and speeds.
    pub fn latest(&self) -> NetworkInfo {
        self.state.lock().info
    }

    /// Read interface counters and update speeds.
    pub fn refresh(&self) -> NetworkInfo {
        let (rx, tx) = {
            let mut networks = self.networks.lock();
            networks.refresh_list();
            networks
                .list()
                .iter()
                .filter(|(name, _)| !is_excluded(name))
                .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                    (
                        rx.saturating_add(data.total_received()),
                        tx.saturating_add(data.total_transmitted()),
                    )
                })
        };
        self.update(rx, tx, Instant::now())
    }

    /// Fold one reading of summed counters taken at `at`.
    ///
    /// The first reading, and any reading where a counter went backwards,
    /// yields zero speed for that direction.
    pub fn update(&self, rx_total: u64, tx_total: u64, at: Instant) -> NetworkInfo {
        let mut state = self.state.lock();
        let (in_speed, out_speed) = match state.last {
            Some((prev_at, prev_rx, prev_tx)) => {
                let secs = at.saturating_duration_since(prev_at).as_secs_f64();
                (rate(prev_rx, rx_total, secs), rate(prev_tx, tx_total, secs))
            }
            None => (0, 0),
        };
        state.last = Some((at, rx_total, tx_total));
        state.info = NetworkInfo {
            in_speed,
            out_speed,
            in_transfer: rx_total,
            out_transfer: tx_total,
        };
        state.info
    }

    /// Refresh every [`NET_STAT_TICK`] until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(NET_STAT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let info = self.refresh();
            debug!(in_speed = info.in_speed, out_speed = info.out_speed, "network sample");
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn rate(prev: u64, now: u64, secs: f64) -> u64 {
    if now < prev || secs <= 0.0 {
        return 0;
    }
    ((now - prev) as f64 / secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_interfaces_excluded() {
        for name in ["lo", "lo0", "tun0", "docker0", "veth12ab", "br-5f2", "vmbr0", "vnet3", "kube-ipvs0"] {
            assert!(is_excluded(name), "{name}");
        }
        for name in ["eth0", "ens3", "enp0s31f6", "wlan0"] {
            assert!(!is_excluded(name), "{name}");
        }
    }

    #[test]
    fn first_reading_has_no_speed() {
        let c = NetSpeedCollector::new();
        let info = c.update(1000, 2000, Instant::now());
        assert_eq!(info.in_speed, 0);
        assert_eq!(info.out_speed, 0);
        assert_eq!(info.in_transfer, 1000);
        assert_eq!(info.out_transfer, 2000);
    }

    #[test]
    fn speed_is_delta_over_elapsed() {
        let c = NetSpeedCollector::new();
        let t0 = Instant::now();
        let _ = c.update(1000, 2000, t0);
        let info = c.update(5000, 2600, t0 + Duration::from_secs(2));
        assert_eq!(info.in_speed, 2000);
        assert_eq!(info.out_speed, 300);
        assert_eq!(c.latest(), info);
    }

    #[test]
    fn counter_reset_yields_zero() {
        let c = NetSpeedCollector::new();
        let t0 = Instant::now();
        let _ = c.update(10_000, 10_000, t0);
        let info = c.update(50, 20_000, t0 + Duration::from_secs(1));
        assert_eq!(info.in_speed, 0);
        assert_eq!(info.out_speed, 10_000);
    }

    #[test]
    fn same_instant_yields_zero() {
        let c = NetSpeedCollector::new();
        let t0 = Instant::now();
        let _ = c.update(0, 0, t0);
        assert_eq!(c.update(100, 100, t0).in_speed, 0);
    }
}
