//! Metric snapshot reported by an agent, and the flattened status view
//! served to browsers.
//!
//! Wire format is camelCase JSON. Every field defaults, so partial reports
//! still parse; a report that is not a JSON object does not.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Latest metric bundle for one host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    /// Display name (stamped by the dashboard).
    pub name: String,
    /// Display group (stamped by the dashboard).
    pub group: String,
    /// Server identity.
    pub id: String,
    /// Unix seconds of the last accepted report (stamped by the dashboard).
    pub last_report_time: i64,
    /// Host and OS details.
    pub host_info: HostInfo,
    /// CPU usage.
    pub cpu_info: CpuInfo,
    /// Physical memory usage.
    pub virtual_memory_info: MemoryInfo,
    /// Swap usage.
    pub swap_memory_info: SwapInfo,
    /// Disk usage.
    pub disk_info: DiskInfo,
    /// Network throughput.
    pub network_info: NetworkInfo,
    /// Public IP as seen by the agent.
    pub ip: String,
    /// Location code (lower-case country code).
    pub loc: String,
}

/// Host and OS details.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostInfo {
    /// OS family, e.g. `linux`.
    pub os: String,
    /// Distribution or product, e.g. `ubuntu`.
    pub platform: String,
    /// Distribution version.
    pub platform_version: String,
    /// CPU architecture.
    pub kernel_arch: String,
    /// Kernel version.
    pub kernel_version: String,
    /// Seconds since boot.
    pub uptime: u64,
    /// Unix seconds at boot.
    pub boot_time: u64,
    /// Virtualization system, if detected.
    pub virtualization_system: String,
    /// 1/5/15-minute load averages.
    #[serde(alias = "avgStat")]
    pub load_avg: LoadAvg,
}

/// System load averages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadAvg {
    /// 1-minute average.
    pub load1: f64,
    /// 5-minute average.
    pub load5: f64,
    /// 15-minute average.
    pub load15: f64,
}

/// CPU usage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuInfo {
    /// Overall usage percent.
    pub percent: f64,
    /// One line per distinct CPU model, e.g. `"Intel Xeon 4 Virtual Core"`.
    #[serde(alias = "info")]
    pub model_summaries: Vec<String>,
}

/// Physical memory usage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryInfo {
    /// Total bytes.
    pub total: u64,
    /// Used bytes.
    pub used: u64,
    /// Used percent.
    pub used_percent: f64,
}

/// Swap usage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwapInfo {
    /// Total bytes.
    pub total: u64,
    /// Used bytes.
    pub used: u64,
    /// Free bytes.
    pub free: u64,
    /// Used percent.
    pub used_percent: f64,
}

/// Disk usage across all partitions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskInfo {
    /// Total bytes.
    pub total: u64,
    /// Used bytes.
    pub used: u64,
    /// Used percent.
    pub used_percent: f64,
    /// Per-partition breakdown.
    pub partitions: Vec<Partition>,
}

/// One mounted partition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Partition {
    /// Mount point.
    pub mount_point: String,
    /// Filesystem type.
    pub fstype: String,
    /// Total bytes.
    pub total: u64,
    /// Free bytes.
    pub free: u64,
    /// Used bytes.
    pub used: u64,
    /// Used percent.
    pub used_percent: f64,
}

/// Network throughput, summed over physical interfaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInfo {
    /// Receive rate, bytes/s.
    #[serde(alias = "netInSpeed")]
    pub in_speed: u64,
    /// Transmit rate, bytes/s.
    #[serde(alias = "netOutSpeed")]
    pub out_speed: u64,
    /// Bytes received since boot.
    #[serde(alias = "netInTransfer")]
    pub in_transfer: u64,
    /// Bytes transmitted since boot.
    #[serde(alias = "netOutTransfer")]
    pub out_transfer: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusView
// ─────────────────────────────────────────────────────────────────────────────

/// Flattened per-host record for the browser and REST consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    /// Display name.
    pub name: String,
    /// Display group.
    pub group: String,
    /// Server identity.
    pub id: String,
    /// Unix seconds of the last accepted report.
    pub last_report_time: i64,
    /// Seconds since boot.
    pub uptime: u64,
    /// Platform label, e.g. `ubuntu 24.04`.
    pub platform: String,
    /// CPU usage percent.
    pub cpu_percent: f64,
    /// Memory usage percent.
    #[serde(rename = "RAMPercent")]
    pub ram_percent: f64,
    /// Swap usage percent.
    #[serde(rename = "SWAPPercent")]
    pub swap_percent: f64,
    /// Disk usage percent.
    pub disk_percent: f64,
    /// Receive rate, bytes/s.
    pub net_in_speed: u64,
    /// Transmit rate, bytes/s.
    pub net_out_speed: u64,
    /// Location code.
    pub loc: String,
    /// Detail block.
    pub host_info: HostDetail,
    /// Whether the last report is recent enough to count as online.
    pub is_online: bool,
}

/// Detail block of a [`StatusView`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDetail {
    /// CPU model summaries.
    pub cpu_info: Vec<String>,
    /// Load averages.
    pub load_avg: LoadAvg,
    /// Total memory bytes.
    #[serde(rename = "RAMTotal")]
    pub ram_total: u64,
    /// Used memory bytes.
    #[serde(rename = "RAMUsed")]
    pub ram_used: u64,
    /// Total swap bytes.
    pub swap_total: u64,
    /// Used swap bytes.
    pub swap_used: u64,
    /// Total disk bytes.
    pub disk_total: u64,
    /// Used disk bytes.
    pub disk_used: u64,
    /// Per-partition breakdown.
    pub disk_partitions: Vec<Partition>,
    /// Bytes received since boot.
    pub net_in_transfer: u64,
    /// Bytes transmitted since boot.
    pub net_out_transfer: u64,
    /// OS family.
    pub os: String,
    /// Distribution.
    pub platform: String,
    /// Distribution version.
    pub platform_version: String,
    /// Virtualization system.
    pub virtualization_system: String,
    /// Kernel version.
    pub kernel_version: String,
    /// CPU architecture.
    pub kernel_arch: String,
}

impl StatusView {
    /// Build the view for `snapshot` as of `now` (unix seconds).
    ///
    /// A host is online when its last report is at most `max_report_gap_secs`
    /// old.
    pub fn from_snapshot(snapshot: &Snapshot, now: i64, max_report_gap_secs: i64) -> Self {
        let host = &snapshot.host_info;
        let platform = if host.platform.contains("Windows") {
            host.platform.clone()
        } else {
            format!("{} {}", host.platform, host.platform_version)
        };
        Self {
            name: snapshot.name.clone(),
            group: snapshot.group.clone(),
            id: snapshot.id.clone(),
            last_report_time: snapshot.last_report_time,
            uptime: host.uptime,
            platform,
            cpu_percent: snapshot.cpu_info.percent,
            ram_percent: snapshot.virtual_memory_info.used_percent,
            swap_percent: snapshot.swap_memory_info.used_percent,
            disk_percent: snapshot.disk_info.used_percent,
            net_in_speed: snapshot.network_info.in_speed,
            net_out_speed: snapshot.network_info.out_speed,
            loc: snapshot.loc.clone(),
            host_info: HostDetail {
                cpu_info: snapshot.cpu_info.model_summaries.clone(),
                load_avg: host.load_avg,
                ram_total: snapshot.virtual_memory_info.total,
                ram_used: snapshot.virtual_memory_info.used,
                swap_total: snapshot.swap_memory_info.total,
                swap_used: snapshot.swap_memory_info.used,
                disk_total: snapshot.disk_info.total,
                disk_used: snapshot.disk_info.used,
                disk_partitions: snapshot.disk_info.partitions.clone(),
                net_in_transfer: snapshot.network_info.in_transfer,
                net_out_transfer: snapshot.network_info.out_transfer,
                os: host.os.clone(),
                platform: host.platform.clone(),
                platform_version: host.platform_version.clone(),
                virtualization_system: host.virtualization_system.clone(),
                kernel_version: host.kernel_version.clone(),
                kernel_arch: host.kernel_arch.clone(),
            },
            is_online: now - snapshot.last_report_time <= max_report_gap_secs,
        }
    }
}
