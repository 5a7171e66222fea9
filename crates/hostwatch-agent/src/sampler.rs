//! Host metric sampling.
//!
//! [`MetricsSampler`] is the seam between the reporting loop and the OS.
//! [`SysinfoSampler`] is the production implementation; tests substitute
//! their own.

use std::collections::BTreeMap;

use hostwatch_core::Snapshot;
use hostwatch_core::snapshot::{
    CpuInfo, DiskInfo, HostInfo, LoadAvg, MemoryInfo, Partition, SwapInfo,
};
use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;

/// Sampling failures.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The OS did not provide the requested data.
    #[error("metrics unavailable: {0}")]
    Unavailable(String),
    /// The blocking sampling task failed.
    #[error("sampling task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Inputs to the adaptive interval controller.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadSample {
    /// Overall CPU usage, percent.
    pub cpu_percent: f64,
    /// Physical memory usage, percent.
    pub mem_percent: f64,
}

/// Source of host metrics.
///
/// Implementations may block briefly; callers on the runtime should use
/// `spawn_blocking`.
pub trait MetricsSampler: Send + Sync {
    /// Full metric bundle. Network throughput, identity, and location are
    /// filled in by the caller.
    fn sample(&self) -> Result<Snapshot, SampleError>;

    /// CPU and memory load only.
    fn load(&self) -> Result<LoadSample, SampleError>;
}

/// Filesystems counted toward disk usage.
const DISK_FS_TYPES: [&str; 16] = [
    "apfs", "ext4", "ext3", "ext2", "f2fs", "reiserfs", "jfs", "btrfs", "fuseblk", "zfs",
    "simfs", "ntfs", "fat32", "exfat", "xfs", "fuse.rclone",
];

/// Mount points under this prefix are kubelet volumes and skipped.
const KUBELET_MOUNTS: &str = "/var/lib/kubelet";

struct Inner {
    sys: System,
    disks: Disks,
}

/// [`MetricsSampler`] backed by `sysinfo`.
///
/// Holds one `System` across calls so CPU usage is measured between
/// consecutive refreshes.
pub struct SysinfoSampler {
    inner: Mutex<Inner>,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    /// Create a sampler and take the baseline refresh.
    pub fn new() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let disks = Disks::new_with_refreshed_list();
        Self {
            inner: Mutex::new(Inner { sys, disks }),
        }
    }
}

impl MetricsSampler for SysinfoSampler {
    fn sample(&self) -> Result<Snapshot, SampleError> {
        let mut inner = self.inner.lock();
        let Inner { sys, disks } = &mut *inner;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        disks.refresh();
        if disks.list().is_empty() {
            disks.refresh_list();
        }

        if sys.cpus().is_empty() {
            return Err(SampleError::Unavailable("no cpus reported".into()));
        }

        let cpu_info = CpuInfo {
            percent: f64::from(sys.global_cpu_usage()),
            model_summaries: model_summaries(sys.cpus().iter().map(sysinfo::Cpu::brand)),
        };

        let (total, used) = (sys.total_memory(), sys.used_memory());
        let virtual_memory_info = MemoryInfo {
            total,
            used,
            used_percent: percent(used, total),
        };

        let (swap_total, swap_used) = (sys.total_swap(), sys.used_swap());
        let swap_memory_info = SwapInfo {
            total: swap_total,
            used: swap_used,
            free: sys.free_swap(),
            used_percent: percent(swap_used, swap_total),
        };

        let partitions = disks
            .list()
            .iter()
            .filter_map(|d| {
                let fstype = d.file_system().to_string_lossy().into_owned();
                let mount_point = d.mount_point().to_string_lossy().into_owned();
                counted_partition(&fstype, &mount_point).then(|| {
                    let total = d.total_space();
                    let free = d.available_space();
                    let used = total.saturating_sub(free);
                    Partition {
                        mount_point,
                        fstype,
                        total,
                        free,
                        used,
                        used_percent: percent(used, total),
                    }
                })
            })
            .collect();

        Ok(Snapshot {
            host_info: host_info(),
            cpu_info,
            virtual_memory_info,
            swap_memory_info,
            disk_info: disk_info(partitions),
            ..Snapshot::default()
        })
    }

    fn load(&self) -> Result<LoadSample, SampleError> {
        let mut inner = self.inner.lock();
        inner.sys.refresh_cpu_usage();
        inner.sys.refresh_memory();
        let sys = &inner.sys;
        Ok(LoadSample {
            cpu_percent: f64::from(sys.global_cpu_usage()),
            mem_percent: percent(sys.used_memory(), sys.total_memory()),
        })
    }
}

fn host_info() -> HostInfo {
    let load = System::load_average();
    let os = std::env::consts::OS.to_string();
    let (platform, platform_version) = if cfg!(windows) {
        (System::long_os_version().unwrap_or_default(), System::os_version().unwrap_or_default())
    } else {
        (System::distribution_id(), System::os_version().unwrap_or_default())
    };
    HostInfo {
        os,
        platform,
        platform_version,
        kernel_arch: std::env::consts::ARCH.to_string(),
        kernel_version: System::kernel_version().unwrap_or_default(),
        uptime: System::uptime(),
        boot_time: System::boot_time(),
        virtualization_system: String::new(),
        load_avg: LoadAvg {
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
        },
    }
}

/// Whether a partition counts toward disk usage.
pub(crate) fn counted_partition(fstype: &str, mount_point: &str) -> bool {
    DISK_FS_TYPES.contains(&fstype.to_lowercase().as_str()) && !mount_point.contains(KUBELET_MOUNTS)
}

pub(crate) fn disk_info(partitions: Vec<Partition>) -> DiskInfo {
    let total = partitions.iter().map(|p| p.total).sum();
    let used = partitions.iter().map(|p| p.used).sum();
    DiskInfo {
        total,
        used,
        used_percent: percent(used, total),
        partitions,
    }
}

/// One `"<model> x <count>"` line per distinct CPU model, in model order.
pub(crate) fn model_summaries<'a>(brands: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for brand in brands {
        *counts.entry(brand.trim()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(model, count)| format!("{model} x {count}"))
        .collect()
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert!((percent(5, 0)).abs() < f64::EPSILON);
        assert!((percent(25, 100) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn model_summaries_group_by_brand() {
        let brands = ["AMD EPYC", "AMD EPYC", "Intel Xeon ", "AMD EPYC"];
        assert_eq!(
            model_summaries(brands.into_iter()),
            vec!["AMD EPYC x 3", "Intel Xeon x 1"]
        );
    }

    #[test]
    fn partition_filter() {
        assert!(counted_partition("ext4", "/"));
        assert!(counted_partition("NTFS", "C:\\"));
        assert!(!counted_partition("tmpfs", "/run"));
        assert!(!counted_partition("overlay", "/var/lib/docker"));
        assert!(!counted_partition("ext4", "/var/lib/kubelet/pods/x"));
    }

    #[test]
    fn disk_totals_sum_partitions() {
        let part = |total, used| Partition {
            mount_point: "/".into(),
            fstype: "ext4".into(),
            total,
            free: total - used,
            used,
            used_percent: percent(used, total),
        };
        let info = disk_info(vec![part(100, 20), part(300, 80)]);
        assert_eq!(info.total, 400);
        assert_eq!(info.used, 100);
        assert!((info.used_percent - 25.0).abs() < f64::EPSILON);
        assert!(disk_info(Vec::new()).used_percent.abs() < f64::EPSILON);
    }

    #[test]
    fn sysinfo_sample_is_finite() {
        let sampler = SysinfoSampler::new();
        let load = sampler.load().unwrap();
        assert!(load.cpu_percent.is_finite());
        assert!((0.0..=100.0).contains(&load.mem_percent));

        if let Ok(snap) = sampler.sample() {
            assert!(!snap.host_info.os.is_empty());
            assert!(!snap.cpu_info.model_summaries.is_empty());
            assert!(snap.disk_info.used_percent.is_finite());
        }
    }
}
