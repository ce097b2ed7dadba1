//! Operating system metrics for the host running the database.
//!
//! Everything but `os` is read from Linux `/proc` and `/sys`. Each part
//! (`os`, `cpu`, `scheduler`, `memory`, `storage`) is collected on its own;
//! a part whose files are missing or unreadable is left out of the document
//! instead of failing the run.

mod fs;
mod parser;

pub use fs::{FileSystem, FsUsage, MockFs, RealFs};
pub use parser::ParseError;

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use parser::{
    find_mount, parse_block_stat, parse_cpuinfo, parse_global_stat, parse_loadavg,
    parse_meminfo, parse_mountinfo, parse_os_release,
};

/// Clock ticks per second used by `/proc/stat` on Linux.
const USER_HZ: u64 = 100;

/// Name under which the data directory is reported in `storage`.
const DATA_DIRECTORY_NAME: &str = "PGDATA directory";

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("{0} not found")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OsInfo {
    pub system: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuBusyTimes {
    pub user_msec: u64,
    pub nice_msec: u64,
    pub system_msec: u64,
    pub idle_msec: u64,
    pub iowait_msec: u64,
    pub irq_msec: u64,
    pub softirq_msec: u64,
    pub steal_msec: u64,
    pub guest_msec: u64,
    pub guest_nice_msec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuHardwareInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mhz: Option<f64>,
    pub sockets: u32,
    pub cores_per_socket: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    pub busy_times: CpuBusyTimes,
    pub hardware: CpuHardwareInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerInfo {
    pub interrupts: u64,
    pub context_switches: u64,
    pub procs_running: u64,
    pub procs_blocked: u64,
    pub procs_created: u64,
    pub loadavg_1min: f64,
    pub loadavg_5min: f64,
    pub loadavg_15min: f64,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub buffers_bytes: u64,
    pub pagecache_bytes: u64,
    pub free_bytes: u64,
    pub applications_bytes: u64,
    pub dirty_bytes: u64,
    pub writeback_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoragePerfdata {
    pub rd_ios: u64,
    pub rd_merges: u64,
    pub rd_sectors: u64,
    pub rd_ticks: u64,
    pub wr_ios: u64,
    pub wr_merges: u64,
    pub wr_sectors: u64,
    pub wr_ticks: u64,
    pub ios_in_prog: u64,
    pub tot_ticks: u64,
    pub rq_ticks: u64,
}

/// One storage location used by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageInfo {
    pub name: String,
    pub path: String,
    pub mountpoint: String,
    pub bytes_total: u64,
    pub bytes_available: u64,
    /// Absent for devices without a sysfs `stat` file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perfdata: Option<StoragePerfdata>,
    /// Vendor and model. Absent for metadevices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
}

/// The `system` document of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Vec<StorageInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInfo>,
}

/// Reads OS metrics through a [`FileSystem`].
pub struct SystemCollector<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    sys_path: PathBuf,
    etc_path: PathBuf,
}

impl SystemCollector<RealFs> {
    /// Collector over the live system.
    pub fn real() -> Self {
        Self::new(RealFs::new())
    }
}

impl<F: FileSystem> SystemCollector<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            proc_path: PathBuf::from("/proc"),
            sys_path: PathBuf::from("/sys"),
            etc_path: PathBuf::from("/etc"),
        }
    }

    /// Collects every part that applies to this host.
    ///
    /// `data_directory` is the server's data directory as reported by the
    /// server; without it `storage` is left out.
    pub fn collect(&self, data_directory: Option<&str>) -> SystemInfo {
        SystemInfo {
            os: keep("os", self.os()),
            cpu: keep("cpu", self.cpu()),
            scheduler: keep("scheduler", self.scheduler()),
            storage: data_directory
                .and_then(|dir| keep("storage", self.storage(Path::new(dir))))
                .map(|s| vec![s]),
            memory: keep("memory", self.memory()),
        }
    }

    pub fn os(&self) -> Result<OsInfo, SystemError> {
        let kernel_version = self
            .read(&self.proc_path.join("sys/kernel/osrelease"))
            .ok()
            .map(|s| s.trim().to_string());

        let (distribution, distribution_version) = self
            .read(&self.etc_path.join("os-release"))
            .map(|c| parse_os_release(&c))
            .unwrap_or_default();

        let dmi = self.sys_path.join("devices/virtual/dmi/id");
        let vendor = self.read_line(&dmi.join("sys_vendor"));
        let product = self.read_line(&dmi.join("product_name"));
        let server_model = match (vendor, product) {
            (Some(v), Some(p)) => Some(format!("{} {}", v, p)),
            _ => None,
        };

        Ok(OsInfo {
            system: system_name(),
            architecture: std::env::consts::ARCH.to_string(),
            kernel_version,
            distribution,
            distribution_version,
            server_model,
        })
    }

    pub fn cpu(&self) -> Result<CpuInfo, SystemError> {
        let stat_path = self.proc_path.join("stat");
        let stat = self.parse(&stat_path, parse_global_stat)?;
        let times = stat.cpu.ok_or(SystemError::Missing("aggregate cpu line"))?;

        let msec = |ticks: u64| ticks * (1000 / USER_HZ);
        let busy_times = CpuBusyTimes {
            user_msec: msec(times.user),
            nice_msec: msec(times.nice),
            system_msec: msec(times.system),
            idle_msec: msec(times.idle),
            iowait_msec: msec(times.iowait),
            irq_msec: msec(times.irq),
            softirq_msec: msec(times.softirq),
            steal_msec: msec(times.steal),
            guest_msec: msec(times.guest),
            guest_nice_msec: msec(times.guest_nice),
        };

        let hw = parse_cpuinfo(&self.read(&self.proc_path.join("cpuinfo"))?);
        Ok(CpuInfo {
            busy_times,
            hardware: CpuHardwareInfo {
                model: hw.model,
                cache_size: hw.cache_size,
                speed_mhz: hw.speed_mhz,
                sockets: hw.sockets,
                cores_per_socket: hw.cores_per_socket,
            },
        })
    }

    pub fn scheduler(&self) -> Result<SchedulerInfo, SystemError> {
        let stat = self.parse(&self.proc_path.join("stat"), parse_global_stat)?;
        let load = self.parse(&self.proc_path.join("loadavg"), parse_loadavg)?;

        Ok(SchedulerInfo {
            interrupts: stat.intr.ok_or(SystemError::Missing("intr"))?,
            context_switches: stat.ctxt.ok_or(SystemError::Missing("ctxt"))?,
            procs_running: stat.procs_running.ok_or(SystemError::Missing("procs_running"))?,
            procs_blocked: stat.procs_blocked.ok_or(SystemError::Missing("procs_blocked"))?,
            procs_created: stat.processes.ok_or(SystemError::Missing("processes"))?,
            loadavg_1min: load.load1,
            loadavg_5min: load.load5,
            loadavg_15min: load.load15,
        })
    }

    pub fn memory(&self) -> Result<MemoryInfo, SystemError> {
        let info = self.parse(&self.proc_path.join("meminfo"), parse_meminfo)?;
        let bytes = |kb: u64| kb * 1024;

        Ok(MemoryInfo {
            total_bytes: bytes(info.mem_total),
            buffers_bytes: bytes(info.buffers),
            pagecache_bytes: bytes(info.cached),
            free_bytes: bytes(info.mem_free),
            applications_bytes: bytes(
                info.mem_total
                    .saturating_sub(info.mem_free)
                    .saturating_sub(info.buffers)
                    .saturating_sub(info.cached),
            ),
            dirty_bytes: bytes(info.dirty),
            writeback_bytes: bytes(info.writeback),
            swap_total_bytes: bytes(info.swap_total),
            swap_free_bytes: bytes(info.swap_free),
        })
    }

    /// Capacity and block device counters for the filesystem holding
    /// `data_directory`.
    pub fn storage(&self, data_directory: &Path) -> Result<StorageInfo, SystemError> {
        let mounts = parse_mountinfo(&self.read(&self.proc_path.join("self/mountinfo"))?);
        let mount = find_mount(&mounts, data_directory).ok_or(SystemError::Missing("mount point"))?;

        let usage = self
            .fs
            .usage(data_directory)
            .map_err(|source| SystemError::Io {
                path: data_directory.to_path_buf(),
                source,
            })?;

        let device = self
            .sys_path
            .join(format!("dev/block/{}:{}", mount.major, mount.minor));

        let stat_path = device.join("stat");
        let perfdata = if self.fs.exists(&stat_path) {
            let s = self.parse(&stat_path, parse_block_stat)?;
            Some(StoragePerfdata {
                rd_ios: s.rd_ios,
                rd_merges: s.rd_merges,
                rd_sectors: s.rd_sectors,
                rd_ticks: s.rd_ticks,
                wr_ios: s.wr_ios,
                wr_merges: s.wr_merges,
                wr_sectors: s.wr_sectors,
                wr_ticks: s.wr_ticks,
                ios_in_prog: s.ios_in_prog,
                tot_ticks: s.tot_ticks,
                rq_ticks: s.rq_ticks,
            })
        } else {
            debug!(device = %device.display(), "no block device stat");
            None
        };

        let hardware = match (
            self.read_line(&device.join("device/vendor")),
            self.read_line(&device.join("device/model")),
        ) {
            (Some(vendor), Some(model)) => Some(format!("{} {}", vendor, model)),
            _ => None,
        };

        Ok(StorageInfo {
            name: DATA_DIRECTORY_NAME.to_string(),
            path: data_directory.display().to_string(),
            mountpoint: mount.mount_point.display().to_string(),
            bytes_total: usage.bytes_total,
            bytes_available: usage.bytes_available,
            perfdata,
            hardware,
        })
    }

    fn read(&self, path: &Path) -> Result<String, SystemError> {
        self.fs
            .read_to_string(path)
            .map_err(|source| SystemError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// First line of a sysfs attribute, if present and non-empty.
    fn read_line(&self, path: &Path) -> Option<String> {
        let content = self.fs.read_to_string(path).ok()?;
        let line = content.lines().next()?.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    fn parse<T>(
        &self,
        path: &Path,
        parser: impl Fn(&str) -> Result<T, ParseError>,
    ) -> Result<T, SystemError> {
        parser(&self.read(path)?).map_err(|source| SystemError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn keep<T>(part: &str, result: Result<T, SystemError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(part, error = %e, "skipping system information part");
            None
        }
    }
}

fn system_name() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Darwin".to_string(),
        other => other.to_string(),
    }
}
