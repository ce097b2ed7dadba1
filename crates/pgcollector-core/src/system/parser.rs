//! Parsers for `/proc`, `/sys` and `/etc` files.
//!
//! Pure functions over file contents, tested with string fixtures.

use std::path::{Path, PathBuf};

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Memory counters from `/proc/meminfo`, in kB. Missing lines read as 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub dirty: u64,
    pub writeback: u64,
}

pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        let Some((key, _)) = line.split_once(':') else {
            continue;
        };
        let slot = match key {
            "MemTotal" => &mut info.mem_total,
            "MemFree" => &mut info.mem_free,
            "Buffers" => &mut info.buffers,
            "Cached" => &mut info.cached,
            "SwapTotal" => &mut info.swap_total,
            "SwapFree" => &mut info.swap_free,
            "Dirty" => &mut info.dirty,
            "Writeback" => &mut info.writeback,
            _ => continue,
        };
        *slot = parse_kb(line);
    }

    if info.mem_total == 0 {
        return Err(ParseError::new("meminfo without MemTotal"));
    }
    Ok(info)
}

/// Aggregate CPU times from the `cpu ` line of `/proc/stat`, in ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

/// System-wide counters from `/proc/stat`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStat {
    pub cpu: Option<CpuTimes>,
    pub intr: Option<u64>,
    pub ctxt: Option<u64>,
    pub processes: Option<u64>,
    pub procs_running: Option<u64>,
    pub procs_blocked: Option<u64>,
}

pub fn parse_global_stat(content: &str) -> Result<GlobalStat, ParseError> {
    let mut stat = GlobalStat::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        let first = |name: &str| -> Result<Option<u64>, ParseError> {
            parts
                .get(1)
                .map(|s| s.parse().map_err(|_| ParseError::new(format!("invalid {}", name))))
                .transpose()
        };

        match parts[0] {
            "cpu" => {
                let get_val =
                    |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };
                stat.cpu = Some(CpuTimes {
                    user: get_val(1),
                    nice: get_val(2),
                    system: get_val(3),
                    idle: get_val(4),
                    iowait: get_val(5),
                    irq: get_val(6),
                    softirq: get_val(7),
                    steal: get_val(8),
                    guest: get_val(9),
                    guest_nice: get_val(10),
                });
            }
            "intr" => stat.intr = first("intr")?,
            "ctxt" => stat.ctxt = first("ctxt")?,
            "processes" => stat.processes = first("processes")?,
            "procs_running" => stat.procs_running = first("procs_running")?,
            "procs_blocked" => stat.procs_blocked = first("procs_blocked")?,
            _ => {}
        }
    }

    Ok(stat)
}

/// Load averages from `/proc/loadavg`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadAvg {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

pub fn parse_loadavg(content: &str) -> Result<LoadAvg, ParseError> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ParseError::new("invalid loadavg format"));
    }

    let load = |idx: usize, name: &str| -> Result<f64, ParseError> {
        parts[idx]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };

    Ok(LoadAvg {
        load1: load(0, "load1")?,
        load5: load(1, "load5")?,
        load15: load(2, "load15")?,
    })
}

/// Processor summary from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuHardware {
    pub model: Option<String>,
    pub cache_size: Option<String>,
    pub speed_mhz: Option<f64>,
    pub sockets: u32,
    pub cores_per_socket: u32,
}

/// Summarizes `/proc/cpuinfo`.
///
/// Sockets are the highest `physical id` plus one, or 1. Cores per socket
/// come from `cpu cores`, falling back to the highest `processor` plus one,
/// then to 1. The first stanza supplies model, cache size and speed.
pub fn parse_cpuinfo(content: &str) -> CpuHardware {
    let mut model = None;
    let mut cache_size = None;
    let mut speed_mhz = None;
    let mut cpu_cores = None;
    let mut max_physical_id: Option<u32> = None;
    let mut max_processor: Option<u32> = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // Values are whitespace-normalized, keys are tab padded.
        let key = key.trim();
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");

        match key {
            "model name" if model.is_none() => model = Some(value),
            "cache size" if cache_size.is_none() => cache_size = Some(value),
            "cpu MHz" if speed_mhz.is_none() => {
                speed_mhz = value
                    .parse::<f64>()
                    .ok()
                    .map(|mhz| (mhz * 100.0).round() / 100.0);
            }
            "cpu cores" if cpu_cores.is_none() => cpu_cores = value.parse().ok(),
            "physical id" => {
                if let Ok(id) = value.parse::<u32>() {
                    max_physical_id = Some(max_physical_id.map_or(id, |m| m.max(id)));
                }
            }
            "processor" => {
                if let Ok(id) = value.parse::<u32>() {
                    max_processor = Some(max_processor.map_or(id, |m| m.max(id)));
                }
            }
            _ => {}
        }
    }

    CpuHardware {
        model,
        cache_size,
        speed_mhz,
        sockets: max_physical_id.map_or(1, |id| id + 1),
        cores_per_socket: cpu_cores
            .or_else(|| max_processor.map(|id| id + 1))
            .unwrap_or(1),
    }
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub major: u32,
    pub minor: u32,
    pub mount_point: PathBuf,
}

/// Parses `/proc/self/mountinfo`. Malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    let mut mounts = Vec::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();

        // mount_id, parent_id
        let _ = parts.next();
        let _ = parts.next();

        let Some(dev) = parts.next() else {
            continue;
        };
        let Some((major_s, minor_s)) = dev.split_once(':') else {
            continue;
        };
        let (Ok(major), Ok(minor)) = (major_s.parse::<u32>(), minor_s.parse::<u32>()) else {
            continue;
        };

        // root within the filesystem, then the mount point
        let _ = parts.next();
        let Some(mount_point) = parts.next() else {
            continue;
        };

        mounts.push(MountEntry {
            major,
            minor,
            mount_point: PathBuf::from(unescape_mount_path(mount_point)),
        });
    }

    mounts
}

/// Decodes the octal escapes (`\040` for space) the kernel uses in mount paths.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 8).ok());
            if let Some(b) = octal {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The mount containing `path`: the entry with the longest matching mount
/// point. Later entries win ties, as they shadow earlier mounts.
pub fn find_mount<'a>(mounts: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    let mut best: Option<&MountEntry> = None;
    for mount in mounts {
        if !path.starts_with(&mount.mount_point) {
            continue;
        }
        let longer = best.is_none_or(|b| {
            mount.mount_point.components().count() >= b.mount_point.components().count()
        });
        if longer {
            best = Some(mount);
        }
    }
    best
}

/// Block device counters from `/sys/dev/block/<maj>:<min>/stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStat {
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

pub fn parse_block_stat(content: &str) -> Result<BlockStat, ParseError> {
    let fields = content
        .split_whitespace()
        .map(|s| s.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ParseError::new("invalid block device stat"))?;

    if fields.len() < 11 {
        return Err(ParseError::new(format!(
            "not enough fields in block device stat: expected 11+, got {}",
            fields.len()
        )));
    }

    Ok(BlockStat {
        rd_ios: fields[0],
        rd_merges: fields[1],
        rd_sectors: fields[2],
        rd_ticks: fields[3],
        wr_ios: fields[4],
        wr_merges: fields[5],
        wr_sectors: fields[6],
        wr_ticks: fields[7],
        ios_in_prog: fields[8],
        tot_ticks: fields[9],
        rq_ticks: fields[10],
    })
}

/// Distribution name and version from `/etc/os-release`.
pub fn parse_os_release(content: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut version = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "NAME" => name = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }

    (name, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let content = "\
MemTotal:       16384000 kB
MemFree:         2048000 kB
MemAvailable:    8192000 kB
Buffers:          512000 kB
Cached:          4096000 kB
SwapCached:        10000 kB
SwapTotal:       1024000 kB
SwapFree:        1000000 kB
Dirty:              1200 kB
Writeback:             0 kB
";
        let info = parse_meminfo(content).unwrap();
        assert_eq!(info.mem_total, 16384000);
        assert_eq!(info.mem_free, 2048000);
        assert_eq!(info.buffers, 512000);
        assert_eq!(info.cached, 4096000);
        assert_eq!(info.swap_free, 1000000);
        assert_eq!(info.dirty, 1200);
    }

    #[test]
    fn test_parse_meminfo_missing_fields() {
        // openvz style: no buffers, no swap
        let info = parse_meminfo("MemTotal: 1000 kB\nMemFree: 400 kB\nCached: 100 kB\n").unwrap();
        assert_eq!(info.buffers, 0);
        assert_eq!(info.swap_total, 0);
        assert!(parse_meminfo("").is_err());
    }

    #[test]
    fn test_parse_global_stat() {
        let content = "\
cpu  100 5 50 1000 20 1 2 3 0 0
cpu0 50 2 25 500 10 0 1 1 0 0
intr 123456 1 2 3
ctxt 98765
btime 1700000000
processes 4321
procs_running 3
procs_blocked 1
";
        let stat = parse_global_stat(content).unwrap();
        let cpu = stat.cpu.unwrap();
        assert_eq!(cpu.user, 100);
        assert_eq!(cpu.idle, 1000);
        assert_eq!(cpu.steal, 3);
        assert_eq!(stat.intr, Some(123456));
        assert_eq!(stat.ctxt, Some(98765));
        assert_eq!(stat.processes, Some(4321));
        assert_eq!(stat.procs_running, Some(3));
        assert_eq!(stat.procs_blocked, Some(1));
    }

    #[test]
    fn test_parse_loadavg() {
        let avg = parse_loadavg("0.52 0.58 0.59 2/1234 56789\n").unwrap();
        assert_eq!(avg.load1, 0.52);
        assert_eq!(avg.load15, 0.59);
        assert!(parse_loadavg("0.1").is_err());
    }

    #[test]
    fn test_parse_cpuinfo_two_sockets() {
        let content = "\
processor\t: 0
model name\t: Intel(R) Xeon(R)   CPU E5-2670 0 @ 2.60GHz
cpu MHz\t\t: 2600.1234
cache size\t: 20480 KB
physical id\t: 0
cpu cores\t: 8

processor\t: 1
model name\t: Intel(R) Xeon(R)   CPU E5-2670 0 @ 2.60GHz
cpu MHz\t\t: 2600.000
cache size\t: 20480 KB
physical id\t: 1
cpu cores\t: 8
";
        let hw = parse_cpuinfo(content);
        assert_eq!(
            hw.model.as_deref(),
            Some("Intel(R) Xeon(R) CPU E5-2670 0 @ 2.60GHz")
        );
        assert_eq!(hw.cache_size.as_deref(), Some("20480 KB"));
        assert_eq!(hw.speed_mhz, Some(2600.12));
        assert_eq!(hw.sockets, 2);
        assert_eq!(hw.cores_per_socket, 8);
    }

    #[test]
    fn test_parse_cpuinfo_fallbacks() {
        let hw = parse_cpuinfo("processor\t: 0\n\nprocessor\t: 1\n\nprocessor\t: 2\n");
        assert_eq!(hw.sockets, 1);
        assert_eq!(hw.cores_per_socket, 3);
        assert_eq!(hw.model, None);

        let hw = parse_cpuinfo("");
        assert_eq!(hw.cores_per_socket, 1);
    }

    #[test]
    fn test_parse_mountinfo_and_find_mount() {
        let content = "\
22 1 259:2 / / rw,relatime shared:1 - ext4 /dev/nvme0n1p2 rw
30 22 0:26 / /proc rw,nosuid shared:5 - proc proc rw
41 22 259:3 / /var/lib/postgresql rw,relatime shared:30 - xfs /dev/nvme0n1p3 rw
42 22 8:17 / /mnt/my\\040disk rw - ext4 /dev/sdb1 rw
bogus line
";
        let mounts = parse_mountinfo(content);
        assert_eq!(mounts.len(), 4);
        assert_eq!(mounts[3].mount_point, PathBuf::from("/mnt/my disk"));

        let data = find_mount(&mounts, Path::new("/var/lib/postgresql/16/main")).unwrap();
        assert_eq!((data.major, data.minor), (259, 3));
        assert_eq!(data.mount_point, PathBuf::from("/var/lib/postgresql"));

        // path component match, not string prefix
        let other = find_mount(&mounts, Path::new("/var/lib/postgresql-old")).unwrap();
        assert_eq!(other.mount_point, PathBuf::from("/"));
    }

    #[test]
    fn test_parse_block_stat() {
        let content = "    8042     1297   452366     3260    12000     4000   800000    20000        0    15000    23260\n";
        let stat = parse_block_stat(content).unwrap();
        assert_eq!(stat.rd_ios, 8042);
        assert_eq!(stat.wr_sectors, 800000);
        assert_eq!(stat.rq_ticks, 23260);
        assert!(parse_block_stat("1 2 3").is_err());
    }

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\n";
        assert_eq!(
            parse_os_release(content),
            (Some("Ubuntu".to_string()), Some("22.04".to_string()))
        );
    }
}
