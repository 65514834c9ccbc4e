//! Guest metrics from procfs and statvfs.

use std::path::Path;

use burrow_protocol::{metric_names, DiskUsage, MemoryStats, Metrics, SwapStats};

use crate::system::{parse_mounts, MountEntry};

/// Filesystems reported under `disks`.
const DISK_FS_TYPES: [&str; 6] = ["ext4", "xfs", "btrfs", "virtiofs", "tmpfs", "overlay"];

/// Collect the requested metric groups (all when `names` is empty).
pub fn collect(proc_root: &Path, names: &[String]) -> Metrics {
    let wanted = |name: &str| names.is_empty() || names.iter().any(|n| n == name);
    let read = |file: &str| std::fs::read_to_string(proc_root.join(file)).ok();

    let mut metrics = Metrics::default();
    if wanted(metric_names::UPTIME) {
        metrics.uptime_secs = read("uptime").and_then(|c| parse_uptime(&c));
    }
    if wanted(metric_names::LOAD) {
        metrics.load = read("loadavg").and_then(|c| parse_loadavg(&c));
    }
    if wanted(metric_names::MEMORY) || wanted(metric_names::SWAP) {
        let meminfo = read("meminfo").unwrap_or_default();
        let (memory, swap) = parse_meminfo(&meminfo);
        if wanted(metric_names::MEMORY) {
            metrics.memory = Some(memory);
        }
        if wanted(metric_names::SWAP) {
            metrics.swap = Some(swap);
        }
    }
    if wanted(metric_names::PROCESSES) {
        metrics.processes = Some(count_processes(proc_root));
    }
    if wanted(metric_names::DISKS) {
        let mounts = read("mounts").unwrap_or_default();
        metrics.disks = Some(disk_usage(&parse_mounts(&mounts)));
    }
    metrics
}

fn parse_uptime(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut fields = content.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

/// Parse a /proc/meminfo value like "    12345 kB" into bytes.
fn parse_meminfo_kb(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        * 1024
}

fn parse_meminfo(content: &str) -> (MemoryStats, SwapStats) {
    let mut memory = MemoryStats::default();
    let mut swap = SwapStats::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let bytes = parse_meminfo_kb(value);
        match key {
            "MemTotal" => memory.total_bytes = bytes,
            "MemFree" => memory.free_bytes = bytes,
            "MemAvailable" => memory.available_bytes = bytes,
            "SwapTotal" => swap.total_bytes = bytes,
            "SwapFree" => swap.free_bytes = bytes,
            _ => {}
        }
    }
    (memory, swap)
}

fn count_processes(proc_root: &Path) -> u32 {
    std::fs::read_dir(proc_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
                })
                .count() as u32
        })
        .unwrap_or(0)
}

fn disk_usage(mounts: &[MountEntry]) -> Vec<DiskUsage> {
    mounts
        .iter()
        .filter(|m| DISK_FS_TYPES.contains(&m.fs_type.as_str()))
        .filter_map(|m| {
            let stat = nix::sys::statvfs::statvfs(m.target.as_str()).ok()?;
            let frsize = stat.fragment_size() as u64;
            Some(DiskUsage {
                mountpoint: m.target.clone(),
                fs_type: m.fs_type.clone(),
                total_bytes: stat.blocks() as u64 * frsize,
                free_bytes: stat.blocks_free() as u64 * frsize,
                available_bytes: stat.blocks_available() as u64 * frsize,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:        2027520 kB\n\
                           MemFree:          512000 kB\n\
                           MemAvailable:    1024000 kB\n\
                           Buffers:           10000 kB\n\
                           SwapTotal:        100000 kB\n\
                           SwapFree:          40000 kB\n";

    #[test]
    fn meminfo_parsed_to_bytes() {
        let (memory, swap) = parse_meminfo(MEMINFO);
        assert_eq!(memory.total_bytes, 2027520 * 1024);
        assert_eq!(memory.available_bytes, 1024000 * 1024);
        assert_eq!(swap.free_bytes, 40000 * 1024);
    }

    #[test]
    fn loadavg_parsed() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/389 12345\n"),
            Some([0.52, 0.58, 0.59])
        );
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn uptime_parsed() {
        assert_eq!(parse_uptime("350735.47 234388.90\n"), Some(350735.47));
    }

    #[test]
    fn collect_from_fake_procfs_respects_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uptime"), "12.5 3.0\n").unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::create_dir(dir.path().join("1")).unwrap();
        std::fs::create_dir(dir.path().join("42")).unwrap();
        std::fs::create_dir(dir.path().join("self")).unwrap();

        let metrics = collect(
            dir.path(),
            &["uptime".to_string(), "processes".to_string()],
        );
        assert_eq!(metrics.uptime_secs, Some(12.5));
        assert_eq!(metrics.processes, Some(2));
        assert!(metrics.memory.is_none());
        assert!(metrics.disks.is_none());

        let all = collect(dir.path(), &[]);
        assert_eq!(all.swap.map(|s| s.total_bytes), Some(100000 * 1024));
        assert_eq!(all.disks, Some(Vec::new()));
    }
}
