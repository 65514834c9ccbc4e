//! PID 1 duties: early mounts, overlay setup, address discovery, and teardown.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::mount::{MntFlags, MsFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::Result;
use crate::kmsg;

/// Writable scratch space mounted at `Init`.
pub const OVERLAY_DIR: &str = "/run/overlay";

/// Filesystems left mounted during teardown.
const VIRTUAL_FS_TYPES: [&str; 10] = [
    "proc", "sysfs", "devtmpfs", "devpts", "cgroup", "cgroup2", "securityfs", "debugfs",
    "tracefs", "mqueue",
];

/// One line of /proc/mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
}

pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: fields.next()?.to_string(),
                target: unescape_mount_path(fields.next()?),
                fs_type: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// /proc/mounts escapes whitespace as octal (`\040`).
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(code) = octal.and_then(|o| u8::from_str_radix(o, 8).ok()) {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn mount_pseudo(fs: &str, target: &str, flags: MsFlags, data: Option<&str>) {
    let _ = std::fs::create_dir_all(target);
    if let Err(e) = nix::mount::mount(Some(fs), target, Some(fs), flags, data) {
        // Already mounted by the kernel or an initramfs.
        if e != nix::errno::Errno::EBUSY {
            kmsg(&format!("mount {} on {} failed: {}", fs, target, e));
        }
    }
}

/// Mount the pseudo-filesystems a bare kernel leaves to init.
pub fn init_system() {
    // As PID 1 we inherit no environment.
    std::env::set_var("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
    std::env::set_var("HOME", "/root");

    kmsg("running as init, setting up system...");

    let nosuid = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount_pseudo("proc", "/proc", nosuid, None);
    mount_pseudo("sysfs", "/sys", nosuid, None);
    mount_pseudo("devtmpfs", "/dev", MsFlags::MS_NOSUID, Some("mode=0755"));
    mount_pseudo(
        "devpts",
        "/dev/pts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("gid=5,mode=620,ptmxmode=666"),
    );
    mount_pseudo("tmpfs", "/dev/shm", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=1777"));
    mount_pseudo("tmpfs", "/run", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=0755"));
    mount_pseudo("tmpfs", "/tmp", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=1777"));
    mount_pseudo("cgroup2", "/sys/fs/cgroup", nosuid, None);

    let _ = std::fs::write("/proc/sys/kernel/hostname", "burrow\n");

    // Loopback is needed by most runtimes even before the primary NIC is up.
    let lo_up = burrow_protocol::Command::new("ip").args(["link", "set", "lo", "up"]);
    if let Err(e) = crate::process::run(&lo_up) {
        kmsg(&format!("note: could not bring up lo: {}", e));
    }

    kmsg("system initialization complete");
}

/// Mount the writable overlay tmpfs. `size_mb == 0` keeps the kernel default.
pub fn configure_overlay(size_mb: u64) -> Result<()> {
    let data = if size_mb > 0 {
        format!("size={}m,mode=0755", size_mb)
    } else {
        "mode=0755".to_string()
    };
    std::fs::create_dir_all(OVERLAY_DIR)?;
    nix::mount::mount(
        Some("tmpfs"),
        OVERLAY_DIR,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(data.as_str()),
    )?;
    Ok(())
}

/// First non-loopback IPv4 address, waiting up to `timeout` for DHCP.
pub fn primary_ipv4(timeout: Duration) -> Option<Ipv4Addr> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(addr) = find_ipv4() {
            return Some(addr);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn find_ipv4() -> Option<Ipv4Addr> {
    nix::ifaddrs::getifaddrs()
        .ok()?
        .filter_map(|ifa| {
            let storage = ifa.address?;
            let sin = storage.as_sockaddr_in()?;
            Some(Ipv4Addr::from(sin.ip()))
        })
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified())
}

/// Stop every process, flush and detach real filesystems.
///
/// The caller powers the machine off afterwards.
pub fn teardown(grace: Duration) {
    kmsg("shutdown: terminating processes");
    let all = Pid::from_raw(-1);
    let _ = kill(all, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        // ESRCH once nothing but init is left.
        if kill(all, None::<Signal>).is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = kill(all, Signal::SIGKILL);

    nix::unistd::sync();

    let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
    for entry in parse_mounts(&mounts).iter().rev() {
        if VIRTUAL_FS_TYPES.contains(&entry.fs_type.as_str()) || entry.target == "/" {
            continue;
        }
        if let Err(e) = nix::mount::umount2(Path::new(&entry.target), MntFlags::MNT_DETACH) {
            kmsg(&format!("umount {} failed: {}", entry.target, e));
        }
    }
    nix::unistd::sync();
}

pub fn power_off() {
    kmsg("powering off");
    let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounts_table_parsed() {
        let content = "proc /proc proc rw,nosuid 0 0\n\
                       /dev/vdb /var/lib/containerd ext4 rw,relatime 0 0\n\
                       share /Users/me\\040dir virtiofs rw 0 0\n";
        let mounts = parse_mounts(content);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].source, "/dev/vdb");
        assert_eq!(mounts[1].fs_type, "ext4");
        assert_eq!(mounts[2].target, "/Users/me dir");
    }

    #[test]
    fn short_lines_skipped() {
        assert!(parse_mounts("only two\n\n").is_empty());
    }
}
