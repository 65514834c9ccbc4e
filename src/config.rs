//! Daemon configuration.
//!
//! [`DaemonConfig`] is what an external loader fills in. Only serde defaults
//! are applied here; anything beyond that (path resolution, sanity checks) is
//! the loader's job. Durations are written as humantime strings (`"30s"`).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_protocol::Command;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub vm: VmLayout,
    /// Where `daemon.json` lives. Falls back to [`default_state_dir`].
    pub state_dir: Option<PathBuf>,
    pub forward: ForwardConfig,
    pub idle: IdleConfig,
    pub timeouts: Timeouts,
    pub runtime: RuntimeConfig,
}

impl DaemonConfig {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    /// Read and parse a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }
}

/// `BURROW_STATE_DIR`, then `$HOME/.local/state/burrow`, then `/tmp`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BURROW_STATE_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/burrow");
    }

    PathBuf::from("/tmp/burrow-state")
}

/// CPU architecture of the host or of a guest image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Aarch64,
    X86_64,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else {
            Arch::Aarch64
        }
    }
}

/// Shape of the virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmLayout {
    pub cpus: usize,
    pub memory_mb: u64,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    /// Read-only root filesystem image, attached as the first disk.
    pub root_image: PathBuf,
    /// Extra kernel command line arguments.
    pub cmdline: Vec<String>,
    pub disks: Vec<DiskConfig>,
    pub shares: Vec<ShareConfig>,
    /// Attach the serial console to stderr.
    pub debug: bool,
    pub guest_arch: Arch,
    /// Size of the guest's writable overlay tmpfs. 0 keeps the kernel default.
    pub overlay_size_mb: u64,
    /// Applied by the guest during the init handshake.
    pub sysctls: BTreeMap<String, String>,
}

impl Default for VmLayout {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            kernel: PathBuf::new(),
            initrd: None,
            root_image: PathBuf::new(),
            cmdline: Vec::new(),
            disks: Vec::new(),
            shares: Vec::new(),
            debug: false,
            guest_arch: Arch::host(),
            overlay_size_mb: 0,
            sysctls: BTreeMap::new(),
        }
    }
}

/// A mutable block disk backed by a host image file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub image: PathBuf,
    pub mountpoint: String,
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
    /// Used to label the filesystem when it is first created.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub size: DiskSize,
}

fn default_fs_type() -> String {
    "ext4".into()
}

/// How big a missing disk image is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskSize {
    /// Exact size in bytes.
    Fixed(u64),
    /// A fraction of host free space, capped at `max_bytes`.
    Auto { fraction: f64, max_bytes: u64 },
}

impl Default for DiskSize {
    fn default() -> Self {
        DiskSize::Auto {
            fraction: 0.5,
            max_bytes: 64 * 1024 * 1024 * 1024,
        }
    }
}

/// A host directory exposed to the guest over virtiofs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    pub tag: String,
    pub host_path: PathBuf,
    pub mountpoint: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Host addresses every published port is bound on.
    pub bind_addresses: Vec<IpAddr>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            bind_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Shut down after this long without running tasks. `None` disables it.
    #[serde(with = "humantime_opt")]
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub handshake: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown: Duration,
    #[serde(with = "humantime_serde")]
    pub service_ready: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            shutdown: Duration::from_secs(10),
            service_ready: Duration::from_secs(60),
        }
    }
}

/// The container runtime launched once the VM is ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "containerd".into(),
            path: "/usr/bin/containerd".into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path)
            .args(self.args.iter().cloned())
            .name(&self.name);
        for (key, value) in &self.env {
            cmd = cmd.env(key, value);
        }
        cmd
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(text) => humantime::parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = DaemonConfig::from_yaml("{}").unwrap();
        assert_eq!(config.vm.cpus, 2);
        assert_eq!(config.timeouts.shutdown, Duration::from_secs(10));
        assert_eq!(config.runtime.name, "containerd");
        assert!(config.idle.delay.is_none());
        assert_eq!(
            config.forward.bind_addresses,
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
    }

    #[test]
    fn durations_are_humantime() {
        let config = DaemonConfig::from_yaml(
            "idle:\n  delay: 5m\ntimeouts:\n  handshake: 1m 30s\n  shutdown: 2s\n  service_ready: 10s\n",
        )
        .unwrap();
        assert_eq!(config.idle.delay, Some(Duration::from_secs(300)));
        assert_eq!(config.timeouts.handshake, Duration::from_secs(90));
    }

    #[test]
    fn disks_and_shares() {
        let yaml = r#"
vm:
  kernel: /opt/burrow/vmlinuz
  root_image: /opt/burrow/root.img
  guest_arch: x86_64
  disks:
    - image: /var/burrow/data.img
      mountpoint: /var/lib/containerd
      size:
        fixed: 1073741824
    - image: /var/burrow/scratch.img
      mountpoint: /var/lib/scratch
  shares:
    - tag: home
      host_path: /Users/me
      mountpoint: /Users/me
"#;
        let config = DaemonConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.vm.guest_arch, Arch::X86_64);
        assert_eq!(config.vm.disks[0].size, DiskSize::Fixed(1 << 30));
        assert_eq!(config.vm.disks[0].fs_type, "ext4");
        assert!(matches!(config.vm.disks[1].size, DiskSize::Auto { .. }));
        assert!(!config.vm.shares[0].read_only);
    }

    #[test]
    fn bad_duration_is_a_config_error() {
        let err = DaemonConfig::from_yaml("timeouts:\n  shutdown: soon\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn runtime_command_carries_name() {
        let cmd = RuntimeConfig::default().command();
        assert_eq!(cmd.path, "/usr/bin/containerd");
        assert_eq!(cmd.name.as_deref(), Some("containerd"));
    }
}
