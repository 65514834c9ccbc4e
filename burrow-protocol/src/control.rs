//! Request and reply bodies for the guest control protocol.
//!
//! Every request type is sent with its own [`MessageType`](crate::MessageType)
//! and answered with a single [`Reply`]. A reply carries either a JSON value
//! or an error string; a nonzero process exit is a value, never an error.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Reply envelope
// ---------------------------------------------------------------------------

/// Reply to any control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Operation result (JSON `null` for operations without output).
    #[serde(default)]
    pub value: serde_json::Value,
    /// Error message if the operation failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Reply {
    /// A successful reply carrying `value`.
    pub fn ok<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            value: serde_json::to_value(value)?,
            error: None,
        })
    }

    /// A successful reply with no value.
    pub fn done() -> Self {
        Self {
            value: serde_json::Value::Null,
            error: None,
        }
    }

    /// A failed reply.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }

    /// Split into the remote outcome. The outer `Result` fails only when the
    /// value cannot be decoded as `T`.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<Result<T, String>, ProtocolError> {
        if let Some(error) = self.error {
            return Ok(Err(error));
        }
        Ok(Ok(serde_json::from_value(self.value)?))
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Post-boot initialization request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitRequest {
    /// Size of the writable overlay tmpfs in MiB (0 keeps the guest default).
    #[serde(default)]
    pub overlay_size_mb: u64,
    /// Kernel tunables to apply before anything else runs.
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
}

/// Post-boot initialization result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    /// Guest protocol version.
    pub version: u32,
    /// IPv4 address the guest obtained on its primary interface.
    pub ipv4_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Write a file in the guest. Parent directories are created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Absolute guest path.
    pub path: String,
    /// File content.
    pub data: Vec<u8>,
    /// Permission bits (defaults to 0o644).
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Create a directory and its parents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
    /// Absolute guest path.
    pub path: String,
}

/// Mount a filesystem in the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    /// Filesystem type (`ext4`, `virtiofs`, `tmpfs`, ...).
    pub fs: String,
    /// Source device, share tag, or pseudo-source.
    pub device: String,
    /// Mount target directory.
    pub target: String,
    /// `MS_*` flag bits, see [`mount_flags`].
    #[serde(default)]
    pub flags: u64,
    /// Filesystem-specific option string.
    #[serde(default)]
    pub data: String,
}

/// Linux `MS_*` mount flag values.
pub mod mount_flags {
    pub const MS_RDONLY: u64 = 1;
    pub const MS_NOSUID: u64 = 2;
    pub const MS_NODEV: u64 = 4;
    pub const MS_NOEXEC: u64 = 8;
    pub const MS_NOATIME: u64 = 1024;
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// A process to run in the guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    /// Executable path (resolved against `PATH` when it has no `/`).
    pub path: String,
    /// Arguments, not including argv[0].
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Working directory.
    #[serde(default)]
    pub dir: Option<String>,
    /// Bytes written to stdin before it is closed.
    #[serde(default)]
    pub stdin: Vec<u8>,
    /// Logical name for `launch`; defaults to the PID.
    #[serde(default)]
    pub name: Option<String>,
}

impl Command {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = data.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Result of `Run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Interleaved stdout and stderr.
    pub output: Vec<u8>,
    /// Exit code; `-1` when the process was killed by a signal.
    pub exit: i32,
}

impl CommandOutput {
    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Result of `Launch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub pid: i32,
    /// Registry name the process was filed under.
    pub name: String,
}

/// Launch a command and wait until it reports readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchServiceRequest {
    pub command: Command,
    /// How long to wait for `READY=1`.
    pub timeout_ms: u64,
}

/// How a `LaunchService` call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    /// The process sent `READY=1`; it stays registered.
    Ready { pid: i32, name: String },
    /// The process exited before becoming ready; its entry is gone.
    Exited { pid: i32, exit: i32 },
    /// No readiness within the deadline; the process stays registered.
    TimedOut { pid: i32, name: String },
}

/// `Wait` and `Release` target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub name: String,
}

/// Result of `Wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub exit: i32,
}

/// Deliver a signal. Exactly one of `pid` or `service` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub service: Option<String>,
    pub signal: i32,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Apply kernel tunables (`net.ipv4.ip_forward` → `/proc/sys/net/ipv4/ip_forward`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysctlRequest {
    pub values: BTreeMap<String, String>,
}

/// Metric group names accepted by `Metrics`.
pub mod metric_names {
    pub const UPTIME: &str = "uptime";
    pub const LOAD: &str = "load";
    pub const MEMORY: &str = "memory";
    pub const SWAP: &str = "swap";
    pub const PROCESSES: &str = "processes";
    pub const DISKS: &str = "disks";
    pub const ALL: [&str; 6] = [UPTIME, LOAD, MEMORY, SWAP, PROCESSES, DISKS];
}

/// Request a subset of metrics; empty means all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRequest {
    #[serde(default)]
    pub names: Vec<String>,
}

/// Guest metrics snapshot. Groups not requested are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub uptime_secs: Option<f64>,
    /// 1, 5 and 15 minute load averages.
    pub load: Option<[f64; 3]>,
    pub memory: Option<MemoryStats>,
    pub swap: Option<SwapStats>,
    pub processes: Option<u32>,
    pub disks: Option<Vec<DiskUsage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mountpoint: String,
    pub fs_type: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

// ---------------------------------------------------------------------------
// Interactive exec
// ---------------------------------------------------------------------------

/// Start an interactive process; the connection then carries its stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStart {
    pub command: Command,
}

/// Stdin bytes for the interactive process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStdin {
    pub data: Vec<u8>,
}

/// Signal for the interactive process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSignal {
    pub signal: i32,
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Incremental stdout/stderr chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// Final status of the interactive process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecExit {
    pub exit: i32,
    /// Set when the process could not be started or waited on.
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// One record on the guest → host event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Origin: a launched process's logical name, or `kernel`, `init`, ...
    pub subsystem: String,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
