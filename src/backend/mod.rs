//! Hypervisor abstraction.
//!
//! This module defines the [`Hypervisor`] trait the lifecycle controller
//! drives, and the [`VsockDevice`] it hands out once the VM runs. Everything
//! above this layer talks to the guest through async byte streams, so the
//! tests can swap in a loopback hypervisor backed by in-memory streams.
//!
//! Platform-specific backends:
//! - **macOS**: `VzHypervisor`, Apple Virtualization.framework

#[cfg(target_os = "macos")]
pub mod vz;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A bidirectional byte stream to the guest.
pub trait GuestStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> GuestStream for T {}

pub type BoxedStream = Box<dyn GuestStream>;

/// Host-side listener for guest-initiated vsock connections.
pub struct VsockListener {
    port: u32,
    incoming: mpsc::Receiver<BoxedStream>,
}

impl VsockListener {
    pub fn new(port: u32, incoming: mpsc::Receiver<BoxedStream>) -> Self {
        Self { port, incoming }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Next connection; `None` once the device is gone.
    pub async fn accept(&mut self) -> Option<BoxedStream> {
        self.incoming.recv().await
    }
}

/// The VM's virtio-socket device.
#[async_trait::async_trait]
pub trait VsockDevice: Send + Sync {
    /// Open a connection to a port the guest listens on.
    async fn connect(&self, port: u32) -> Result<BoxedStream>;

    /// Accept guest connections to `port` on the host.
    async fn listen(&self, port: u32) -> Result<VsockListener>;
}

/// State notifications from the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Paused,
    Stopped,
    Error,
}

/// A read-only or writable disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub image: PathBuf,
    pub read_only: bool,
}

/// A host directory shared over virtiofs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryShare {
    pub tag: String,
    pub host_path: PathBuf,
    pub read_only: bool,
}

/// Backend-agnostic description of the machine to boot.
///
/// Each backend maps it to its own platform-specific configuration.
#[derive(Debug, Clone)]
pub struct VmConfiguration {
    pub cpus: usize,
    pub memory_bytes: u64,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    /// Attach the guest console to the host's stderr.
    pub console: bool,
    pub entropy: bool,
    pub memory_balloon: bool,
    pub vsock: bool,
    /// NAT network device with this MAC address.
    pub mac_address: Option<[u8; 6]>,
    /// Attached in order: the first is the guest's `/dev/vda`.
    pub storage: Vec<StorageDevice>,
    pub shares: Vec<DirectoryShare>,
    /// virtiofs tag for the Rosetta translation share, when needed.
    pub rosetta_tag: Option<String>,
}

impl VmConfiguration {
    /// Checks every backend needs; backends add their own on top.
    pub fn validate(&self) -> Result<()> {
        if !self.vsock {
            return Err(Error::Config("a vsock device is required".into()));
        }
        if self.cpus == 0 {
            return Err(Error::Config("at least one CPU is required".into()));
        }
        if self.memory_bytes == 0 {
            return Err(Error::Config("memory size must be non-zero".into()));
        }
        let mut tags: Vec<&str> = self.shares.iter().map(|s| s.tag.as_str()).collect();
        tags.extend(self.rosetta_tag.as_deref());
        tags.sort_unstable();
        if let Some(dup) = tags.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("duplicate share tag {:?}", dup[0])));
        }
        Ok(())
    }
}

/// Trait every hypervisor backend implements.
///
/// One instance drives at most one VM.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    /// Validate `config` without starting anything.
    fn validate(&self, config: &VmConfiguration) -> Result<()>;

    /// Start the VM. The returned channel carries state notifications for
    /// the VM's whole life.
    async fn start(&self, config: &VmConfiguration) -> Result<mpsc::Receiver<VmState>>;

    /// The vsock device of the running VM.
    fn vsock(&self) -> Result<Arc<dyn VsockDevice>>;

    /// Stop the VM and release the hypervisor's resources.
    async fn stop(&self) -> Result<()>;
}

/// Create the platform-appropriate hypervisor.
#[cfg(target_os = "macos")]
pub fn create_hypervisor() -> Result<Arc<dyn Hypervisor>> {
    Ok(Arc::new(vz::VzHypervisor::new()))
}

/// Create the platform-appropriate hypervisor.
#[cfg(not(target_os = "macos"))]
pub fn create_hypervisor() -> Result<Arc<dyn Hypervisor>> {
    Err(Error::Config(
        "no hypervisor backend is available on this platform".into(),
    ))
}
