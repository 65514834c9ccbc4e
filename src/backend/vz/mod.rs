//! macOS Virtualization.framework backend.
//!
//! ## Architecture
//!
//! - **Boot**: `VZLinuxBootLoader` with kernel, optional initrd, and cmdline
//! - **Networking**: `VZNATNetworkDeviceAttachment` with a stable MAC address
//! - **Storage**: `VZVirtioBlockDeviceConfiguration` per disk image, root first
//! - **Shares**: `VZVirtioFileSystemDeviceConfiguration` (virtiofs), plus Rosetta
//! - **Host↔Guest**: `VZVirtioSocketDevice` → dup'd fd → tokio `UnixStream`
//!
//! Every call into a `VZVirtualMachine` or its devices is dispatched onto the
//! serial queue the machine was created with.

mod backend;
pub mod config;
pub mod vsock;

pub use backend::VzHypervisor;
