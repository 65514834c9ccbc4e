//! burrow: host-side control plane for a container-runtime VM
//!
//! Boots a minimal Linux guest under the platform hypervisor, drives it
//! through a request/response control protocol over vsock, and runs the
//! control loops that keep the host in step with the containers inside.
//!
//! # Key Pieces
//!
//! - **Lifecycle**: [`VirtualMachine`] boots, mounts and shuts down the guest
//! - **Control protocol**: [`GuestClient`] for file, mount and process calls
//! - **Tunnel**: [`TunnelClient`] dials streams and datagram sockets in the guest
//! - **Port forwarding**: [`PortForwardManager`] publishes container ports
//! - **Idle shutdown**: [`IdleLatch`] stops the VM when no tasks run
//!
//! # Example
//!
//! ```no_run
//! use burrow::{backend, DaemonConfig, VirtualMachine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DaemonConfig::load("burrow.yaml".as_ref())?;
//!     let hypervisor = backend::create_hypervisor()?;
//!
//!     let mut vm = VirtualMachine::new(config, hypervisor)?;
//!     vm.start().await?;
//!
//!     let output = vm.client()?.run(&burrow::Command::new("uname").arg("-a")).await?;
//!     println!("{}", output.output_str());
//!
//!     vm.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod forward;
pub mod guest;
pub mod idle;
pub mod state;
pub mod tunnel;
pub mod vm;

pub use config::DaemonConfig;
pub use error::{Error, Result};
pub use events::{ContainerEvent, TaskEvent};
pub use forward::PortForwardManager;
pub use guest::protocol::{Command, CommandOutput};
pub use guest::GuestClient;
pub use idle::IdleLatch;
pub use state::{DaemonState, StateStore};
pub use tunnel::TunnelClient;
pub use vm::lifecycle::Phase;
pub use vm::VirtualMachine;
