//! Init process for burrow VMs.
//!
//! Runs as PID 1 inside the guest and serves the host over vsock:
//! - control requests (files, mounts, processes, sysctls, metrics, shutdown)
//! - interactive exec sessions
//! - stream and datagram proxies into the guest network
//! - the guest → host event stream and clock synchronization
//! - reaping orphans it inherits as PID 1

#[cfg(not(target_os = "linux"))]
compile_error!("burrow-guest is Linux-only (runs as PID 1 inside the VM)");

pub mod conn;
pub mod error;
pub mod events;
pub mod exec;
pub mod fs;
pub mod metrics;
pub mod notify;
pub mod process;
pub mod proxy;
pub mod reaper;
pub mod server;
pub mod system;
pub mod timesync;

pub use error::{GuestError, Result};

/// Write a message to /dev/kmsg so it appears on the kernel console.
pub fn kmsg(msg: &str) {
    eprintln!("{}", msg);
    if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        use std::io::Write;
        let _ = writeln!(f, "burrow-guest: {}", msg);
    }
}
