//! Readiness notification socket (`NOTIFY_SOCKET`, `READY=1`).

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

/// Poll granularity while waiting for readiness.
const POLL: Duration = Duration::from_millis(100);

/// What ended a readiness wait.
#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Exited(i32),
    TimedOut,
}

/// A bound datagram socket a service reports readiness to.
///
/// The socket file is removed on drop.
pub struct NotifySocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl NotifySocket {
    pub fn bind(dir: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(32)
            .collect();
        let path = dir.join(format!(
            "notify-{}-{}.sock",
            safe,
            NEXT_SOCKET.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self { socket, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until `READY=1` arrives, `exited` reports an exit code, or
    /// `timeout` elapses. Readiness received before the exit is observed wins.
    pub fn wait<F>(&self, timeout: Duration, mut exited: F) -> io::Result<Readiness>
    where
        F: FnMut() -> Option<i32>,
    {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Readiness::TimedOut);
            }
            self.socket.set_read_timeout(Some(remaining.min(POLL)))?;
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    if is_ready(&buf[..n]) {
                        return Ok(Readiness::Ready);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
            if let Some(code) = exited() {
                return Ok(Readiness::Exited(code));
            }
        }
    }
}

impl Drop for NotifySocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Whether a notification datagram contains a `READY=1` line.
pub fn is_ready(datagram: &[u8]) -> bool {
    String::from_utf8_lossy(datagram)
        .lines()
        .any(|line| line.trim() == "READY=1")
}
