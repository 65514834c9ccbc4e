//! Guest clock synchronization against the host.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use burrow_protocol::timesync::{self, REPLY_SIZE};
use burrow_protocol::{ports, ProtocolError};
use nix::sys::time::TimeSpec;
use nix::time::{clock_settime, ClockId};

use crate::conn::VsockStream;
use crate::error::{GuestError, Result};
use crate::kmsg;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// One request/reply exchange. Returns the correction to apply, if any.
pub fn exchange<S: Read + Write>(stream: &mut S, threshold_ns: i64) -> Result<Option<i64>> {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let sent = now_ns();
    stream.write_all(&timesync::encode_request(id))?;
    stream.flush()?;

    let mut reply = [0u8; REPLY_SIZE];
    stream.read_exact(&mut reply)?;
    let recv = now_ns();

    let (echoed, host_ns) = timesync::decode_reply(&reply);
    if echoed != id {
        return Err(GuestError::Protocol(ProtocolError::InvalidMessage(format!(
            "clock reply for request {} while waiting for {}",
            echoed, id
        ))));
    }
    Ok(timesync::clock_correction(sent, recv, host_ns, threshold_ns))
}

fn apply(offset_ns: i64) -> Result<()> {
    let target = now_ns().saturating_add(offset_ns);
    let spec = TimeSpec::new(
        target.div_euclid(1_000_000_000) as _,
        target.rem_euclid(1_000_000_000) as _,
    );
    clock_settime(ClockId::CLOCK_REALTIME, spec)?;
    Ok(())
}

/// Sync once over a fresh host connection.
pub fn sync_once(threshold_ns: i64) -> Result<()> {
    let mut stream = VsockStream::connect_host(ports::TIMESYNC)?;
    if let Some(offset) = exchange(&mut stream, threshold_ns)? {
        apply(offset)?;
        kmsg(&format!("clock adjusted by {} ms", offset / 1_000_000));
    }
    Ok(())
}

/// Repeat [`sync_once`] forever. Failures are logged and retried next round.
pub fn run_loop(interval: Duration, threshold_ns: i64) {
    loop {
        if let Err(e) = sync_once(threshold_ns) {
            kmsg(&format!("clock sync failed: {}", e));
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn fake_host(mut stream: UnixStream, skew_ns: i64, wrong_id: bool) {
        std::thread::spawn(move || {
            let mut req = [0u8; timesync::REQUEST_SIZE];
            stream.read_exact(&mut req).unwrap();
            let id = timesync::decode_request(&req) + u64::from(wrong_id);
            let reply = timesync::encode_reply(id, now_ns() + skew_ns);
            stream.write_all(&reply).unwrap();
        });
    }

    #[test]
    fn in_sync_clock_left_alone() {
        let (mut guest, host) = UnixStream::pair().unwrap();
        fake_host(host, 0, false);
        let correction = exchange(&mut guest, timesync::DEFAULT_THRESHOLD_NS).unwrap();
        assert_eq!(correction, None);
    }

    #[test]
    fn skewed_clock_corrected() {
        let (mut guest, host) = UnixStream::pair().unwrap();
        fake_host(host, 10_000_000_000, false);
        let correction = exchange(&mut guest, timesync::DEFAULT_THRESHOLD_NS)
            .unwrap()
            .unwrap();
        assert!((9_900_000_000..=10_100_000_000).contains(&correction));
    }

    #[test]
    fn mismatched_id_rejected() {
        let (mut guest, host) = UnixStream::pair().unwrap();
        fake_host(host, 0, true);
        assert!(exchange(&mut guest, timesync::DEFAULT_THRESHOLD_NS).is_err());
    }
}
