//! Clock synchronization exchange.
//!
//! The guest sends an 8-byte request id (u64 BE). The host answers with the
//! same id followed by its wall-clock time as i64 nanoseconds since the Unix
//! epoch (BE), 16 bytes total.

use byteorder::{BigEndian, ByteOrder};

pub const REQUEST_SIZE: usize = 8;
pub const REPLY_SIZE: usize = 16;

/// Offsets smaller than this are left alone.
pub const DEFAULT_THRESHOLD_NS: i64 = 50_000_000;

/// How often the guest repeats the exchange.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

pub fn encode_request(id: u64) -> [u8; REQUEST_SIZE] {
    let mut buf = [0u8; REQUEST_SIZE];
    BigEndian::write_u64(&mut buf, id);
    buf
}

pub fn decode_request(buf: &[u8; REQUEST_SIZE]) -> u64 {
    BigEndian::read_u64(buf)
}

pub fn encode_reply(id: u64, host_ns: i64) -> [u8; REPLY_SIZE] {
    let mut buf = [0u8; REPLY_SIZE];
    BigEndian::write_u64(&mut buf[..8], id);
    BigEndian::write_i64(&mut buf[8..], host_ns);
    buf
}

/// Returns `(id, host_ns)`.
pub fn decode_reply(buf: &[u8; REPLY_SIZE]) -> (u64, i64) {
    (BigEndian::read_u64(&buf[..8]), BigEndian::read_i64(&buf[8..]))
}

/// Offset to add to the local clock, or `None` when within `threshold_ns`.
///
/// `sent_ns`/`recv_ns` are local wall times around the exchange; the host
/// timestamp is assumed to sit at the midpoint of the round trip.
pub fn clock_correction(sent_ns: i64, recv_ns: i64, host_ns: i64, threshold_ns: i64) -> Option<i64> {
    let rtt = recv_ns.saturating_sub(sent_ns).max(0);
    let offset = host_ns
        .saturating_add(rtt / 2)
        .saturating_sub(recv_ns);
    if offset.unsigned_abs() > threshold_ns.unsigned_abs() {
        Some(offset)
    } else {
        None
    }
}
