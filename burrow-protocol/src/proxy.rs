//! Stream and datagram proxy sub-protocols.
//!
//! A stream-proxy connection starts with a `[u16 BE len][utf8]` target
//! `"network:address"`, answered by `[u16 BE len][utf8]` where an empty
//! string means success. After that the connection is a raw duplex pipe.
//!
//! A datagram-proxy connection carries framed [`DatagramRequest`] /
//! [`DatagramResponse`] messages, one response per request.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Networks the stream proxy accepts.
pub const STREAM_NETWORKS: [&str; 4] = ["tcp", "tcp4", "tcp6", "unix"];

/// Networks the datagram proxy accepts.
pub const DATAGRAM_NETWORKS: [&str; 4] = ["udp", "udp4", "udp6", "unixgram"];

/// Write one `[u16 BE len][bytes]` frame.
pub fn write_frame<W: Write>(writer: &mut W, data: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLarge(data.len()))?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(data.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one `[u16 BE len][bytes]` frame as UTF-8.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<String, ProtocolError> {
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

/// Encode a frame into a buffer, for async writers.
pub fn encode_frame(data: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(2 + data.len());
    write_frame(&mut buf, data)?;
    Ok(buf)
}

/// Build the `"network:address"` target string.
pub fn format_target(network: &str, address: &str) -> String {
    format!("{}:{}", network, address)
}

/// Split a `"network:address"` target at the first colon.
///
/// The address keeps any further colons (`tcp6:[::1]:80`).
pub fn parse_target(target: &str) -> Result<(&str, &str), ProtocolError> {
    match target.split_once(':') {
        Some((network, address)) if !network.is_empty() && !address.is_empty() => {
            Ok((network, address))
        }
        _ => Err(ProtocolError::InvalidMessage(format!(
            "malformed proxy target {:?}",
            target
        ))),
    }
}

// ---------------------------------------------------------------------------
// Datagram proxy
// ---------------------------------------------------------------------------

/// Datagram-proxy control request. Deadlines are relative to receipt;
/// `None` clears the deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DatagramRequest {
    /// Bind an ephemeral local socket connected to `address`.
    Dial { network: String, address: String },
    /// Bind a socket at `address`.
    Listen { network: String, address: String },
    /// Receive one datagram.
    Read { max_len: usize },
    /// Send one datagram; `address` is required for unconnected sockets.
    Write {
        data: Vec<u8>,
        #[serde(default)]
        address: Option<String>,
    },
    SetDeadline { timeout_ms: Option<u64> },
    SetReadDeadline { timeout_ms: Option<u64> },
    SetWriteDeadline { timeout_ms: Option<u64> },
    Close,
}

/// Datagram-proxy control response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramResponse {
    #[serde(default)]
    pub error: Option<String>,
    /// Received payload (`Read`).
    #[serde(default)]
    pub data: Vec<u8>,
    /// Peer address of a received datagram (`Read`).
    #[serde(default)]
    pub address: Option<String>,
    /// Bytes sent (`Write`).
    #[serde(default)]
    pub written: usize,
    /// Bound local address (`Dial`, `Listen`).
    #[serde(default)]
    pub local_address: Option<String>,
    /// Set when a read or write hit its deadline.
    #[serde(default)]
    pub timed_out: bool,
}

impl DatagramResponse {
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}
