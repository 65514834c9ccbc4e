//! Shared wire-format types for burrow host ↔ guest communication.
//!
//! This crate is the single source of truth for the message protocol used
//! between the host control plane (`burrow`) and the guest init process
//! (`burrow-guest`). Both crates depend on it.
//!
//! ## Wire Format
//!
//! Every control message is framed as:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────┐
//! │ length (4 B) │ type (1B) │ payload (N bytes) │
//! └──────────────┴───────────┴──────────────────┘
//! ```
//!
//! - **length**: `u32` little-endian, size of the payload only (not including the 5-byte header).
//! - **type**: one byte mapping to [`MessageType`].
//! - **payload**: JSON-encoded body (may be empty).
//!
//! The stream proxy ([`proxy`]) and clock sync ([`timesync`]) sub-protocols
//! use their own fixed binary layouts and do not go through this framing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod control;
pub mod proxy;
pub mod timesync;

pub use control::*;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during protocol message parsing.
#[derive(Debug)]
pub enum ProtocolError {
    /// Message buffer too short or incomplete.
    InvalidMessage(String),
    /// The type byte does not map to a known [`MessageType`].
    UnknownMessageType(u8),
    /// Declared payload length exceeds [`MAX_MESSAGE_SIZE`].
    PayloadTooLarge(usize),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ProtocolError::UnknownMessageType(b) => write!(f, "Unknown message type: {}", b),
            ProtocolError::PayloadTooLarge(n) => {
                write!(f, "Payload too large: {} bytes (max {})", n, MAX_MESSAGE_SIZE)
            }
            ProtocolError::Io(e) => write!(f, "IO error: {}", e),
            ProtocolError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (length) + 1 (type).
pub const HEADER_SIZE: usize = 5;

/// Largest payload either side will accept (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol version exchanged in the Ping/Pong handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known vsock ports.
pub mod ports {
    /// Guest listens; host opens control connections.
    pub const CONTROL: u32 = 1024;
    /// Host listens; guest connects once and streams log/event records.
    pub const EVENTS: u32 = 1025;
    /// Guest listens; each connection is one stream-proxy tunnel.
    pub const STREAM_PROXY: u32 = 1026;
    /// Guest listens; each connection is one datagram-proxy instance.
    pub const DATAGRAM_PROXY: u32 = 1027;
    /// Host listens; guest connects for clock synchronization.
    pub const TIMESYNC: u32 = 1028;
}

/// The host's vsock CID as seen from the guest.
pub const HOST_CID: u32 = 2;

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Message types for host-guest communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake request carrying the host protocol version.
    Ping = 1,
    /// Handshake reply carrying the guest protocol version.
    Pong = 2,
    /// Post-boot initialization (overlay size, sysctls).
    Init = 3,
    /// Write a file.
    Write = 4,
    /// Create directories recursively.
    Mkdir = 5,
    /// Mount a filesystem.
    Mount = 6,
    /// Run a command to completion.
    Run = 7,
    /// Launch a command in the background.
    Launch = 8,
    /// Launch a command and wait for its readiness notification.
    LaunchService = 9,
    /// Wait for a launched process to exit.
    Wait = 10,
    /// Forget a launched process without waiting.
    Release = 11,
    /// Deliver a signal to a launched process or PID.
    Signal = 12,
    /// Apply kernel tunables.
    Sysctl = 13,
    /// Collect guest metrics.
    Metrics = 14,
    /// Begin guest teardown and power off.
    Shutdown = 15,
    /// Reply to any of the request types above.
    Reply = 16,
    /// Start an interactive process on this connection.
    ExecStart = 20,
    /// Bytes for the interactive process's stdin.
    ExecStdin = 21,
    /// Close the interactive process's stdin.
    ExecStdinClose = 22,
    /// Signal the interactive process.
    ExecSignal = 23,
    /// A chunk of stdout/stderr from the interactive process.
    ExecOutput = 24,
    /// Final exit status of the interactive process.
    ExecExit = 25,
    /// One log/event record on the event stream.
    EventRecord = 30,
    /// Datagram proxy control request.
    DatagramRequest = 40,
    /// Datagram proxy control response.
    DatagramResponse = 41,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(MessageType::Ping),
            2 => Ok(MessageType::Pong),
            3 => Ok(MessageType::Init),
            4 => Ok(MessageType::Write),
            5 => Ok(MessageType::Mkdir),
            6 => Ok(MessageType::Mount),
            7 => Ok(MessageType::Run),
            8 => Ok(MessageType::Launch),
            9 => Ok(MessageType::LaunchService),
            10 => Ok(MessageType::Wait),
            11 => Ok(MessageType::Release),
            12 => Ok(MessageType::Signal),
            13 => Ok(MessageType::Sysctl),
            14 => Ok(MessageType::Metrics),
            15 => Ok(MessageType::Shutdown),
            16 => Ok(MessageType::Reply),
            20 => Ok(MessageType::ExecStart),
            21 => Ok(MessageType::ExecStdin),
            22 => Ok(MessageType::ExecStdinClose),
            23 => Ok(MessageType::ExecSignal),
            24 => Ok(MessageType::ExecOutput),
            25 => Ok(MessageType::ExecExit),
            30 => Ok(MessageType::EventRecord),
            40 => Ok(MessageType::DatagramRequest),
            41 => Ok(MessageType::DatagramResponse),
            _ => Err(ProtocolError::UnknownMessageType(byte)),
        }
    }
}

// ---------------------------------------------------------------------------
// Message (wire frame)
// ---------------------------------------------------------------------------

/// A framed protocol message consisting of a type tag and a payload.
///
/// Use [`Message::serialize`] / [`Message::deserialize`] for in-memory
/// conversion and [`Message::read_from_sync`] for streaming from a reader.
#[derive(Debug, Clone)]
pub struct Message {
    /// Type of message.
    pub msg_type: MessageType,
    /// Message payload (typically JSON-encoded).
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(msg_type: MessageType, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type,
            payload: serde_json::to_vec(body)?,
        })
    }

    /// A message with no payload.
    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    /// Decode the JSON payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize this message into a byte buffer (header + payload).
    pub fn serialize(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a message from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("Message too short".into()));
        }

        let (length, msg_type) = parse_header(&[data[0], data[1], data[2], data[3], data[4]])?;

        if data.len() < HEADER_SIZE + length {
            return Err(ProtocolError::InvalidMessage("Incomplete message".into()));
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        Ok(Self { msg_type, payload })
    }

    /// Read a complete message from a synchronous [`std::io::Read`] stream.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let (length, msg_type) = parse_header(&header)?;

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Self { msg_type, payload })
    }

    /// Write this message to a synchronous [`std::io::Write`] stream.
    pub fn write_to_sync<W: std::io::Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.serialize())?;
        writer.flush()?;
        Ok(())
    }
}

/// Parse a 5-byte header into `(payload length, type)`, enforcing
/// [`MAX_MESSAGE_SIZE`] before any payload is allocated.
pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(usize, MessageType), ProtocolError> {
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(length));
    }
    let msg_type = MessageType::try_from(header[4])?;
    Ok((length, msg_type))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = Message {
            msg_type: MessageType::Ping,
            payload: b"hello".to_vec(),
        };
        let bytes = msg.serialize();
        let decoded = Message::deserialize(&bytes).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ping);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn message_empty_payload() {
        let bytes = Message::empty(MessageType::Shutdown).serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = Message::deserialize(&bytes).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Shutdown);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn message_type_try_from_invalid() {
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(17).is_err());
        assert!(MessageType::try_from(255).is_err());
    }

    #[test]
    fn message_type_byte_values_are_stable() {
        for ty in [
            MessageType::Ping,
            MessageType::Reply,
            MessageType::ExecExit,
            MessageType::EventRecord,
            MessageType::DatagramResponse,
        ] {
            assert_eq!(MessageType::try_from(ty as u8).unwrap(), ty);
        }
    }

    #[test]
    fn message_deserialize_too_short() {
        assert!(Message::deserialize(&[0, 0]).is_err());
    }

    #[test]
    fn message_deserialize_incomplete() {
        // Header says 10 bytes payload but only 2 present
        let data = [10, 0, 0, 0, 1, 0xAA, 0xBB];
        assert!(Message::deserialize(&data).is_err());
    }

    #[test]
    fn oversized_header_rejected_before_allocation() {
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        let header = [len[0], len[1], len[2], len[3], MessageType::Write as u8];
        let mut cursor = std::io::Cursor::new(header.to_vec());
        match Message::read_from_sync(&mut cursor) {
            Err(ProtocolError::PayloadTooLarge(n)) => assert_eq!(n, MAX_MESSAGE_SIZE + 1),
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn read_from_sync_consumes_back_to_back_frames() {
        let mut bytes = Message::json(MessageType::Mkdir, &MkdirRequest { path: "/a".into() })
            .unwrap()
            .serialize();
        bytes.extend(Message::empty(MessageType::Shutdown).serialize());
        let mut cursor = std::io::Cursor::new(bytes);

        let first = Message::read_from_sync(&mut cursor).unwrap();
        assert_eq!(first.msg_type, MessageType::Mkdir);
        let req: MkdirRequest = first.decode().unwrap();
        assert_eq!(req.path, "/a");

        let second = Message::read_from_sync(&mut cursor).unwrap();
        assert_eq!(second.msg_type, MessageType::Shutdown);
    }
}
