//! Guest communication module
//!
//! The control-protocol client, interactive exec sessions, and the async
//! framing both are built on.

pub mod client;
pub mod exec;
pub mod protocol;

pub use client::GuestClient;
pub use exec::{ExecEvent, ExecResult, ExecSession};
pub use protocol::{read_message, write_message, Message, MessageType};
