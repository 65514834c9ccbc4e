//! Error types for burrow

use thiserror::Error;

use crate::vm::lifecycle::Phase;

/// Result type alias using burrow Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in burrow operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hypervisor framework errors (validation, start, stop, vsock)
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    /// The guest answered with an error
    #[error("Guest error: {0}")]
    Guest(String),

    /// Protocol wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] burrow_protocol::ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Lifecycle moved backwards or out of a terminal state
    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    /// VM is not running
    #[error("VM is not running")]
    VmNotRunning,

    /// Stream or datagram tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Persisted daemon state errors
    #[error("State error: {0}")]
    State(String),

    /// A `start()` step failed
    #[error("{step}: {source}")]
    Start {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the name of the start step that produced it.
    pub fn at(step: &'static str) -> impl FnOnce(Error) -> Error {
        move |source| Error::Start {
            step,
            source: Box::new(source),
        }
    }
}
