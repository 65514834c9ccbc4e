use burrow_protocol::ProtocolError;

/// Errors raised while serving host requests.
///
/// At the wire boundary these become the `error` string of a reply.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("name in use: {0}")]
    NameInUse(String),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, GuestError>;
