//! Guest control protocol, host side.
//!
//! Re-exports the wire types from the shared [`burrow_protocol`] crate and
//! adds async framing for tokio streams.

pub use burrow_protocol::*;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Read a complete [`Message`] from an async stream.
///
/// The async counterpart of [`Message::read_from_sync`]. Oversized payloads
/// are rejected from the header alone.
pub async fn read_message<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let (length, msg_type) = parse_header(&header)?;
    let mut payload = vec![0u8; length];
    if length > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Guest(format!("Failed to read message payload: {}", e)))?;
    }

    Ok(Message { msg_type, payload })
}

/// Write one framed [`Message`] and flush.
pub async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    msg: &Message,
) -> Result<()> {
    writer.write_all(&msg.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Whether an error means the peer closed the connection cleanly.
pub fn is_eof(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}
