//! Stream-proxy handshake.
//!
//! The host writes `[u16 BE len]["network:address"]`, the guest dials and
//! answers `[u16 BE len][""|error]`; afterwards the connection is a raw
//! full-duplex pipe to the dialed peer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::guest::protocol::proxy::{encode_frame, format_target, STREAM_NETWORKS};

pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| Error::Tunnel(format!("non-UTF-8 proxy frame: {}", e)))
}

pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, data: &str) -> Result<()> {
    writer.write_all(&encode_frame(data)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Run the client side of the handshake on `stream`.
pub async fn handshake<S>(stream: &mut S, network: &str, address: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    if !STREAM_NETWORKS.contains(&network) {
        return Err(Error::Tunnel(format!("unsupported stream network {:?}", network)));
    }
    write_frame(stream, &format_target(network, address)).await?;
    let reply = read_frame(stream).await?;
    if reply.is_empty() {
        Ok(())
    } else {
        Err(Error::Tunnel(format!(
            "dial {}:{} failed in guest: {}",
            network, address, reply
        )))
    }
}
