//! Host side of the clock-sync exchange.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::backend::VsockListener;
use crate::guest::protocol::timesync::{decode_request, encode_reply, REQUEST_SIZE};

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Answer clock-sync requests until the listener closes.
pub async fn serve(mut listener: VsockListener) {
    debug!(port = listener.port(), "clock sync responder listening");
    while let Some(conn) = listener.accept().await {
        tokio::spawn(respond(conn));
    }
    debug!("clock sync responder stopped");
}

/// Answer every request on one connection; returns when the guest hangs up.
pub async fn respond<S>(mut conn: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = [0u8; REQUEST_SIZE];
    loop {
        if conn.read_exact(&mut request).await.is_err() {
            return;
        }
        let id = decode_request(&request);
        let now = wall_clock_ns();
        trace!(id, now, "clock sync");
        if conn.write_all(&encode_reply(id, now)).await.is_err() {
            return;
        }
        if conn.flush().await.is_err() {
            return;
        }
    }
}
