//! Guest event stream consumer.

use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::VsockListener;
use crate::guest::protocol::{is_eof, read_message, EventRecord, MessageType};

/// Capacity of the per-VM event broadcast.
pub const EVENT_BACKLOG: usize = 1024;

/// Accept the guest's single event connection and drain it.
pub async fn consume(mut listener: VsockListener, events: broadcast::Sender<EventRecord>) {
    let Some(conn) = listener.accept().await else {
        debug!("event listener closed before the guest connected");
        return;
    };
    drop(listener);
    debug!("guest event stream connected");
    relay(conn, &events).await;
}

/// Re-emit each record under the `guest` tracing target and broadcast it.
pub async fn relay<R: AsyncRead + Unpin>(mut conn: R, events: &broadcast::Sender<EventRecord>) {
    loop {
        let msg = match read_message(&mut conn).await {
            Ok(msg) => msg,
            Err(e) if is_eof(&e) => {
                debug!("guest event stream closed");
                return;
            }
            Err(e) => {
                warn!("guest event stream failed: {}", e);
                return;
            }
        };
        if msg.msg_type != MessageType::EventRecord {
            warn!(msg_type = ?msg.msg_type, "ignoring message on event stream");
            continue;
        }
        let record: EventRecord = match msg.decode() {
            Ok(record) => record,
            Err(e) => {
                warn!("malformed event record: {}", e);
                continue;
            }
        };
        let text = String::from_utf8_lossy(&record.data);
        info!(target: "guest", subsystem = %record.subsystem, "{}", text.trim_end());
        // No subscribers is fine.
        let _ = events.send(record);
    }
}
