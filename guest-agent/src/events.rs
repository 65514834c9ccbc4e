//! Guest → host event stream.
//!
//! Producers push [`EventRecord`]s into an [`EventSink`]; one forwarding
//! thread owns the host connection and writes them as framed messages.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use burrow_protocol::{EventRecord, Message, MessageType};

use crate::kmsg;

/// Cloneable handle for emitting event records.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<EventRecord>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, subsystem: &str, data: impl Into<Vec<u8>>) {
        // A closed receiver means nobody is listening; drop the record.
        let _ = self.tx.send(EventRecord {
            subsystem: subsystem.to_string(),
            data: data.into(),
        });
    }

    /// Spawn a thread that emits each line read from `reader` under `subsystem`.
    pub fn pump<R: Read + Send + 'static>(
        &self,
        subsystem: String,
        reader: R,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        let sink = self.clone();
        std::thread::Builder::new()
            .name(format!("pump-{}", subsystem))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => sink.emit(&subsystem, line.clone()),
                    }
                }
            })
    }
}

/// Forward records from `rx` to the connection returned by `connect`.
///
/// Reconnects with a short backoff when the host side goes away. Returns
/// once every [`EventSink`] has been dropped.
pub fn forward<W, F>(rx: Receiver<EventRecord>, mut connect: F)
where
    W: Write,
    F: FnMut() -> std::io::Result<W>,
{
    let mut conn: Option<W> = None;
    for record in rx {
        let msg = match Message::json(MessageType::EventRecord, &record) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        loop {
            if conn.is_none() {
                match connect() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        kmsg(&format!("event stream connect failed: {}", e));
                        std::thread::sleep(Duration::from_millis(500));
                        continue;
                    }
                }
            }
            if let Some(c) = conn.as_mut() {
                if msg.write_to_sync(c).is_ok() {
                    break;
                }
            }
            conn = None;
        }
    }
}
