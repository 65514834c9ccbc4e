//! Interactive exec sessions.
//!
//! After `ExecStart` the connection belongs to one process: the host sends
//! stdin, stdin-close and signal messages; the guest streams output chunks
//! and finishes with `ExecExit`, then shuts the connection down.

use std::io::{Read, Write};
use std::process::{ChildStdin, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use burrow_protocol::{
    ExecExit, ExecOutput, ExecSignal, ExecStart, ExecStdin, Message, MessageType, OutputStream,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::conn::Connection;
use crate::error::{GuestError, Result};
use crate::process::{build, exit_code};
use crate::reaper;

fn send<C: Connection>(writer: &Mutex<C>, msg: &Message) -> Result<()> {
    let mut conn = writer.lock().unwrap_or_else(|e| e.into_inner());
    msg.write_to_sync(&mut *conn)?;
    Ok(())
}

fn pump<C: Connection, R: Read + Send + 'static>(
    writer: Arc<Mutex<C>>,
    mut pipe: R,
    stream: OutputStream,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("exec-{:?}", stream))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = ExecOutput {
                            stream,
                            data: buf[..n].to_vec(),
                        };
                        let sent = Message::json(MessageType::ExecOutput, &chunk)
                            .map_err(GuestError::from)
                            .and_then(|msg| send(&writer, &msg));
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        })
}

/// Run one interactive session on `conn`.
pub fn run_session<C: Connection>(mut conn: C, start: ExecStart) -> Result<()> {
    let mut proc = build(&start.command);
    proc.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match reaper::spawn(&mut proc) {
        Ok(child) => child,
        Err(e) => {
            let exit = ExecExit {
                exit: -1,
                error: Some(format!("failed to start {}: {}", start.command.path, e)),
            };
            Message::json(MessageType::ExecExit, &exit)?.write_to_sync(&mut conn)?;
            return Ok(());
        }
    };
    let pid = Pid::from_raw(child.id() as i32);

    let writer = Arc::new(Mutex::new(conn.try_clone()?));
    let mut pumps = Vec::new();
    if let Some(out) = child.stdout.take() {
        pumps.push(pump(writer.clone(), out, OutputStream::Stdout)?);
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(pump(writer.clone(), err, OutputStream::Stderr)?);
    }
    let mut stdin: Option<ChildStdin> = child.stdin.take();

    let finished = Arc::new(AtomicBool::new(false));
    let waiter = {
        let writer = writer.clone();
        let finished = finished.clone();
        std::thread::Builder::new()
            .name("exec-wait".into())
            .spawn(move || {
                for handle in pumps {
                    let _ = handle.join();
                }
                let waited = child.wait();
                reaper::forget(child.id());
                let exit = match waited {
                    Ok(status) => ExecExit {
                        exit: exit_code(status),
                        error: None,
                    },
                    Err(e) => ExecExit {
                        exit: -1,
                        error: Some(e.to_string()),
                    },
                };
                finished.store(true, Ordering::SeqCst);
                if let Ok(msg) = Message::json(MessageType::ExecExit, &exit) {
                    let _ = send(&writer, &msg);
                }
                let conn = writer.lock().unwrap_or_else(|e| e.into_inner());
                let _ = conn.shutdown();
            })?
    };

    loop {
        let msg = match Message::read_from_sync(&mut conn) {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg.msg_type {
            MessageType::ExecStdin => {
                let data: ExecStdin = msg.decode()?;
                if let Some(pipe) = stdin.as_mut() {
                    if pipe.write_all(&data.data).is_err() {
                        stdin = None;
                    }
                }
            }
            MessageType::ExecStdinClose => stdin = None,
            MessageType::ExecSignal => {
                let req: ExecSignal = msg.decode()?;
                if let Ok(signal) = Signal::try_from(req.signal) {
                    let _ = kill(pid, signal);
                }
            }
            _ => {}
        }
    }

    // The host went away before the process finished.
    if !finished.load(Ordering::SeqCst) {
        drop(stdin);
        let _ = kill(pid, Signal::SIGKILL);
    }
    let _ = waiter.join();
    Ok(())
}
