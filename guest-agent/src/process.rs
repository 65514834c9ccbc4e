//! Process execution and the registry of launched processes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use burrow_protocol::{Command, CommandOutput, LaunchOutcome, LaunchResponse, SignalRequest};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{GuestError, Result};
use crate::events::EventSink;
use crate::kmsg;
use crate::notify::{NotifySocket, Readiness};
use crate::reaper;

/// Exit code reported for a process killed by a signal.
pub const SIGNALED_EXIT: i32 = -1;

pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|_| SIGNALED_EXIT))
        .unwrap_or(SIGNALED_EXIT)
}

/// Build a `std::process::Command` from a wire command. Stdio is left to the caller.
pub fn build(cmd: &Command) -> std::process::Command {
    let mut proc = std::process::Command::new(&cmd.path);
    proc.args(&cmd.args);
    for (key, value) in &cmd.env {
        proc.env(key, value);
    }
    if let Some(dir) = &cmd.dir {
        proc.current_dir(dir);
    }
    proc
}

fn spawn_error(cmd: &Command, source: std::io::Error) -> GuestError {
    GuestError::Spawn {
        path: cmd.path.clone(),
        source,
    }
}

/// Feed `data` to the child's stdin on a separate thread, then close it.
fn feed_stdin(stdin: Option<ChildStdin>, data: Vec<u8>) {
    if let Some(mut stdin) = stdin {
        let _ = std::thread::Builder::new()
            .name("stdin".into())
            .spawn(move || {
                let _ = stdin.write_all(&data);
            });
    }
}

/// Run a command to completion with stdout and stderr interleaved.
///
/// A nonzero exit is a value; only failure to start is an error.
pub fn run(cmd: &Command) -> Result<CommandOutput> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    let stderr_end = write_end.try_clone()?;

    let mut proc = build(cmd);
    proc.stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .stdin(if cmd.stdin.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        });

    let spawned = reaper::spawn(&mut proc);
    // The Command holds the pipe's write ends; EOF only arrives once they are gone.
    drop(proc);
    let mut child = spawned.map_err(|e| spawn_error(cmd, e))?;
    feed_stdin(child.stdin.take(), cmd.stdin.clone());

    let mut output = Vec::new();
    File::from(read_end).read_to_end(&mut output)?;
    let status = child.wait();
    reaper::forget(child.id());

    Ok(CommandOutput {
        output,
        exit: exit_code(status?),
    })
}

struct Entry {
    pid: i32,
    /// Taken by the thread that waits on it.
    child: Option<Child>,
}

/// Launched processes by logical name. At most one entry per name.
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
    events: EventSink,
    runtime_dir: PathBuf,
}

impl Registry {
    pub fn new(events: EventSink, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            runtime_dir: runtime_dir.into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn pid_of(&self, name: &str) -> Option<i32> {
        self.lock().get(name).map(|e| e.pid)
    }

    pub fn pids(&self) -> Vec<i32> {
        self.lock().values().map(|e| e.pid).collect()
    }

    /// Start a background process whose output goes to the event stream.
    pub fn launch(&self, cmd: &Command) -> Result<LaunchResponse> {
        self.launch_with_env(cmd, &[])
    }

    fn launch_with_env(&self, cmd: &Command, extra_env: &[(&str, String)]) -> Result<LaunchResponse> {
        if let Some(name) = &cmd.name {
            if self.contains(name) {
                return Err(GuestError::NameInUse(name.clone()));
            }
        }

        let mut proc = build(cmd);
        for (key, value) in extra_env {
            proc.env(key, value);
        }
        proc.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            });
        let mut child = reaper::spawn(&mut proc).map_err(|e| spawn_error(cmd, e))?;
        let pid = child.id() as i32;
        let name = cmd.name.clone().unwrap_or_else(|| pid.to_string());

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut entries = self.lock();
        if entries.contains_key(&name) {
            drop(entries);
            let _ = child.kill();
            let _ = child.wait();
            reaper::forget(child.id());
            return Err(GuestError::NameInUse(name));
        }
        entries.insert(
            name.clone(),
            Entry {
                pid,
                child: Some(child),
            },
        );
        drop(entries);

        feed_stdin(stdin, cmd.stdin.clone());
        if let Some(out) = stdout {
            self.events.pump(name.clone(), out)?;
        }
        if let Some(err) = stderr {
            self.events.pump(name.clone(), err)?;
        }

        kmsg(&format!("launched {} (pid {})", name, pid));
        Ok(LaunchResponse { pid, name })
    }

    /// Launch a command and wait for its readiness notification.
    pub fn launch_service(&self, cmd: &Command, timeout: Duration) -> Result<LaunchOutcome> {
        let label = cmd.name.as_deref().unwrap_or(&cmd.path);
        let notify = NotifySocket::bind(&self.runtime_dir, label)?;
        let socket_path = notify.path().to_string_lossy().into_owned();
        let launched = self.launch_with_env(cmd, &[("NOTIFY_SOCKET", socket_path)])?;

        let readiness = notify.wait(timeout, || self.try_reap(&launched.name))?;
        Ok(match readiness {
            Readiness::Ready => LaunchOutcome::Ready {
                pid: launched.pid,
                name: launched.name,
            },
            Readiness::Exited(exit) => LaunchOutcome::Exited {
                pid: launched.pid,
                exit,
            },
            Readiness::TimedOut => LaunchOutcome::TimedOut {
                pid: launched.pid,
                name: launched.name,
            },
        })
    }

    /// If the named process has exited, remove it and return its exit code.
    pub fn try_reap(&self, name: &str) -> Option<i32> {
        let mut entries = self.lock();
        let status = entries
            .get_mut(name)
            .and_then(|entry| entry.child.as_mut())
            .and_then(|child| child.try_wait().ok().flatten())?;
        if let Some(entry) = entries.remove(name) {
            reaper::forget(entry.pid as u32);
        }
        Some(exit_code(status))
    }

    /// Block until the named process exits, then remove its entry.
    pub fn wait(&self, name: &str) -> Result<i32> {
        let mut child = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| GuestError::UnknownProcess(name.to_string()))?;
            entry.child.take().ok_or_else(|| {
                GuestError::InvalidRequest(format!("{} is already being waited on", name))
            })?
        };
        let status = child.wait();
        reaper::forget(child.id());
        self.lock().remove(name);
        Ok(exit_code(status?))
    }

    /// Forget the named process. It keeps running and is reaped in the background.
    pub fn release(&self, name: &str) -> Result<()> {
        let entry = self
            .lock()
            .remove(name)
            .ok_or_else(|| GuestError::UnknownProcess(name.to_string()))?;
        if let Some(mut child) = entry.child {
            std::thread::Builder::new()
                .name("reaper".into())
                .spawn(move || {
                    let _ = child.wait();
                    reaper::forget(child.id());
                })?;
        }
        Ok(())
    }

    /// Deliver a signal to a launched process by name, or to any PID.
    pub fn signal(&self, req: &SignalRequest) -> Result<()> {
        let signal = Signal::try_from(req.signal)
            .map_err(|_| GuestError::InvalidRequest(format!("bad signal {}", req.signal)))?;
        let (pid, label) = match (&req.service, req.pid) {
            (Some(name), _) => {
                let pid = self
                    .pid_of(name)
                    .ok_or_else(|| GuestError::UnknownProcess(name.clone()))?;
                (pid, name.clone())
            }
            (None, Some(pid)) if pid > 0 => (pid, pid.to_string()),
            (None, _) => {
                return Err(GuestError::InvalidRequest(
                    "signal needs a service name or a positive pid".into(),
                ))
            }
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(GuestError::UnknownProcess(label)),
            Err(e) => Err(e.into()),
        }
    }
}
