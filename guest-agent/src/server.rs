//! Control-port request dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use burrow_protocol::{
    ExecStart, InitRequest, InitResponse, LaunchServiceRequest, Message, MessageType,
    MetricsRequest, MkdirRequest, MountRequest, ProtocolError, Reply, ServiceRequest,
    SignalRequest, SysctlRequest, WaitResponse, WriteRequest, PROTOCOL_VERSION,
};
use serde::Serialize;

use crate::conn::Connection;
use crate::error::{GuestError, Result};
use crate::events::EventSink;
use crate::process::{self, Registry};
use crate::{exec, fs, kmsg, metrics, system};

/// Where the agent finds the system and how long it waits on it.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Whether `Init` may mount the overlay (only when running as PID 1).
    pub manage_system: bool,
    /// Directory for readiness sockets.
    pub runtime_dir: PathBuf,
    pub proc_root: PathBuf,
    pub sysctl_root: PathBuf,
    /// How long `Init` waits for the primary interface to get an address.
    pub address_wait: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            manage_system: true,
            runtime_dir: PathBuf::from("/run/burrow"),
            proc_root: PathBuf::from("/proc"),
            sysctl_root: PathBuf::from("/proc/sys"),
            address_wait: Duration::from_secs(10),
        }
    }
}

/// Shared state for all control connections.
pub struct Agent {
    config: AgentConfig,
    registry: Registry,
    on_shutdown: Box<dyn Fn() + Send + Sync>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        events: EventSink,
        on_shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let registry = Registry::new(events, config.runtime_dir.clone());
        Self {
            config,
            registry,
            on_shutdown: Box::new(on_shutdown),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn init(&self, req: InitRequest) -> Result<InitResponse> {
        fs::apply_sysctls(&self.config.sysctl_root, &req.sysctls)?;
        if self.config.manage_system {
            system::configure_overlay(req.overlay_size_mb)?;
        }
        let ipv4_address = system::primary_ipv4(self.config.address_wait).map(|ip| ip.to_string());
        kmsg(&format!("init complete (ipv4={:?})", ipv4_address));
        Ok(InitResponse {
            version: PROTOCOL_VERSION,
            ipv4_address,
        })
    }

    /// Handle one request and build its reply.
    fn dispatch(&self, msg: &Message) -> Result<Reply> {
        match msg.msg_type {
            MessageType::Init => reply(self.init(msg.decode()?)),
            MessageType::Write => reply(fs::write(&msg.decode::<WriteRequest>()?)),
            MessageType::Mkdir => reply(fs::mkdir(&msg.decode::<MkdirRequest>()?)),
            MessageType::Mount => reply(fs::mount(&msg.decode::<MountRequest>()?)),
            MessageType::Run => reply(process::run(&msg.decode()?)),
            MessageType::Launch => reply(self.registry.launch(&msg.decode()?)),
            MessageType::LaunchService => {
                let req: LaunchServiceRequest = msg.decode()?;
                reply(
                    self.registry
                        .launch_service(&req.command, Duration::from_millis(req.timeout_ms)),
                )
            }
            MessageType::Wait => {
                let req: ServiceRequest = msg.decode()?;
                reply(self.registry.wait(&req.name).map(|exit| WaitResponse { exit }))
            }
            MessageType::Release => {
                let req: ServiceRequest = msg.decode()?;
                reply(self.registry.release(&req.name))
            }
            MessageType::Signal => reply(self.registry.signal(&msg.decode::<SignalRequest>()?)),
            MessageType::Sysctl => {
                let req: SysctlRequest = msg.decode()?;
                reply(fs::apply_sysctls(&self.config.sysctl_root, &req.values))
            }
            MessageType::Metrics => {
                let req: MetricsRequest = if msg.payload.is_empty() {
                    MetricsRequest::default()
                } else {
                    msg.decode()?
                };
                reply(Ok(metrics::collect(&self.config.proc_root, &req.names)))
            }
            other => Ok(Reply::err(format!("unexpected message {:?}", other))),
        }
    }
}

fn reply<T: Serialize>(result: Result<T>) -> Result<Reply> {
    match result {
        Ok(value) => Ok(Reply::ok(&value)?),
        Err(e) => Ok(Reply::err(e.to_string())),
    }
}

fn write_reply<C: Connection>(conn: &mut C, reply: &Reply) -> Result<()> {
    Message::json(MessageType::Reply, reply)?.write_to_sync(conn)?;
    Ok(())
}

/// Serve a control connection until the host closes it.
pub fn handle_connection<C: Connection>(mut conn: C, agent: Arc<Agent>) -> Result<()> {
    loop {
        let msg = match Message::read_from_sync(&mut conn) {
            Ok(msg) => msg,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };

        match msg.msg_type {
            MessageType::Ping => {
                let peer = (msg.payload.len() >= 4).then(|| {
                    u32::from_le_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]])
                });
                Message {
                    msg_type: MessageType::Pong,
                    payload: PROTOCOL_VERSION.to_le_bytes().to_vec(),
                }
                .write_to_sync(&mut conn)?;
                if peer != Some(PROTOCOL_VERSION) {
                    kmsg(&format!(
                        "host protocol version {:?} differs from ours ({})",
                        peer, PROTOCOL_VERSION
                    ));
                }
            }
            MessageType::ExecStart => {
                let start: ExecStart = msg.decode()?;
                return exec::run_session(conn, start);
            }
            MessageType::Shutdown => {
                write_reply(&mut conn, &Reply::done())?;
                (agent.on_shutdown)();
                return Ok(());
            }
            _ => {
                let reply = agent.dispatch(&msg).unwrap_or_else(|e| match e {
                    GuestError::Protocol(e) => Reply::err(format!("malformed request: {}", e)),
                    other => Reply::err(other.to_string()),
                });
                write_reply(&mut conn, &reply)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::{Command, CommandOutput, LaunchResponse, Metrics};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        host: UnixStream,
        shutdown: Arc<AtomicBool>,
        dir: tempfile::TempDir,
    }

    fn serve() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            manage_system: false,
            runtime_dir: dir.path().join("run"),
            proc_root: PathBuf::from("/proc"),
            sysctl_root: dir.path().join("sys"),
            address_wait: Duration::ZERO,
        };
        let (events, _rx) = EventSink::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let agent = Arc::new(Agent::new(config, events, move || {
            flag.store(true, Ordering::SeqCst)
        }));
        let (host, guest) = UnixStream::pair().unwrap();
        std::thread::spawn(move || handle_connection(guest, agent));
        Harness {
            host,
            shutdown,
            dir,
        }
    }

    fn call<T: Serialize>(host: &mut UnixStream, ty: MessageType, body: &T) -> Reply {
        Message::json(ty, body).unwrap().write_to_sync(host).unwrap();
        let msg = Message::read_from_sync(host).unwrap();
        assert_eq!(msg.msg_type, MessageType::Reply);
        msg.decode().unwrap()
    }

    #[test]
    fn ping_answers_with_version() {
        let mut h = serve();
        Message {
            msg_type: MessageType::Ping,
            payload: PROTOCOL_VERSION.to_le_bytes().to_vec(),
        }
        .write_to_sync(&mut h.host)
        .unwrap();
        let pong = Message::read_from_sync(&mut h.host).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.payload, PROTOCOL_VERSION.to_le_bytes());
    }

    #[test]
    fn run_reports_exit_as_value() {
        let mut h = serve();
        let cmd = Command::new("/bin/sh").args(["-c", "printf hi; exit 7"]);
        let out: CommandOutput = call(&mut h.host, MessageType::Run, &cmd)
            .into_result()
            .unwrap()
            .unwrap();
        assert_eq!(out.exit, 7);
        assert_eq!(out.output, b"hi");
    }

    #[test]
    fn run_missing_binary_is_an_error_reply() {
        let mut h = serve();
        let reply = call(&mut h.host, MessageType::Run, &Command::new("/no/such/binary"));
        let err = reply.into_result::<CommandOutput>().unwrap().unwrap_err();
        assert!(err.contains("/no/such/binary"));
    }

    #[test]
    fn launch_and_wait_over_the_wire() {
        let mut h = serve();
        let cmd = Command::new("/bin/sh").args(["-c", "exit 2"]).name("task");
        let launched: LaunchResponse = call(&mut h.host, MessageType::Launch, &cmd)
            .into_result()
            .unwrap()
            .unwrap();
        assert!(launched.pid > 0);
        let waited: WaitResponse = call(
            &mut h.host,
            MessageType::Wait,
            &ServiceRequest {
                name: "task".into(),
            },
        )
        .into_result()
        .unwrap()
        .unwrap();
        assert_eq!(waited.exit, 2);
    }

    #[test]
    fn malformed_body_gets_error_reply_and_connection_survives() {
        let mut h = serve();
        let reply = call(&mut h.host, MessageType::Mkdir, &"not an object");
        assert!(reply.error.unwrap().contains("malformed request"));
        let metrics: Metrics = call(
            &mut h.host,
            MessageType::Metrics,
            &MetricsRequest {
                names: vec!["uptime".into()],
            },
        )
        .into_result()
        .unwrap()
        .unwrap();
        assert!(metrics.memory.is_none());
    }

    #[test]
    fn init_applies_sysctls() {
        let mut h = serve();
        let sys = h.dir.path().join("sys/vm");
        std::fs::create_dir_all(&sys).unwrap();
        let mut req = InitRequest::default();
        req.sysctls.insert("vm.overcommit_memory".into(), "1".into());
        let resp: InitResponse = call(&mut h.host, MessageType::Init, &req)
            .into_result()
            .unwrap()
            .unwrap();
        assert_eq!(resp.version, PROTOCOL_VERSION);
        assert_eq!(
            std::fs::read_to_string(sys.join("overcommit_memory")).unwrap(),
            "1\n"
        );
    }

    #[test]
    fn shutdown_replies_then_fires_hook() {
        let mut h = serve();
        Message::empty(MessageType::Shutdown)
            .write_to_sync(&mut h.host)
            .unwrap();
        let reply: Reply = Message::read_from_sync(&mut h.host)
            .unwrap()
            .decode()
            .unwrap();
        assert!(reply.error.is_none());
        for _ in 0..100 {
            if h.shutdown.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("shutdown hook never ran");
    }
}
