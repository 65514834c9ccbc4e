//! Control-protocol client.
//!
//! One [`GuestClient`] owns one control connection and issues one request
//! at a time over it. Interactive exec sessions get their own connections.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{BoxedStream, VsockDevice};
use crate::error::{Error, Result};
use crate::guest::exec::ExecSession;
use crate::guest::protocol::{
    ports, read_message, write_message, Command, CommandOutput, InitRequest, InitResponse,
    LaunchOutcome, LaunchResponse, LaunchServiceRequest, Message, MessageType, Metrics,
    MetricsRequest, MkdirRequest, MountRequest, Reply, ServiceRequest, SignalRequest,
    SysctlRequest, WaitResponse, WriteRequest, PROTOCOL_VERSION,
};

/// How long one Ping/Pong exchange may take once connected.
const HANDSHAKE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connect to the guest control port and perform a Ping/Pong handshake,
/// retrying until `deadline` elapses. Returns the stream and the guest's
/// protocol version.
pub async fn connect_with_handshake(
    device: &dyn VsockDevice,
    deadline: Duration,
    context: &str,
) -> Result<(BoxedStream, u32)> {
    let mut delay = Duration::from_millis(100);
    let deadline = Instant::now() + deadline;
    let mut attempt: u32 = 0;

    loop {
        if Instant::now() >= deadline {
            warn!(
                "guest_client[{context}]: deadline reached after {} connect/handshake attempts",
                attempt
            );
            return Err(Error::Timeout(format!(
                "guest control handshake ({context}) after {} attempts",
                attempt
            )));
        }
        attempt += 1;

        let mut stream = match device.connect(ports::CONTROL).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(
                    "guest_client[{context}]: attempt {} connect failed: {} (retry in {:?})",
                    attempt, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
                continue;
            }
        };

        let ping = Message {
            msg_type: MessageType::Ping,
            payload: PROTOCOL_VERSION.to_le_bytes().to_vec(),
        };
        let exchange = async {
            write_message(&mut stream, &ping).await?;
            read_message(&mut stream).await
        };
        match tokio::time::timeout(HANDSHAKE_ATTEMPT_TIMEOUT, exchange).await {
            Ok(Ok(msg)) if msg.msg_type == MessageType::Pong => {
                let peer_version = match msg.payload.get(..4) {
                    Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                    None => 0,
                };
                if peer_version != PROTOCOL_VERSION {
                    warn!(
                        peer_version,
                        "guest_client[{context}]: guest speaks a different protocol version"
                    );
                }
                debug!(
                    "guest_client[{context}]: handshake OK after {} attempt(s) (peer_version={})",
                    attempt, peer_version
                );
                return Ok((stream, peer_version));
            }
            Ok(Ok(msg)) => debug!(
                "guest_client[{context}]: attempt {} unexpected handshake message: {:?}",
                attempt, msg.msg_type
            ),
            Ok(Err(e)) => debug!(
                "guest_client[{context}]: attempt {} handshake failed: {}",
                attempt, e
            ),
            Err(_) => debug!(
                "guest_client[{context}]: attempt {} handshake timed out",
                attempt
            ),
        }
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
    }
}

/// Client for the guest control protocol.
pub struct GuestClient {
    device: Arc<dyn VsockDevice>,
    conn: Mutex<Option<BoxedStream>>,
    peer_version: u32,
    handshake_deadline: Duration,
}

impl GuestClient {
    /// Open the control connection, retrying until the guest answers.
    pub async fn connect(device: Arc<dyn VsockDevice>, deadline: Duration) -> Result<Self> {
        let (conn, peer_version) =
            connect_with_handshake(device.as_ref(), deadline, "control").await?;
        Ok(Self {
            device,
            conn: Mutex::new(Some(conn)),
            peer_version,
            handshake_deadline: deadline,
        })
    }

    pub fn peer_version(&self) -> u32 {
        self.peer_version
    }

    async fn call<Req, Resp>(&self, msg_type: MessageType, body: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request = Message::json(msg_type, body)?;
        self.roundtrip(request).await
    }

    async fn roundtrip<Resp: DeserializeOwned>(&self, request: Message) -> Result<Resp> {
        let msg_type = request.msg_type;
        let mut slot = self.conn.lock().await;
        // Taken for the duration of the call: a call that is cancelled or
        // fails midway drops the connection, and the next one reconnects.
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!("guest_client[control]: reconnecting for {:?}", msg_type);
                connect_with_handshake(self.device.as_ref(), self.handshake_deadline, "control")
                    .await?
                    .0
            }
        };
        write_message(&mut conn, &request).await?;
        let response = read_message(&mut conn).await?;
        *slot = Some(conn);
        drop(slot);

        if response.msg_type != MessageType::Reply {
            return Err(Error::Guest(format!(
                "unexpected {:?} in reply to {:?}",
                response.msg_type, msg_type
            )));
        }
        let reply: Reply = response.decode()?;
        reply.into_result()?.map_err(Error::Guest)
    }

    /// Post-boot handshake: apply sysctls, mount the overlay, report the
    /// guest's protocol version and primary IPv4 address.
    pub async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        self.call(MessageType::Init, request).await
    }

    /// Atomically replace `path` with `data`, creating parent directories.
    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.write_with_mode(path, data, None).await
    }

    pub async fn write_with_mode(&self, path: &str, data: &[u8], mode: Option<u32>) -> Result<()> {
        let request = WriteRequest {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
        };
        self.call(MessageType::Write, &request).await
    }

    /// `mkdir -p`.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let request = MkdirRequest {
            path: path.to_string(),
        };
        self.call(MessageType::Mkdir, &request).await
    }

    pub async fn mount(&self, request: &MountRequest) -> Result<()> {
        self.call(MessageType::Mount, request).await
    }

    /// Run to completion. A non-zero exit is returned as a value.
    pub async fn run(&self, command: &Command) -> Result<CommandOutput> {
        self.call(MessageType::Run, command).await
    }

    /// Start a background process. Its output goes to the event stream
    /// under the command's name.
    pub async fn launch(&self, command: &Command) -> Result<LaunchResponse> {
        self.call(MessageType::Launch, command).await
    }

    /// Launch and wait for `READY=1` on the process's notify socket.
    pub async fn launch_service(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<LaunchOutcome> {
        let request = LaunchServiceRequest {
            command: command.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.call(MessageType::LaunchService, &request).await
    }

    /// Block until the named process exits and return its exit code.
    pub async fn wait(&self, name: &str) -> Result<i32> {
        let request = ServiceRequest {
            name: name.to_string(),
        };
        let response: WaitResponse = self.call(MessageType::Wait, &request).await?;
        Ok(response.exit)
    }

    /// Stop tracking the named process; it keeps running.
    pub async fn release(&self, name: &str) -> Result<()> {
        let request = ServiceRequest {
            name: name.to_string(),
        };
        self.call(MessageType::Release, &request).await
    }

    pub async fn signal_pid(&self, pid: i32, signal: i32) -> Result<()> {
        let request = SignalRequest {
            pid: Some(pid),
            service: None,
            signal,
        };
        self.call(MessageType::Signal, &request).await
    }

    pub async fn signal_service(&self, name: &str, signal: i32) -> Result<()> {
        let request = SignalRequest {
            pid: None,
            service: Some(name.to_string()),
            signal,
        };
        self.call(MessageType::Signal, &request).await
    }

    pub async fn sysctl(&self, values: BTreeMap<String, String>) -> Result<()> {
        self.call(MessageType::Sysctl, &SysctlRequest { values }).await
    }

    /// Collect the named metric groups; an empty list means all of them.
    pub async fn metrics(&self, names: &[&str]) -> Result<Metrics> {
        let request = MetricsRequest {
            names: names.iter().map(|n| n.to_string()).collect(),
        };
        self.call(MessageType::Metrics, &request).await
    }

    /// Ask the guest to stop every process and power off.
    pub async fn shutdown(&self) -> Result<()> {
        self.roundtrip(Message::empty(MessageType::Shutdown)).await
    }

    /// Start an interactive process on a fresh connection.
    pub async fn exec(&self, command: Command) -> Result<ExecSession> {
        let (stream, _) =
            connect_with_handshake(self.device.as_ref(), self.handshake_deadline, "exec").await?;
        ExecSession::start(stream, command).await
    }
}
