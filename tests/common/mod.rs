//! In-process hypervisor and guest for exercising the full lifecycle
//! without virtualization.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use burrow::backend::{BoxedStream, Hypervisor, VmConfiguration, VmState, VsockDevice, VsockListener};
use burrow::config::{DaemonConfig, DiskConfig, DiskSize, ShareConfig};
use burrow::guest::protocol::{
    ports, read_message, write_message, Command, CommandOutput, EventRecord, InitResponse,
    LaunchOutcome, LaunchServiceRequest, Message, MessageType, Metrics, MkdirRequest,
    MountRequest, Reply, WriteRequest, PROTOCOL_VERSION,
};
use burrow::tunnel::stream::{read_frame, write_frame};
use burrow::{Error, Result};

pub const GUEST_IPV4: &str = "192.168.64.5";

/// Virtio-socket device whose both ends live in this process.
#[derive(Default)]
pub struct LoopbackVsock {
    guest_ports: Mutex<HashMap<u32, mpsc::UnboundedSender<DuplexStream>>>,
    host_ports: Mutex<HashMap<u32, mpsc::Sender<BoxedStream>>>,
}

impl LoopbackVsock {
    /// Guest side of `listen`.
    pub fn guest_listen(&self, port: u32) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.guest_ports.lock().unwrap().insert(port, tx);
        rx
    }

    /// Guest side of `connect`; `None` when the host is not listening.
    pub async fn guest_connect(&self, port: u32) -> Option<DuplexStream> {
        let host = self.host_ports.lock().unwrap().get(&port).cloned()?;
        let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
        host.send(Box::new(host_end)).await.ok()?;
        Some(guest_end)
    }
}

#[async_trait::async_trait]
impl VsockDevice for LoopbackVsock {
    async fn connect(&self, port: u32) -> Result<BoxedStream> {
        let guest = self
            .guest_ports
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .ok_or_else(|| Error::Hypervisor(format!("connection refused on port {}", port)))?;
        let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
        guest
            .send(guest_end)
            .map_err(|_| Error::Hypervisor("guest listener gone".into()))?;
        Ok(Box::new(host_end))
    }

    async fn listen(&self, port: u32) -> Result<VsockListener> {
        let (tx, rx) = mpsc::channel(16);
        self.host_ports.lock().unwrap().insert(port, tx);
        Ok(VsockListener::new(port, rx))
    }
}

/// Knobs for the fake guest and hypervisor.
#[derive(Clone, Default)]
pub struct Behavior {
    pub reject_config: bool,
    pub no_first_state: bool,
    pub fail_init: bool,
    pub fail_mount: Option<String>,
    /// Take the shutdown request but never answer or power off.
    pub ignore_shutdown: bool,
}

pub struct LoopbackHypervisor {
    behavior: Behavior,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub stops: AtomicU32,
    vsock: Mutex<Option<Arc<LoopbackVsock>>>,
}

impl LoopbackHypervisor {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: Arc::new(Mutex::new(Vec::new())),
            stops: AtomicU32::new(0),
            vsock: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn device(&self) -> Arc<LoopbackVsock> {
        self.vsock.lock().unwrap().clone().expect("vm not started")
    }
}

#[async_trait::async_trait]
impl Hypervisor for LoopbackHypervisor {
    fn validate(&self, config: &VmConfiguration) -> Result<()> {
        config.validate()?;
        if self.behavior.reject_config {
            return Err(Error::Hypervisor("configuration rejected".into()));
        }
        Ok(())
    }

    async fn start(&self, _config: &VmConfiguration) -> Result<mpsc::Receiver<VmState>> {
        let (state_tx, state_rx) = mpsc::channel(8);
        let vsock = Arc::new(LoopbackVsock::default());
        let guest = Arc::new(FakeGuest {
            behavior: self.behavior.clone(),
            calls: self.calls.clone(),
            vsock: vsock.clone(),
            state: (!self.behavior.no_first_state).then(|| state_tx.clone()),
        });
        guest.spawn();
        *self.vsock.lock().unwrap() = Some(vsock);
        if !self.behavior.no_first_state {
            state_tx.send(VmState::Running).await.ok();
        }
        Ok(state_rx)
    }

    fn vsock(&self) -> Result<Arc<dyn VsockDevice>> {
        let device = self.vsock.lock().unwrap().clone();
        match device {
            Some(device) => Ok(device),
            None => Err(Error::VmNotRunning),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.vsock.lock().unwrap().take();
        Ok(())
    }
}

struct FakeGuest {
    behavior: Behavior,
    calls: Arc<Mutex<Vec<String>>>,
    vsock: Arc<LoopbackVsock>,
    state: Option<mpsc::Sender<VmState>>,
}

impl FakeGuest {
    fn spawn(self: Arc<Self>) {
        let mut control = self.vsock.guest_listen(ports::CONTROL);
        let mut proxy = self.vsock.guest_listen(ports::STREAM_PROXY);
        let guest = self.clone();
        tokio::spawn(async move {
            while let Some(conn) = control.recv().await {
                tokio::spawn(guest.clone().serve_control(conn));
            }
        });
        tokio::spawn(async move {
            while let Some(conn) = proxy.recv().await {
                tokio::spawn(serve_stream_proxy(conn));
            }
        });
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn serve_control(self: Arc<Self>, mut conn: DuplexStream) {
        loop {
            let Ok(msg) = read_message(&mut conn).await else {
                return;
            };
            let reply = match msg.msg_type {
                MessageType::Ping => {
                    let pong = Message {
                        msg_type: MessageType::Pong,
                        payload: PROTOCOL_VERSION.to_le_bytes().to_vec(),
                    };
                    write_message(&mut conn, &pong).await.unwrap();
                    continue;
                }
                MessageType::Init if self.behavior.fail_init => Reply::err("overlay mount failed"),
                MessageType::Init => {
                    tokio::spawn(send_boot_event(self.vsock.clone()));
                    Reply::ok(&InitResponse {
                        version: PROTOCOL_VERSION,
                        ipv4_address: Some(GUEST_IPV4.into()),
                    })
                    .unwrap()
                }
                MessageType::Mkdir => {
                    let req: MkdirRequest = msg.decode().unwrap();
                    self.record(format!("mkdir {}", req.path));
                    Reply::done()
                }
                MessageType::Mount => {
                    let req: MountRequest = msg.decode().unwrap();
                    self.record(format!("mount {} {} {}", req.fs, req.device, req.target));
                    if self.behavior.fail_mount.as_deref() == Some(req.target.as_str()) {
                        Reply::err("no such device")
                    } else {
                        Reply::done()
                    }
                }
                MessageType::Write => {
                    let req: WriteRequest = msg.decode().unwrap();
                    self.record(format!("write {}", req.path));
                    Reply::done()
                }
                MessageType::Run => {
                    let cmd: Command = msg.decode().unwrap();
                    self.record(format!("run {} {}", cmd.path, cmd.args.join(" ")));
                    Reply::ok(&CommandOutput {
                        output: Vec::new(),
                        exit: 0,
                    })
                    .unwrap()
                }
                MessageType::LaunchService => {
                    let req: LaunchServiceRequest = msg.decode().unwrap();
                    let name = req.command.name.unwrap_or_default();
                    self.record(format!("launch-service {}", name));
                    Reply::ok(&LaunchOutcome::Ready { pid: 42, name }).unwrap()
                }
                MessageType::Metrics => Reply::ok(&Metrics {
                    uptime_secs: Some(12.5),
                    processes: Some(3),
                    ..Default::default()
                })
                .unwrap(),
                MessageType::Shutdown if self.behavior.ignore_shutdown => {
                    self.record("shutdown".into());
                    // Hold the connection until the host gives up on it.
                    let _ = read_message(&mut conn).await;
                    return;
                }
                MessageType::Shutdown => {
                    self.record("shutdown".into());
                    let done = Message::json(MessageType::Reply, &Reply::done()).unwrap();
                    write_message(&mut conn, &done).await.unwrap();
                    if let Some(state) = &self.state {
                        state.send(VmState::Stopped).await.ok();
                    }
                    return;
                }
                other => Reply::err(format!("unsupported {:?}", other)),
            };
            let reply = Message::json(MessageType::Reply, &reply).unwrap();
            if write_message(&mut conn, &reply).await.is_err() {
                return;
            }
        }
    }
}

async fn send_boot_event(vsock: Arc<LoopbackVsock>) {
    let Some(mut conn) = vsock.guest_connect(ports::EVENTS).await else {
        return;
    };
    let record = EventRecord {
        subsystem: "init".into(),
        data: b"guest ready\n".to_vec(),
    };
    let msg = Message::json(MessageType::EventRecord, &record).unwrap();
    write_message(&mut conn, &msg).await.ok();
    conn.flush().await.ok();
}

/// Stream proxy that refuses port 81 and echoes everything else.
async fn serve_stream_proxy(mut conn: DuplexStream) {
    let Ok(target) = read_frame(&mut conn).await else {
        return;
    };
    if target.ends_with(":81") {
        write_frame(&mut conn, "connection refused").await.ok();
        return;
    }
    if write_frame(&mut conn, "").await.is_err() {
        return;
    }
    let (mut reader, mut writer) = tokio::io::split(conn);
    tokio::io::copy(&mut reader, &mut writer).await.ok();
}

/// Kernel, root image, one data disk and one share under `dir`.
pub fn daemon_config(dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.state_dir = Some(dir.join("state"));
    config.vm.kernel = dir.join("vmlinux");
    config.vm.root_image = dir.join("root.img");
    std::fs::write(&config.vm.kernel, b"kernel").unwrap();
    std::fs::write(&config.vm.root_image, b"root").unwrap();

    let host = dir.join("host");
    std::fs::create_dir_all(&host).unwrap();
    config.vm.shares.push(ShareConfig {
        tag: "host".into(),
        host_path: host,
        mountpoint: "/mnt/host".into(),
        read_only: false,
    });
    config.vm.disks.push(DiskConfig {
        image: dir.join("data.img"),
        mountpoint: "/var/lib/containerd".into(),
        fs_type: "ext4".into(),
        label: None,
        size: DiskSize::Fixed(4 * 1024 * 1024),
    });
    config
}
