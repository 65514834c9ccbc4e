//! VM lifecycle controller.
//!
//! A [`VirtualMachine`] owns one hypervisor instance for the life of the
//! daemon. [`VirtualMachine::start`] walks it from configuration to a guest
//! with every disk and share mounted; [`VirtualMachine::shutdown`] tears it
//! down again. Each start step wraps its error with the step name and
//! nothing is retried.

pub mod config;
pub mod disk;
pub mod events;
pub mod init_actions;
pub mod lifecycle;
pub mod mounts;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Hypervisor, VmState, VsockDevice};
use crate::config::{Arch, DaemonConfig};
use crate::error::{Error, Result};
use crate::guest::protocol::{ports, EventRecord, InitRequest, LaunchOutcome, Metrics};
use crate::guest::GuestClient;
use crate::state::{DaemonState, StateStore};
use crate::tunnel::{timesync, TunnelClient};

use self::disk::{ExtSuperblock, FilesystemIdentifier};
use self::init_actions::InitAction;
use self::lifecycle::{Lifecycle, Phase};
use self::mounts::{Mount, MountExecutor};

pub use self::lifecycle::Phase as VmPhase;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";

pub struct VirtualMachine {
    config: DaemonConfig,
    hypervisor: Arc<dyn Hypervisor>,
    store: StateStore,
    identifier: Box<dyn FilesystemIdentifier>,
    host_arch: Arch,
    lifecycle: Lifecycle,
    mounts: Vec<Mount>,
    init_actions: Vec<InitAction>,
    started: bool,
    vm_state: watch::Receiver<Option<VmState>>,
    vsock: Option<Arc<dyn VsockDevice>>,
    client: Option<Arc<GuestClient>>,
    tasks: Vec<JoinHandle<()>>,
    events: broadcast::Sender<EventRecord>,
    metrics: Mutex<Option<Metrics>>,
}

impl VirtualMachine {
    /// Load persisted state and prepare a machine that has not booted yet.
    pub fn new(config: DaemonConfig, hypervisor: Arc<dyn Hypervisor>) -> Result<Self> {
        let store = StateStore::open(&config.state_dir())?;
        let (events, _) = broadcast::channel(events::EVENT_BACKLOG);
        let (_, vm_state) = watch::channel(None);
        Ok(Self {
            config,
            hypervisor,
            store,
            identifier: Box::new(ExtSuperblock),
            host_arch: Arch::host(),
            lifecycle: Lifecycle::new(),
            mounts: Vec::new(),
            init_actions: Vec::new(),
            started: false,
            vm_state,
            vsock: None,
            client: None,
            tasks: Vec::new(),
            events,
            metrics: Mutex::new(None),
        })
    }

    pub fn with_identifier(mut self, identifier: Box<dyn FilesystemIdentifier>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_host_arch(mut self, arch: Arch) -> Self {
        self.host_arch = arch;
        self
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.lifecycle.subscribe()
    }

    pub fn state(&self) -> &StateStore {
        &self.store
    }

    /// Mounts registered for the next start, in registration order.
    pub fn pending_mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    pub fn client(&self) -> Result<Arc<GuestClient>> {
        self.client.clone().ok_or(Error::VmNotRunning)
    }

    pub fn tunnel(&self) -> Result<TunnelClient> {
        self.vsock
            .clone()
            .map(TunnelClient::new)
            .ok_or(Error::VmNotRunning)
    }

    /// Boot the VM and bring the guest to [`Phase::Ready`].
    ///
    /// On failure everything started so far is torn down and the machine
    /// ends in [`Phase::Stopped`].
    pub async fn start(&mut self) -> Result<()> {
        let phase = self.phase();
        if phase != Phase::Creating {
            return Err(Error::InvalidTransition {
                from: phase,
                to: Phase::Booting,
            });
        }
        match self.boot().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("vm start failed: {}", e);
                if let Err(stop) = self.release().await {
                    warn!("cleanup after failed start: {}", stop);
                }
                let _ = self.lifecycle.advance(Phase::Stopped);
                Err(e)
            }
        }
    }

    async fn boot(&mut self) -> Result<()> {
        let identity = self
            .store
            .ensure_identity()
            .map_err(Error::at("load identity"))?;
        let plan = config::plan(&self.config.vm, &identity, self.host_arch)
            .map_err(Error::at("build configuration"))?;
        self.mounts = plan.mounts;
        self.init_actions = plan.init_actions;

        if let Err(e) = self.hypervisor.validate(&plan.configuration) {
            self.mounts.clear();
            self.init_actions.clear();
            return Err(Error::at("validate configuration")(e));
        }

        self.lifecycle.advance(Phase::Booting)?;
        let mut states = self
            .hypervisor
            .start(&plan.configuration)
            .await
            .map_err(Error::at("start vm"))?;
        self.started = true;
        match states.recv().await {
            Some(VmState::Running) => info!("vm running"),
            Some(other) => {
                return Err(Error::at("start vm")(Error::Hypervisor(format!(
                    "vm reported {:?} instead of running",
                    other
                ))))
            }
            None => {
                return Err(Error::at("start vm")(Error::Hypervisor(
                    "state channel closed before the first state".into(),
                )))
            }
        }
        self.watch_vm_state(states);

        let vsock = self.hypervisor.vsock().map_err(Error::at("open vsock"))?;
        self.vsock = Some(vsock.clone());

        let event_listener = vsock
            .listen(ports::EVENTS)
            .await
            .map_err(Error::at("listen for events"))?;
        self.tasks
            .push(tokio::spawn(events::consume(event_listener, self.events.clone())));
        let timesync_listener = vsock
            .listen(ports::TIMESYNC)
            .await
            .map_err(Error::at("listen for clock sync"))?;
        self.tasks.push(tokio::spawn(timesync::serve(timesync_listener)));

        self.lifecycle.advance(Phase::AwaitingGuestHandshake)?;
        let handshake = self.config.timeouts.handshake;
        let client = GuestClient::connect(vsock, handshake)
            .await
            .map_err(Error::at("connect control channel"))?;
        let client = Arc::new(client);
        self.client = Some(client.clone());

        let request = InitRequest {
            overlay_size_mb: self.config.vm.overlay_size_mb,
            sysctls: self.config.vm.sysctls.clone(),
        };
        let init = tokio::time::timeout(handshake, client.init(&request))
            .await
            .map_err(|_| Error::Timeout(format!("no init reply within {:?}", handshake)))
            .and_then(|r| r)
            .map_err(Error::at("init handshake"))?;
        info!(
            version = init.version,
            ipv4 = init.ipv4_address.as_deref().unwrap_or("-"),
            "guest initialized"
        );

        self.lifecycle.advance(Phase::Mounting)?;
        let mounts = std::mem::take(&mut self.mounts);
        MountExecutor::new(client.as_ref(), self.identifier.as_ref())
            .execute(mounts)
            .await
            .map_err(Error::at("mount"))?;

        let actions = std::mem::take(&mut self.init_actions);
        init_actions::run_init_actions(client.as_ref(), &actions)
            .await
            .map_err(Error::at("init actions"))?;

        self.store
            .update(&DaemonState {
                status: STATUS_RUNNING.into(),
                ipv4_address: init.ipv4_address.unwrap_or_default(),
                ..Default::default()
            })
            .map_err(Error::at("persist state"))?;
        self.lifecycle.advance(Phase::Ready)?;
        Ok(())
    }

    fn watch_vm_state(&mut self, mut states: mpsc::Receiver<VmState>) {
        let (tx, rx) = watch::channel(Some(VmState::Running));
        self.vm_state = rx;
        self.tasks.push(tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                match state {
                    VmState::Stopped => info!("vm stopped"),
                    VmState::Error => warn!("vm stopped with an error"),
                    other => debug!(state = ?other, "vm state"),
                }
                let _ = tx.send(Some(state));
            }
        }));
    }

    fn guest_stopped(&self) -> bool {
        matches!(
            *self.vm_state.borrow(),
            Some(VmState::Stopped) | Some(VmState::Error)
        )
    }

    /// Drop every host-side resource tied to the running VM.
    async fn release(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.client = None;
        self.vsock = None;
        if !std::mem::take(&mut self.started) {
            return Ok(());
        }
        match self.hypervisor.stop().await {
            Err(e) if self.guest_stopped() => {
                debug!("hypervisor stop after guest power-off: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// Ask the guest to power off, then stop the VM regardless.
    ///
    /// Calling it again once stopped is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.phase() >= Phase::Stopping {
            return Ok(());
        }
        self.lifecycle.advance(Phase::Stopping)?;

        if let Some(client) = self.client.clone() {
            let limit = self.config.timeouts.shutdown;
            match tokio::time::timeout(limit, client.shutdown()).await {
                Ok(Ok(())) => {
                    info!("guest acknowledged shutdown");
                    self.wait_for_power_off(limit).await;
                }
                Ok(Err(e)) => warn!("guest shutdown failed: {}", e),
                Err(_) => warn!("guest shutdown timed out after {:?}", limit),
            }
        }

        let result = self.release().await;
        if let Err(e) = self.store.update(&DaemonState {
            status: STATUS_STOPPED.into(),
            ..Default::default()
        }) {
            warn!("failed to persist stopped state: {}", e);
        }
        self.lifecycle.advance(Phase::Stopped)?;
        result
    }

    async fn wait_for_power_off(&self, limit: Duration) {
        let mut rx = self.vm_state.clone();
        let stopped = rx.wait_for(|s| matches!(s, Some(VmState::Stopped) | Some(VmState::Error)));
        if tokio::time::timeout(limit, stopped).await.is_err() {
            debug!("guest did not power off within {:?}", limit);
        }
    }

    /// Launch the configured container runtime and wait for its readiness.
    pub async fn launch_container_runtime(&self) -> Result<LaunchOutcome> {
        let client = self.client()?;
        let runtime = &self.config.runtime;
        let outcome = client
            .launch_service(&runtime.command(), self.config.timeouts.service_ready)
            .await?;
        match &outcome {
            LaunchOutcome::Ready { pid, name } => info!(pid, name = %name, "runtime ready"),
            LaunchOutcome::Exited { pid, exit } => {
                warn!(pid, exit, runtime = %runtime.name, "runtime exited before ready")
            }
            LaunchOutcome::TimedOut { pid, name } => {
                warn!(pid, name = %name, "runtime not ready in time")
            }
        }
        Ok(outcome)
    }

    /// Fetch fresh guest metrics and keep them as the latest snapshot.
    pub async fn refresh_metrics(&self) -> Result<Metrics> {
        let metrics = self.client()?.metrics(&[]).await?;
        *self
            .metrics
            .lock()
            .map_err(|_| Error::State("metrics lock poisoned".into()))? = Some(metrics.clone());
        Ok(metrics)
    }

    pub fn metrics_snapshot(&self) -> Option<Metrics> {
        self.metrics.lock().ok().and_then(|m| m.clone())
    }
}
