//! VzHypervisor: [`Hypervisor`] implementation using Apple's Virtualization.framework.
//!
//! ## Lifecycle
//!
//! 1. `start()`: builds and validates the `VZVirtualMachineConfiguration`,
//!    creates the `VZVirtualMachine` on a dedicated serial queue, installs a
//!    delegate that reports guest-initiated stops, and starts it.
//! 2. `vsock()`: hands out the machine's virtio-socket device.
//! 3. `stop()`: requests a hard stop and releases every ObjC handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use block2::RcBlock;
use dispatch2::{DispatchQueue, DispatchQueueAttr, DispatchRetained};
use objc2::rc::Retained;
use objc2::runtime::{NSObject, NSObjectProtocol, ProtocolObject};
use objc2::{define_class, msg_send, AnyThread, DefinedClass};
use objc2_foundation::NSError;
use objc2_virtualization::*;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{Hypervisor, VmConfiguration, VmState, VsockDevice};
use crate::error::{Error, Result};

use super::config;
use super::vsock::VzVsockDevice;

const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

define_class!(
    // SAFETY: NSObject has no subclassing requirements and the delegate has
    // no Drop impl.
    #[unsafe(super(NSObject))]
    #[name = "BurrowVmDelegate"]
    #[ivars = mpsc::Sender<VmState>]
    struct VmDelegate;

    unsafe impl NSObjectProtocol for VmDelegate {}

    unsafe impl VZVirtualMachineDelegate for VmDelegate {
        #[unsafe(method(guestDidStopVirtualMachine:))]
        fn guest_did_stop(&self, _vm: &VZVirtualMachine) {
            info!("vz: guest stopped the VM");
            let _ = self.ivars().try_send(VmState::Stopped);
        }

        #[unsafe(method(virtualMachine:didStopWithError:))]
        fn did_stop_with_error(&self, _vm: &VZVirtualMachine, err: &NSError) {
            error!("vz: VM stopped with error: {}", err.localizedDescription());
            let _ = self.ivars().try_send(VmState::Error);
        }
    }
);

impl VmDelegate {
    fn new(states: mpsc::Sender<VmState>) -> Retained<Self> {
        let this = Self::alloc().set_ivars(states);
        unsafe { msg_send![super(this), init] }
    }
}

struct Running {
    vm: Retained<VZVirtualMachine>,
    _delegate: Retained<VmDelegate>,
    vsock: Arc<VzVsockDevice>,
}

/// Run a VZ start/stop style call on the queue and wait for its completion.
fn run_on_queue(
    queue: &DispatchRetained<DispatchQueue>,
    vm: &Retained<VZVirtualMachine>,
    timeout: Duration,
    call: fn(&VZVirtualMachine, &block2::DynBlock<dyn Fn(*mut NSError)>),
) -> std::result::Result<(), String> {
    let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

    // Safety: the VM was created on this queue and is only accessed from it.
    let vm_ptr = Retained::as_ptr(vm) as usize;
    queue.exec_async(move || {
        let vm_ref = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
        let tx = Mutex::new(Some(tx));
        let handler = RcBlock::new(move |err: *mut NSError| {
            let result = if err.is_null() {
                Ok(())
            } else {
                Err(unsafe { &*err }.localizedDescription().to_string())
            };
            if let Some(tx) = tx.lock().ok().and_then(|mut tx| tx.take()) {
                let _ = tx.send(result);
            }
        });
        call(vm_ref, &handler);
    });

    rx.recv_timeout(timeout)
        .map_err(|_| format!("timed out after {:?}", timeout))?
}

/// macOS Virtualization.framework hypervisor.
pub struct VzHypervisor {
    /// Dedicated serial dispatch queue for VZ operations.
    queue: DispatchRetained<DispatchQueue>,
    running: Mutex<Option<Running>>,
}

// Safety: ObjC handles live behind the mutex and are only used on the VZ
// queue through raw pointers.
unsafe impl Send for VzHypervisor {}
unsafe impl Sync for VzHypervisor {}

impl Default for VzHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl VzHypervisor {
    pub fn new() -> Self {
        Self {
            queue: DispatchQueue::new("dev.burrow.vz", DispatchQueueAttr::SERIAL),
            running: Mutex::new(None),
        }
    }

    fn boot(&self, config: &VmConfiguration, states: mpsc::Sender<VmState>) -> Result<Running> {
        info!(
            cpus = config.cpus,
            memory_mb = config.memory_bytes / (1024 * 1024),
            disks = config.storage.len(),
            shares = config.shares.len(),
            "vz: starting VM"
        );
        let vm_config = config::build_validated(config)?;

        // VZVirtualMachine requires every operation to happen on the queue
        // it was created with. A private GCD serial queue fires completion
        // handlers without a run loop, which a tokio process does not have.
        let vm = unsafe {
            VZVirtualMachine::initWithConfiguration_queue(
                VZVirtualMachine::alloc(),
                &vm_config,
                &self.queue,
            )
        };
        let delegate = VmDelegate::new(states.clone());
        let vm_ptr = Retained::as_ptr(&vm) as usize;
        let delegate_ptr = Retained::as_ptr(&delegate) as usize;
        self.queue.exec_async(move || {
            let vm_ref = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            let delegate = unsafe { &*(delegate_ptr as *const VmDelegate) };
            unsafe { vm_ref.setDelegate(Some(ProtocolObject::from_ref(delegate))) };
        });

        run_on_queue(&self.queue, &vm, START_TIMEOUT, |vm, handler| unsafe {
            vm.startWithCompletionHandler(handler)
        })
        .map_err(|e| Error::Hypervisor(format!("VM start failed: {}", e)))?;
        info!("vz: VM started");
        let _ = states.try_send(VmState::Running);

        let socket_devices = unsafe { vm.socketDevices() };
        if socket_devices.count() == 0 {
            return Err(Error::Hypervisor("VM has no socket device".into()));
        }
        let socket_device = socket_devices.objectAtIndex(0);
        let socket_device: Retained<VZVirtioSocketDevice> =
            unsafe { Retained::cast_unchecked(socket_device) };

        Ok(Running {
            vm,
            _delegate: delegate,
            vsock: Arc::new(VzVsockDevice::new(socket_device, self.queue.clone())),
        })
    }
}

#[async_trait::async_trait]
impl Hypervisor for VzHypervisor {
    fn validate(&self, config: &VmConfiguration) -> Result<()> {
        config::build_validated(config).map(|_| ())
    }

    async fn start(&self, config: &VmConfiguration) -> Result<mpsc::Receiver<VmState>> {
        let (tx, rx) = mpsc::channel(16);
        // ObjC types are !Send, so the whole setup runs synchronously.
        let running = tokio::task::block_in_place(|| self.boot(config, tx))?;
        let mut slot = self
            .running
            .lock()
            .map_err(|_| Error::Hypervisor("VM handle lock poisoned".into()))?;
        if slot.is_some() {
            return Err(Error::Hypervisor("VM already started".into()));
        }
        *slot = Some(running);
        Ok(rx)
    }

    fn vsock(&self) -> Result<Arc<dyn VsockDevice>> {
        let slot = self
            .running
            .lock()
            .map_err(|_| Error::Hypervisor("VM handle lock poisoned".into()))?;
        match slot.as_ref() {
            Some(running) => Ok(running.vsock.clone()),
            None => Err(Error::VmNotRunning),
        }
    }

    async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .map_err(|_| Error::Hypervisor("VM handle lock poisoned".into()))?
            .take();
        let Some(running) = running else {
            debug!("vz: stop requested with no VM");
            return Ok(());
        };

        tokio::task::block_in_place(|| {
            running.vsock.remove_listeners();
            info!("vz: stopping VM");
            match run_on_queue(&self.queue, &running.vm, STOP_TIMEOUT, |vm, handler| unsafe {
                vm.stopWithCompletionHandler(handler)
            }) {
                Ok(()) => {
                    info!("vz: VM stopped");
                    Ok(())
                }
                Err(e) => {
                    warn!("vz: VM stop error: {}", e);
                    Err(Error::Hypervisor(format!("VM stop failed: {}", e)))
                }
            }
        })
    }
}
