//! VZ virtio-socket adapter.
//!
//! `VZVirtioSocketConnection.fileDescriptor()` is owned by the ObjC
//! connection object, so every fd is `dup`'d before the connection is
//! released and then wrapped in a tokio `UnixStream`. Host-side listening
//! goes through a `VZVirtioSocketListener` whose delegate forwards accepted
//! fds into a channel.

use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use block2::RcBlock;
use dispatch2::{DispatchQueue, DispatchRetained};
use objc2::rc::Retained;
use objc2::runtime::{NSObject, NSObjectProtocol, ProtocolObject};
use objc2::{define_class, msg_send, AnyThread, DefinedClass};
use objc2_foundation::NSError;
use objc2_virtualization::*;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::{BoxedStream, VsockDevice, VsockListener};
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending accepted connections per listening port.
const ACCEPT_BACKLOG: usize = 16;

/// Wrap a dup'd connection fd in a tokio stream. Takes ownership of `fd`.
pub fn stream_from_fd(fd: RawFd) -> io::Result<tokio::net::UnixStream> {
    // Safety: the caller hands over a freshly dup'd descriptor.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(stream)
}

fn dup_connection_fd(connection: &VZVirtioSocketConnection) -> std::result::Result<RawFd, String> {
    let raw_fd = unsafe { connection.fileDescriptor() };
    let duped = unsafe { libc::dup(raw_fd) };
    if duped < 0 {
        return Err(format!("dup fd failed: {}", io::Error::last_os_error()));
    }
    Ok(duped)
}

struct ListenerIvars {
    port: u32,
    accepted: mpsc::Sender<RawFd>,
}

define_class!(
    // SAFETY: NSObject has no subclassing requirements and the delegate has
    // no Drop impl.
    #[unsafe(super(NSObject))]
    #[name = "BurrowVsockListenerDelegate"]
    #[ivars = ListenerIvars]
    struct ListenerDelegate;

    unsafe impl NSObjectProtocol for ListenerDelegate {}

    unsafe impl VZVirtioSocketListenerDelegate for ListenerDelegate {
        #[unsafe(method(listener:shouldAcceptNewConnection:fromSocketDevice:))]
        fn should_accept(
            &self,
            _listener: &VZVirtioSocketListener,
            connection: &VZVirtioSocketConnection,
            _device: &VZVirtioSocketDevice,
        ) -> bool {
            let ivars = self.ivars();
            let fd = match dup_connection_fd(connection) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(port = ivars.port, "vz vsock accept: {}", e);
                    return false;
                }
            };
            if ivars.accepted.try_send(fd).is_err() {
                warn!(port = ivars.port, "vz vsock accept: listener gone or backlog full");
                unsafe { libc::close(fd) };
                return false;
            }
            debug!(port = ivars.port, fd, "vz vsock: accepted guest connection");
            true
        }
    }
);

impl ListenerDelegate {
    fn new(port: u32, accepted: mpsc::Sender<RawFd>) -> Retained<Self> {
        let this = Self::alloc().set_ivars(ListenerIvars { port, accepted });
        unsafe { msg_send![super(this), init] }
    }
}

/// Keeps a listener and its (weakly referenced) delegate alive.
struct Registration {
    listener: Retained<VZVirtioSocketListener>,
    delegate: Retained<ListenerDelegate>,
}

// Safety: only released, or read for the port ivar, off the VZ queue.
unsafe impl Send for Registration {}

/// [`VsockDevice`] backed by the VM's `VZVirtioSocketDevice`.
pub struct VzVsockDevice {
    device: Retained<VZVirtioSocketDevice>,
    queue: DispatchRetained<DispatchQueue>,
    registrations: Mutex<Vec<Registration>>,
}

// Safety: the device and registrations are only touched on the VZ queue
// (via raw pointers passed into `exec_async`) or under the mutex.
unsafe impl Send for VzVsockDevice {}
unsafe impl Sync for VzVsockDevice {}

impl VzVsockDevice {
    pub fn new(device: Retained<VZVirtioSocketDevice>, queue: DispatchRetained<DispatchQueue>) -> Self {
        Self {
            device,
            queue,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Drop every host-side listener.
    pub fn remove_listeners(&self) {
        let ports: Vec<u32> = match self.registrations.lock() {
            Ok(mut regs) => regs
                .drain(..)
                .map(|r| r.delegate.ivars().port)
                .collect(),
            Err(_) => return,
        };
        let device_ptr = Retained::as_ptr(&self.device) as usize;
        self.queue.exec_async(move || {
            let device = unsafe { &*(device_ptr as *const VZVirtioSocketDevice) };
            for port in ports {
                unsafe { device.removeSocketListenerForPort(port) };
            }
        });
    }
}

#[async_trait::async_trait]
impl VsockDevice for VzVsockDevice {
    async fn connect(&self, port: u32) -> Result<BoxedStream> {
        let (tx, rx) = oneshot::channel::<std::result::Result<RawFd, String>>();
        let tx = Mutex::new(Some(tx));

        // Dispatch connectToPort onto the VZ queue (required by Apple).
        let device_ptr = Retained::as_ptr(&self.device) as usize;
        self.queue.exec_async(move || {
            let device = unsafe { &*(device_ptr as *const VZVirtioSocketDevice) };
            let handler = RcBlock::new(
                move |connection: *mut VZVirtioSocketConnection, err: *mut NSError| {
                    let result = if !err.is_null() {
                        Err(unsafe { &*err }.localizedDescription().to_string())
                    } else if connection.is_null() {
                        Err("null connection".to_string())
                    } else {
                        dup_connection_fd(unsafe { &*connection })
                    };
                    if let Some(tx) = tx.lock().ok().and_then(|mut tx| tx.take()) {
                        if let Err(Ok(fd)) = tx.send(result) {
                            unsafe { libc::close(fd) };
                        }
                    }
                },
            );
            unsafe { device.connectToPort_completionHandler(port, &handler) };
        });

        let fd = tokio::time::timeout(CONNECT_TIMEOUT, rx)
            .await
            .map_err(|_| Error::Hypervisor(format!("vsock connect to port {} timed out", port)))?
            .map_err(|_| Error::Hypervisor("vsock connect: handler dropped".into()))?
            .map_err(|e| Error::Hypervisor(format!("vsock connect to port {}: {}", port, e)))?;
        debug!(port, fd, "vz vsock: connected");
        Ok(Box::new(stream_from_fd(fd)?))
    }

    async fn listen(&self, port: u32) -> Result<VsockListener> {
        let (fd_tx, mut fd_rx) = mpsc::channel::<RawFd>(ACCEPT_BACKLOG);
        let registration = {
            let delegate = ListenerDelegate::new(port, fd_tx);
            let listener = unsafe { VZVirtioSocketListener::new() };
            unsafe { listener.setDelegate(Some(ProtocolObject::from_ref(&*delegate))) };
            Registration {
                listener,
                delegate,
            }
        };

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let device_ptr = Retained::as_ptr(&self.device) as usize;
        let listener_ptr = Retained::as_ptr(&registration.listener) as usize;
        self.queue.exec_async(move || {
            let device = unsafe { &*(device_ptr as *const VZVirtioSocketDevice) };
            let listener = unsafe { &*(listener_ptr as *const VZVirtioSocketListener) };
            unsafe { device.setSocketListener_forPort(listener, port) };
            let _ = done_tx.send(());
        });
        done_rx
            .await
            .map_err(|_| Error::Hypervisor(format!("vsock listen on port {} failed", port)))?;

        self.registrations
            .lock()
            .map_err(|_| Error::Hypervisor("vsock registry poisoned".into()))?
            .push(registration);

        // fds arrive on GCD threads; streams must be created inside the runtime.
        let (stream_tx, stream_rx) = mpsc::channel::<BoxedStream>(ACCEPT_BACKLOG);
        tokio::spawn(async move {
            while let Some(fd) = fd_rx.recv().await {
                match stream_from_fd(fd) {
                    Ok(stream) => {
                        if stream_tx.send(Box::new(stream)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(port, "vz vsock: failed to wrap accepted fd: {}", e),
                }
            }
        });
        Ok(VsockListener::new(port, stream_rx))
    }
}
