//! Blocking vsock sockets and the connection abstraction the handlers use.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use burrow_protocol::HOST_CID;

const VMADDR_CID_ANY: u32 = 0xFFFF_FFFF;

/// A bidirectional byte stream that can be split across threads.
///
/// Implemented for vsock streams in production and Unix socket pairs in tests.
pub trait Connection: Read + Write + Send + Sized + 'static {
    fn try_clone(&self) -> io::Result<Self>;

    /// Shut down both directions, unblocking any reader on a clone.
    fn shutdown(&self) -> io::Result<()>;

    /// Shut down the write half only.
    fn shutdown_write(&self) -> io::Result<()>;
}

impl Connection for UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Both)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Write)
    }
}

#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_zero: [u8; 4],
}

impl SockaddrVm {
    fn new(cid: u32, port: u32) -> Self {
        Self {
            svm_family: libc::AF_VSOCK as libc::sa_family_t,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: cid,
            svm_zero: [0; 4],
        }
    }
}

fn vsock_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A listening vsock socket.
pub struct VsockListener {
    fd: OwnedFd,
    port: u32,
}

impl VsockListener {
    pub fn bind(port: u32) -> io::Result<Self> {
        let fd = vsock_socket()?;
        let addr = SockaddrVm::new(VMADDR_CID_ANY, port);
        check(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
            )
        })?;
        check(unsafe { libc::listen(fd.as_raw_fd(), 16) })?;
        Ok(Self { fd, port })
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn accept(&self) -> io::Result<VsockStream> {
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(VsockStream {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

/// A connected vsock stream.
pub struct VsockStream {
    fd: OwnedFd,
}

impl VsockStream {
    /// Connect to a port on the host.
    pub fn connect_host(port: u32) -> io::Result<Self> {
        let fd = vsock_socket()?;
        let addr = SockaddrVm::new(HOST_CID, port);
        check(unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
            )
        })?;
        Ok(Self { fd })
    }

    fn shutdown_how(&self, how: libc::c_int) -> io::Result<()> {
        check(unsafe { libc::shutdown(self.fd.as_raw_fd(), how) })
    }
}

impl AsRawFd for VsockStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for VsockStream {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        self.shutdown_how(libc::SHUT_RDWR)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown_how(libc::SHUT_WR)
    }
}
