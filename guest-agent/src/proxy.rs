//! Guest ends of the stream and datagram proxies.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::time::{Duration, Instant};

use burrow_protocol::proxy::{
    parse_target, read_frame, write_frame, DatagramRequest, DatagramResponse,
};
use burrow_protocol::{Message, MessageType};

use crate::conn::Connection;
use crate::error::{GuestError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn resolve(network: &str, address: &str) -> Result<SocketAddr> {
    let want_v4 = network.ends_with('4');
    let want_v6 = network.ends_with('6');
    address
        .to_socket_addrs()?
        .find(|a| (!want_v4 || a.is_ipv4()) && (!want_v6 || a.is_ipv6()))
        .ok_or_else(|| {
            GuestError::InvalidRequest(format!("no {} address for {}", network, address))
        })
}

// ---------------------------------------------------------------------------
// Stream proxy
// ---------------------------------------------------------------------------

/// The guest-side endpoint of a stream tunnel.
enum Upstream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Upstream {
    fn dial(network: &str, address: &str) -> Result<Self> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let addr = resolve(network, address)?;
                Ok(Upstream::Tcp(TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?))
            }
            "unix" => Ok(Upstream::Unix(UnixStream::connect(address)?)),
            other => Err(GuestError::InvalidRequest(format!(
                "unsupported stream network {:?}",
                other
            ))),
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Upstream::Tcp(s) => Upstream::Tcp(s.try_clone()?),
            Upstream::Unix(s) => Upstream::Unix(s.try_clone()?),
        })
    }

    fn shutdown_write(&self) {
        let _ = match self {
            Upstream::Tcp(s) => s.shutdown(Shutdown::Write),
            Upstream::Unix(s) => s.shutdown(Shutdown::Write),
        };
    }
}

impl Read for Upstream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Upstream::Tcp(s) => s.read(buf),
            Upstream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Upstream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Upstream::Tcp(s) => s.write(buf),
            Upstream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Upstream::Tcp(s) => s.flush(),
            Upstream::Unix(s) => s.flush(),
        }
    }
}

/// Serve one stream-proxy connection: read the target, dial it, reply, then
/// pipe bytes both ways until each side has closed.
pub fn handle_stream<C: Connection>(mut conn: C) -> Result<()> {
    let target = read_frame(&mut conn)?;
    let upstream = parse_target(&target)
        .map_err(GuestError::from)
        .and_then(|(network, address)| Upstream::dial(network, address));
    let upstream = match upstream {
        Ok(upstream) => {
            write_frame(&mut conn, "")?;
            upstream
        }
        Err(e) => {
            write_frame(&mut conn, &e.to_string())?;
            return Ok(());
        }
    };

    let mut up_write = upstream.try_clone()?;
    let mut conn_read = conn.try_clone()?;

    let inbound = std::thread::Builder::new()
        .name("proxy-in".into())
        .spawn(move || {
            let copied = io::copy(&mut conn_read, &mut up_write);
            up_write.shutdown_write();
            copied
        })?;

    let mut up_read = upstream;
    let _ = io::copy(&mut up_read, &mut conn);
    let _ = conn.shutdown_write();

    let _ = inbound.join();
    Ok(())
}

// ---------------------------------------------------------------------------
// Datagram proxy
// ---------------------------------------------------------------------------

enum DatagramSocket {
    Udp { socket: UdpSocket, connected: bool },
    Unix { socket: UnixDatagram, connected: bool },
}

impl DatagramSocket {
    fn open(network: &str, address: &str, dial: bool) -> Result<Self> {
        match network {
            "udp" | "udp4" | "udp6" => {
                let addr = resolve(network, address)?;
                if dial {
                    let local: SocketAddr = if addr.is_ipv4() {
                        "0.0.0.0:0".parse().map_err(|_| invalid_addr())?
                    } else {
                        "[::]:0".parse().map_err(|_| invalid_addr())?
                    };
                    let socket = UdpSocket::bind(local)?;
                    socket.connect(addr)?;
                    Ok(DatagramSocket::Udp {
                        socket,
                        connected: true,
                    })
                } else {
                    Ok(DatagramSocket::Udp {
                        socket: UdpSocket::bind(addr)?,
                        connected: false,
                    })
                }
            }
            "unixgram" => {
                if dial {
                    let socket = UnixDatagram::unbound()?;
                    socket.connect(address)?;
                    Ok(DatagramSocket::Unix {
                        socket,
                        connected: true,
                    })
                } else {
                    Ok(DatagramSocket::Unix {
                        socket: UnixDatagram::bind(address)?,
                        connected: false,
                    })
                }
            }
            other => Err(GuestError::InvalidRequest(format!(
                "unsupported datagram network {:?}",
                other
            ))),
        }
    }

    fn local_address(&self) -> Option<String> {
        match self {
            DatagramSocket::Udp { socket, .. } => socket.local_addr().ok().map(|a| a.to_string()),
            DatagramSocket::Unix { socket, .. } => socket
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string())),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            DatagramSocket::Udp { socket, .. } => socket.set_read_timeout(timeout),
            DatagramSocket::Unix { socket, .. } => socket.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            DatagramSocket::Udp { socket, .. } => socket.set_write_timeout(timeout),
            DatagramSocket::Unix { socket, .. } => socket.set_write_timeout(timeout),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<String>)> {
        match self {
            DatagramSocket::Udp { socket, .. } => {
                let (n, from) = socket.recv_from(buf)?;
                Ok((n, Some(from.to_string())))
            }
            DatagramSocket::Unix { socket, .. } => {
                let (n, from) = socket.recv_from(buf)?;
                Ok((n, from.as_pathname().map(|p| p.display().to_string())))
            }
        }
    }

    fn send(&self, data: &[u8], address: Option<&str>) -> Result<usize> {
        match (self, address) {
            (DatagramSocket::Udp { socket, .. }, Some(addr)) => {
                let network = if socket.local_addr()?.is_ipv4() { "udp4" } else { "udp6" };
                Ok(socket.send_to(data, resolve(network, addr)?)?)
            }
            (DatagramSocket::Udp { socket, connected: true }, None) => Ok(socket.send(data)?),
            (DatagramSocket::Unix { socket, .. }, Some(addr)) => Ok(socket.send_to(data, addr)?),
            (DatagramSocket::Unix { socket, connected: true }, None) => Ok(socket.send(data)?),
            (_, None) => Err(GuestError::InvalidRequest(
                "write on an unconnected socket needs an address".into(),
            )),
        }
    }
}

fn invalid_addr() -> GuestError {
    GuestError::InvalidRequest("bad wildcard address".into())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// One tunnel instance: at most one bound socket plus its deadlines.
#[derive(Default)]
struct DatagramTunnel {
    socket: Option<DatagramSocket>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

/// Remaining time until `deadline`; `Err` when it already passed.
fn remaining(deadline: Option<Instant>) -> std::result::Result<Option<Duration>, ()> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(())
            } else {
                Ok(Some(left))
            }
        }
    }
}

fn timed_out() -> DatagramResponse {
    DatagramResponse {
        timed_out: true,
        ..DatagramResponse::err("i/o timeout")
    }
}

impl DatagramTunnel {
    fn socket(&self) -> Result<&DatagramSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| GuestError::InvalidRequest("no socket bound".into()))
    }

    fn handle(&mut self, req: DatagramRequest) -> Result<DatagramResponse> {
        let deadline = |ms: Option<u64>| ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        match req {
            DatagramRequest::Dial { network, address } | DatagramRequest::Listen { network, address }
                if self.socket.is_some() =>
            {
                Err(GuestError::InvalidRequest(format!(
                    "socket already bound; cannot open {}:{}",
                    network, address
                )))
            }
            DatagramRequest::Dial { network, address } => {
                self.bind(DatagramSocket::open(&network, &address, true)?)
            }
            DatagramRequest::Listen { network, address } => {
                self.bind(DatagramSocket::open(&network, &address, false)?)
            }
            DatagramRequest::Read { max_len } => {
                let socket = self.socket()?;
                let Ok(timeout) = remaining(self.read_deadline) else {
                    return Ok(timed_out());
                };
                socket.set_read_timeout(timeout)?;
                let mut buf = vec![0u8; max_len.clamp(1, 65536)];
                match socket.recv(&mut buf) {
                    Ok((n, address)) => {
                        buf.truncate(n);
                        Ok(DatagramResponse {
                            data: buf,
                            address,
                            ..Default::default()
                        })
                    }
                    Err(e) if is_timeout(&e) => Ok(timed_out()),
                    Err(e) => Err(e.into()),
                }
            }
            DatagramRequest::Write { data, address } => {
                let socket = self.socket()?;
                let Ok(timeout) = remaining(self.write_deadline) else {
                    return Ok(timed_out());
                };
                socket.set_write_timeout(timeout)?;
                match socket.send(&data, address.as_deref()) {
                    Ok(written) => Ok(DatagramResponse {
                        written,
                        ..Default::default()
                    }),
                    Err(GuestError::Io(e)) if is_timeout(&e) => Ok(timed_out()),
                    Err(e) => Err(e),
                }
            }
            DatagramRequest::SetDeadline { timeout_ms } => {
                self.read_deadline = deadline(timeout_ms);
                self.write_deadline = self.read_deadline;
                Ok(DatagramResponse::default())
            }
            DatagramRequest::SetReadDeadline { timeout_ms } => {
                self.read_deadline = deadline(timeout_ms);
                Ok(DatagramResponse::default())
            }
            DatagramRequest::SetWriteDeadline { timeout_ms } => {
                self.write_deadline = deadline(timeout_ms);
                Ok(DatagramResponse::default())
            }
            DatagramRequest::Close => {
                self.socket = None;
                Ok(DatagramResponse::default())
            }
        }
    }

    fn bind(&mut self, socket: DatagramSocket) -> Result<DatagramResponse> {
        let local_address = socket.local_address();
        self.socket = Some(socket);
        Ok(DatagramResponse {
            local_address,
            ..Default::default()
        })
    }
}

/// Serve one datagram-proxy connection until the host closes it or sends `Close`.
pub fn handle_datagram<C: Read + Write>(mut conn: C) -> Result<()> {
    let mut tunnel = DatagramTunnel::default();
    loop {
        let msg = match Message::read_from_sync(&mut conn) {
            Ok(msg) => msg,
            Err(burrow_protocol::ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };
        if msg.msg_type != MessageType::DatagramRequest {
            let reply = DatagramResponse::err(format!("unexpected {:?}", msg.msg_type));
            Message::json(MessageType::DatagramResponse, &reply)?.write_to_sync(&mut conn)?;
            continue;
        }
        let req: DatagramRequest = msg.decode()?;
        let closing = req == DatagramRequest::Close;
        let reply = tunnel
            .handle(req)
            .unwrap_or_else(|e| DatagramResponse::err(e.to_string()));
        Message::json(MessageType::DatagramResponse, &reply)?.write_to_sync(&mut conn)?;
        if closing {
            return Ok(());
        }
    }
}
