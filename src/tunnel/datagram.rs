//! Datagram-proxy client.
//!
//! Each [`DatagramConn`] owns one guest connection and, on the guest side,
//! exactly one bound socket. Every operation is a framed request answered
//! by a framed response.

use std::time::Duration;

use tracing::debug;

use crate::backend::BoxedStream;
use crate::error::{Error, Result};
use crate::guest::protocol::proxy::{DatagramRequest, DatagramResponse, DATAGRAM_NETWORKS};
use crate::guest::protocol::{read_message, write_message, Message, MessageType};

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    /// Sender address, when the socket is not connected.
    pub address: Option<String>,
}

pub struct DatagramConn {
    stream: BoxedStream,
    local_address: Option<String>,
}

fn timeout_ms(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|d| d.as_millis() as u64)
}

impl DatagramConn {
    /// Bind an ephemeral guest socket connected to `address`.
    pub async fn dial(stream: BoxedStream, network: &str, address: &str) -> Result<Self> {
        Self::open(
            stream,
            DatagramRequest::Dial {
                network: network.to_string(),
                address: address.to_string(),
            },
        )
        .await
    }

    /// Bind a guest socket at `address`.
    pub async fn listen(stream: BoxedStream, network: &str, address: &str) -> Result<Self> {
        Self::open(
            stream,
            DatagramRequest::Listen {
                network: network.to_string(),
                address: address.to_string(),
            },
        )
        .await
    }

    async fn open(stream: BoxedStream, request: DatagramRequest) -> Result<Self> {
        let network = match &request {
            DatagramRequest::Dial { network, .. } | DatagramRequest::Listen { network, .. } => {
                network.clone()
            }
            _ => return Err(Error::Tunnel("not an open request".into())),
        };
        if !DATAGRAM_NETWORKS.contains(&network.as_str()) {
            return Err(Error::Tunnel(format!(
                "unsupported datagram network {:?}",
                network
            )));
        }
        let mut conn = Self {
            stream,
            local_address: None,
        };
        let response = conn.request(&request).await?;
        conn.local_address = response.local_address;
        debug!(local = ?conn.local_address, "datagram tunnel bound");
        Ok(conn)
    }

    async fn request(&mut self, request: &DatagramRequest) -> Result<DatagramResponse> {
        let msg = Message::json(MessageType::DatagramRequest, request)?;
        write_message(&mut self.stream, &msg).await?;
        let reply = read_message(&mut self.stream).await?;
        if reply.msg_type != MessageType::DatagramResponse {
            return Err(Error::Tunnel(format!(
                "unexpected {:?} on datagram tunnel",
                reply.msg_type
            )));
        }
        let response: DatagramResponse = reply.decode()?;
        match response.error {
            Some(error) if response.timed_out => Err(Error::Timeout(error)),
            Some(error) => Err(Error::Tunnel(error)),
            None if response.timed_out => Err(Error::Timeout("datagram deadline exceeded".into())),
            None => Ok(response),
        }
    }

    /// Guest-side address the socket is bound to.
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// Receive one datagram of at most `max_len` bytes.
    pub async fn read(&mut self, max_len: usize) -> Result<Datagram> {
        let response = self.request(&DatagramRequest::Read { max_len }).await?;
        Ok(Datagram {
            data: response.data,
            address: response.address,
        })
    }

    /// Send one datagram. `address` is needed for sockets opened with
    /// [`listen`](Self::listen).
    pub async fn write(&mut self, data: &[u8], address: Option<&str>) -> Result<usize> {
        let response = self
            .request(&DatagramRequest::Write {
                data: data.to_vec(),
                address: address.map(str::to_string),
            })
            .await?;
        Ok(response.written)
    }

    /// Deadlines are relative to when the guest receives them; `None` clears.
    pub async fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.request(&DatagramRequest::SetDeadline {
            timeout_ms: timeout_ms(timeout),
        })
        .await
        .map(|_| ())
    }

    pub async fn set_read_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.request(&DatagramRequest::SetReadDeadline {
            timeout_ms: timeout_ms(timeout),
        })
        .await
        .map(|_| ())
    }

    pub async fn set_write_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.request(&DatagramRequest::SetWriteDeadline {
            timeout_ms: timeout_ms(timeout),
        })
        .await
        .map(|_| ())
    }

    /// Close the guest socket and the tunnel.
    pub async fn close(mut self) -> Result<()> {
        self.request(&DatagramRequest::Close).await.map(|_| ())
    }
}
