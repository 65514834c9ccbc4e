//! Transport tunnel into the guest network namespace.
//!
//! Every [`TunnelClient::dial`] opens its own vsock connection to the
//! stream-proxy port, so forwarded connections never share a channel.

pub mod datagram;
pub mod stream;
pub mod timesync;

use std::sync::Arc;

use tracing::debug;

use crate::backend::{BoxedStream, VsockDevice};
use crate::error::Result;
use crate::guest::protocol::ports;

pub use datagram::{Datagram, DatagramConn};

#[derive(Clone)]
pub struct TunnelClient {
    device: Arc<dyn VsockDevice>,
}

impl TunnelClient {
    pub fn new(device: Arc<dyn VsockDevice>) -> Self {
        Self { device }
    }

    /// Connect to `address` as seen from inside the guest.
    ///
    /// The returned stream is a raw pipe to the dialed peer.
    pub async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream> {
        let mut stream = self.device.connect(ports::STREAM_PROXY).await?;
        stream::handshake(&mut stream, network, address).await?;
        debug!(network, address, "tunnel dialed");
        Ok(stream)
    }

    /// Open a datagram socket connected to `address` in the guest.
    pub async fn dial_datagram(&self, network: &str, address: &str) -> Result<DatagramConn> {
        let stream = self.device.connect(ports::DATAGRAM_PROXY).await?;
        DatagramConn::dial(stream, network, address).await
    }

    /// Bind a datagram socket at `address` in the guest.
    pub async fn listen_datagram(&self, network: &str, address: &str) -> Result<DatagramConn> {
        let stream = self.device.connect(ports::DATAGRAM_PROXY).await?;
        DatagramConn::listen(stream, network, address).await
    }
}
