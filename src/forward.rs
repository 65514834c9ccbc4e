//! Port-forward manager.
//!
//! Publishes container ports on the host: for every running container with
//! published TCP ports, one listener per configured bind address, each
//! accepted connection tunneled to the container's address in the guest.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BoxedStream;
use crate::error::Result;
use crate::events::{ContainerAction, ContainerEvent, NetworkSettings, Protocol};
use crate::tunnel::TunnelClient;

/// Opens connections inside the guest.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream>;
}

#[async_trait]
impl Dialer for TunnelClient {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream> {
        TunnelClient::dial(self, network, address).await
    }
}

/// One host listener. Dropping it stops accepting; [`Forward::close`] also
/// waits until the socket is released. Connections already being forwarded
/// run to completion either way.
struct Forward {
    local: SocketAddr,
    accept: JoinHandle<()>,
}

impl Forward {
    async fn close(mut self) {
        self.accept.abort();
        let _ = (&mut self.accept).await;
    }
}

impl Drop for Forward {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Listeners of one running container, and the settings they were bound for.
struct Published {
    network: NetworkSettings,
    forwards: Vec<Forward>,
}

impl Published {
    fn addresses(&self) -> Vec<SocketAddr> {
        self.forwards.iter().map(|f| f.local).collect()
    }

    async fn close(self) -> usize {
        let count = self.forwards.len();
        for forward in self.forwards {
            forward.close().await;
        }
        count
    }
}

/// Publishes container ports as host listeners.
///
/// The container table sits behind one async mutex that is held for the
/// whole of every add and remove, so events for the same container apply
/// one at a time and in the order they arrive.
pub struct PortForwardManager {
    dialer: Arc<dyn Dialer>,
    bind_addresses: Vec<IpAddr>,
    containers: Mutex<HashMap<String, Published>>,
}

impl PortForwardManager {
    pub fn new(dialer: Arc<dyn Dialer>, bind_addresses: Vec<IpAddr>) -> Self {
        Self {
            dialer,
            bind_addresses,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `network`'s ports for container `id`. Returns the bound host
    /// addresses.
    ///
    /// A repeated start with the same settings keeps the existing listeners.
    /// Different settings close the old listeners before the new ones bind.
    pub async fn add(&self, id: &str, network: &NetworkSettings) -> Result<Vec<SocketAddr>> {
        let mut table = self.containers.lock().await;
        if let Some(existing) = table.get(id) {
            if existing.network == *network {
                debug!(container = id, "already forwarding");
                return Ok(existing.addresses());
            }
        }
        if let Some(previous) = table.remove(id) {
            let closed = previous.close().await;
            debug!(container = id, listeners = closed, "replacing forwards");
        }

        let Some(ip) = network.ip else {
            debug!(container = id, "no container address, nothing to forward");
            return Ok(Vec::new());
        };

        let mut forwards = Vec::new();
        for mapping in &network.ports {
            if mapping.protocol == Protocol::Udp {
                warn!(
                    container = id,
                    host_port = mapping.host_port,
                    "udp port publishing is not supported, skipping"
                );
                continue;
            }
            let target = SocketAddr::new(ip, mapping.container_port).to_string();
            for addr in &self.bind_addresses {
                let bind = SocketAddr::new(*addr, mapping.host_port);
                let listener = match TcpListener::bind(bind).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(container = id, %bind, "cannot listen: {}", e);
                        continue;
                    }
                };
                let local = match listener.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        warn!(container = id, %bind, "listener has no address: {}", e);
                        continue;
                    }
                };
                info!(container = id, %local, dest = %target, "forwarding");
                let accept = tokio::spawn(accept_loop(
                    listener,
                    self.dialer.clone(),
                    target.clone(),
                ));
                forwards.push(Forward { local, accept });
            }
        }

        let published = Published {
            network: network.clone(),
            forwards,
        };
        let bound = published.addresses();
        table.insert(id.to_string(), published);
        Ok(bound)
    }

    /// Close every listener of container `id` and return how many there
    /// were. Unknown ids are ignored.
    pub async fn remove(&self, id: &str) -> usize {
        let mut table = self.containers.lock().await;
        let Some(published) = table.remove(id) else {
            return 0;
        };
        let count = published.close().await;
        if count > 0 {
            info!(container = id, listeners = count, "stopped forwarding");
        }
        count
    }

    pub async fn listeners(&self, id: &str) -> Vec<SocketAddr> {
        self.containers
            .lock()
            .await
            .get(id)
            .map(Published::addresses)
            .unwrap_or_default()
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    pub async fn handle(&self, event: &ContainerEvent) -> Result<()> {
        match event.action {
            ContainerAction::Start => self.add(&event.id, &event.network).await.map(|_| ()),
            ContainerAction::Stop | ContainerAction::Die => {
                self.remove(&event.id).await;
                Ok(())
            }
        }
    }

    /// Apply container events until the feed ends, then close everything.
    pub async fn run<S>(&self, feed: S)
    where
        S: Stream<Item = ContainerEvent>,
    {
        futures_util::pin_mut!(feed);
        while let Some(event) = feed.next().await {
            if let Err(e) = self.handle(&event).await {
                warn!(container = %event.id, "forward update failed: {}", e);
            }
        }
        self.shutdown().await;
    }

    /// Close every listener.
    pub async fn shutdown(&self) {
        let mut table = self.containers.lock().await;
        let count = table.len();
        for (_, published) in table.drain() {
            published.close().await;
        }
        debug!(containers = count, "port forwarding shut down");
    }
}

async fn accept_loop(listener: TcpListener, dialer: Arc<dyn Dialer>, target: String) {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                tokio::spawn(forward_connection(conn, peer, dialer.clone(), target.clone()));
            }
            Err(e) => {
                warn!(dest = %target, "accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn forward_connection(
    mut conn: TcpStream,
    peer: SocketAddr,
    dialer: Arc<dyn Dialer>,
    target: String,
) {
    let mut upstream = match dialer.dial("tcp", &target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, dest = %target, "tunnel dial failed: {}", e);
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        Ok((sent, received)) => debug!(%peer, dest = %target, sent, received, "forward closed"),
        Err(e) => debug!(%peer, dest = %target, "forward ended: {}", e),
    }
}
