//! Port-forward manager tests.
//!
//! The dialer hands out in-memory echo streams and records where each
//! connection was meant to go.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use burrow::backend::BoxedStream;
use burrow::events::{NetworkSettings, PortMapping};
use burrow::forward::Dialer;
use burrow::{ContainerEvent, PortForwardManager, Result};

#[derive(Default)]
struct EchoDialer {
    dialed: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Dialer for EchoDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream> {
        self.dialed
            .lock()
            .unwrap()
            .push(format!("{}:{}", network, address));
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(guest);
            tokio::io::copy(&mut r, &mut w).await.ok();
        });
        Ok(Box::new(host))
    }
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn manager() -> (Arc<EchoDialer>, PortForwardManager) {
    let dialer = Arc::new(EchoDialer::default());
    let manager = PortForwardManager::new(dialer.clone(), vec![LOCALHOST]);
    (dialer, manager)
}

fn network(ip: &str, ports: Vec<PortMapping>) -> NetworkSettings {
    NetworkSettings {
        ip: Some(ip.parse().unwrap()),
        ports,
    }
}

async fn wait_until_refused(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} still accepting", addr);
}

// =============================================================================
// START / STOP
// =============================================================================

/// Start publishes a listener that tunnels to the container; stop removes it.
#[tokio::test]
async fn test_start_then_stop() {
    let (dialer, manager) = manager();
    manager
        .handle(&ContainerEvent::start(
            "c1",
            network("10.88.0.4", vec![PortMapping::tcp(0, 80)]),
        ))
        .await
        .unwrap();
    let listeners = manager.listeners("c1").await;
    assert_eq!(listeners.len(), 1);

    let mut client = TcpStream::connect(listeners[0]).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    assert_eq!(*dialer.dialed.lock().unwrap(), vec!["tcp:10.88.0.4:80"]);

    manager.handle(&ContainerEvent::stop("c1")).await.unwrap();
    assert!(manager.listeners("c1").await.is_empty());
    assert_eq!(manager.container_count().await, 0);
    wait_until_refused(listeners[0]).await;

    // The forward already in flight keeps working.
    client.write_all(b"again").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");
}

/// Stop and die are idempotent, and unknown containers are ignored.
#[tokio::test]
async fn test_stop_is_idempotent() {
    let (_, manager) = manager();
    manager
        .add("c1", &network("10.88.0.4", vec![PortMapping::tcp(0, 80)]))
        .await
        .unwrap();
    assert_eq!(manager.remove("c1").await, 1);
    assert_eq!(manager.remove("c1").await, 0);
    manager.handle(&ContainerEvent::die("c1")).await.unwrap();
    manager.handle(&ContainerEvent::die("never")).await.unwrap();
}

/// Two containers with disjoint ports have independent listener sets.
#[tokio::test]
async fn test_containers_are_independent() {
    let (_, manager) = manager();
    manager
        .add("a", &network("10.88.0.4", vec![PortMapping::tcp(0, 80)]))
        .await
        .unwrap();
    manager
        .add(
            "b",
            &network(
                "10.88.0.5",
                vec![PortMapping::tcp(0, 443), PortMapping::tcp(0, 8443)],
            ),
        )
        .await
        .unwrap();
    assert_eq!(manager.listeners("a").await.len(), 1);
    assert_eq!(manager.listeners("b").await.len(), 2);

    manager.remove("a").await;
    assert!(manager.listeners("a").await.is_empty());
    assert_eq!(manager.listeners("b").await.len(), 2);
}

/// A repeated start with the same settings keeps the listeners serving.
#[tokio::test]
async fn test_repeated_start_keeps_listeners() {
    let (_, manager) = manager();
    let start = ContainerEvent::start("c1", network("10.88.0.4", vec![PortMapping::tcp(0, 80)]));
    manager.handle(&start).await.unwrap();
    let first = manager.listeners("c1").await;
    manager.handle(&start).await.unwrap();
    assert_eq!(manager.listeners("c1").await, first);

    let mut client = TcpStream::connect(first[0]).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

/// New settings on the same host port replace the old listener.
#[tokio::test]
async fn test_changed_start_rebinds_same_port() {
    let port = {
        let free = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        free.local_addr().unwrap().port()
    };
    let (dialer, manager) = manager();
    manager
        .add("c1", &network("10.88.0.4", vec![PortMapping::tcp(port, 80)]))
        .await
        .unwrap();
    let bound = manager
        .add("c1", &network("10.88.0.4", vec![PortMapping::tcp(port, 8080)]))
        .await
        .unwrap();
    assert_eq!(bound, vec![SocketAddr::new(LOCALHOST, port)]);

    let mut client = TcpStream::connect(bound[0]).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(*dialer.dialed.lock().unwrap(), vec!["tcp:10.88.0.4:8080"]);
}

/// Start and stop racing for one container apply in arrival order.
#[tokio::test]
async fn test_concurrent_start_and_stop() {
    let (_, manager) = manager();
    let start = ContainerEvent::start("c1", network("10.88.0.4", vec![PortMapping::tcp(0, 80)]));
    let stop = ContainerEvent::stop("c1");
    let (started, stopped) = tokio::join!(manager.handle(&start), manager.handle(&stop));
    started.unwrap();
    stopped.unwrap();
    assert!(manager.listeners("c1").await.is_empty());
    assert_eq!(manager.container_count().await, 0);
}

// =============================================================================
// SKIPPED PORTS
// =============================================================================

/// UDP mappings are skipped; TCP ones on the same container still publish.
#[tokio::test]
async fn test_udp_is_skipped() {
    let (_, manager) = manager();
    let bound = manager
        .add(
            "dns",
            &network(
                "10.88.0.6",
                vec![PortMapping::udp(0, 53), PortMapping::tcp(0, 53)],
            ),
        )
        .await
        .unwrap();
    assert_eq!(bound.len(), 1);
}

/// A port already taken on the host does not stop the others.
#[tokio::test]
async fn test_bind_failure_skips_only_that_port() {
    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let taken_port = taken.local_addr().unwrap().port();

    let (_, manager) = manager();
    let bound = manager
        .add(
            "c1",
            &network(
                "10.88.0.4",
                vec![PortMapping::tcp(taken_port, 80), PortMapping::tcp(0, 81)],
            ),
        )
        .await
        .unwrap();
    assert_eq!(bound.len(), 1);
    assert_ne!(bound[0].port(), taken_port);
}

/// A container without an address publishes nothing.
#[tokio::test]
async fn test_no_address_no_listeners() {
    let (_, manager) = manager();
    let settings = NetworkSettings {
        ip: None,
        ports: vec![PortMapping::tcp(0, 80)],
    };
    assert!(manager.add("c1", &settings).await.unwrap().is_empty());
}

// =============================================================================
// EVENT FEED
// =============================================================================

/// The feed is applied in order and everything is closed when it ends.
#[tokio::test]
async fn test_run_applies_feed() {
    let (dialer, manager) = manager();
    let feed = stream::iter(vec![
        ContainerEvent::start("a", network("10.88.0.4", vec![PortMapping::tcp(0, 80)])),
        ContainerEvent::start("b", network("10.88.0.5", vec![PortMapping::tcp(0, 80)])),
        ContainerEvent::stop("a"),
    ]);
    manager.run(feed).await;
    assert_eq!(manager.container_count().await, 0);
    assert!(dialer.dialed.lock().unwrap().is_empty());
}
