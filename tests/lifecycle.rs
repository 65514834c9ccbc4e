//! Lifecycle tests against the loopback hypervisor.
//!
//! These drive `VirtualMachine::start` and `shutdown` end to end: plan,
//! validation, boot, handshake, mounts, init actions and persisted state.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use burrow::guest::protocol::{ports, timesync, LaunchOutcome};
use burrow::{Error, Phase, VirtualMachine};
use common::{daemon_config, Behavior, LoopbackHypervisor, GUEST_IPV4};

fn mounts_in(calls: &[String]) -> Vec<String> {
    calls
        .iter()
        .filter(|c| c.starts_with("mount "))
        .cloned()
        .collect()
}

// =============================================================================
// START
// =============================================================================

/// A clean boot ends Ready with mounts done parent-first and state persisted.
#[tokio::test]
async fn test_start_reaches_ready() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior::default());
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    let mut events = vm.subscribe_events();

    vm.start().await.unwrap();
    assert_eq!(vm.phase(), Phase::Ready);

    let calls = hypervisor.calls();
    assert_eq!(
        mounts_in(&calls),
        vec![
            "mount virtiofs host /mnt/host",
            "mount ext4 /dev/vdb /var/lib/containerd",
        ]
    );
    let mkfs = calls.iter().position(|c| c == "run mkfs.ext4 -F /dev/vdb").unwrap();
    let mount = calls
        .iter()
        .position(|c| c == "mount ext4 /dev/vdb /var/lib/containerd")
        .unwrap();
    assert!(mkfs < mount);
    assert_eq!(calls.last().unwrap(), "write /run/machine-id");

    let state = vm.state().get().unwrap();
    assert_eq!(state.status, "running");
    assert_eq!(state.ipv4_address, GUEST_IPV4);
    assert!(!state.mac_address.is_empty());
    assert_eq!(state.machine_id.len(), 16);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.subsystem, "init");

    vm.shutdown().await.unwrap();
}

/// Start cannot run twice on the same machine.
#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior::default());
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor).unwrap();
    vm.start().await.unwrap();
    assert!(matches!(
        vm.start().await,
        Err(Error::InvalidTransition {
            from: Phase::Ready,
            ..
        })
    ));
    vm.shutdown().await.unwrap();
    assert!(vm.start().await.is_err());
}

/// MAC and machine id survive a restart of the daemon.
#[tokio::test]
async fn test_identity_is_stable_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = VirtualMachine::new(
        daemon_config(dir.path()),
        LoopbackHypervisor::new(Behavior::default()),
    )
    .unwrap();
    first.start().await.unwrap();
    let before = first.state().get().unwrap();
    first.shutdown().await.unwrap();

    let mut second = VirtualMachine::new(
        daemon_config(dir.path()),
        LoopbackHypervisor::new(Behavior::default()),
    )
    .unwrap();
    second.start().await.unwrap();
    let after = second.state().get().unwrap();
    assert_eq!(before.mac_address, after.mac_address);
    assert_eq!(before.machine_id, after.machine_id);
    second.shutdown().await.unwrap();
}

// =============================================================================
// START FAILURES
// =============================================================================

/// A rejected configuration leaves no mounts behind and never boots.
#[tokio::test]
async fn test_validation_failure_clears_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior {
        reject_config: true,
        ..Default::default()
    });
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();

    let err = vm.start().await.unwrap_err();
    assert!(err.to_string().starts_with("validate configuration"));
    assert!(vm.pending_mounts().is_empty());
    assert_eq!(vm.phase(), Phase::Stopped);
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 0);
}

/// A missing kernel is a configuration error before anything starts.
#[tokio::test]
async fn test_missing_kernel_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = daemon_config(dir.path());
    config.vm.kernel = dir.path().join("missing");
    let mut vm =
        VirtualMachine::new(config, LoopbackHypervisor::new(Behavior::default())).unwrap();
    match vm.start().await {
        Err(Error::Start { step, source }) => {
            assert_eq!(step, "build configuration");
            assert!(matches!(*source, Error::Config(_)));
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// The state channel closing before any state is fatal.
#[tokio::test]
async fn test_closed_state_channel_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior {
        no_first_state: true,
        ..Default::default()
    });
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    let err = vm.start().await.unwrap_err();
    assert!(err.to_string().starts_with("start vm"));
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 1);
}

/// A failed init handshake stops the VM and reports the guest's reason.
#[tokio::test]
async fn test_init_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior {
        fail_init: true,
        ..Default::default()
    });
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    let err = vm.start().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "init handshake: Guest error: overlay mount failed"
    );
    assert_eq!(vm.phase(), Phase::Stopped);
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 1);
    assert!(mounts_in(&hypervisor.calls()).is_empty());
}

/// One failing mount aborts the rest.
#[tokio::test]
async fn test_mount_failure_aborts_start() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior {
        fail_mount: Some("/mnt/host".into()),
        ..Default::default()
    });
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    let err = vm.start().await.unwrap_err();
    assert!(err.to_string().starts_with("mount"));
    assert_eq!(
        mounts_in(&hypervisor.calls()),
        vec!["mount virtiofs host /mnt/host"]
    );
    assert_eq!(vm.state().get().unwrap().status, "");
}

// =============================================================================
// RUNNING
// =============================================================================

/// Metrics are fetched on demand and kept as the latest snapshot.
#[tokio::test]
async fn test_metrics_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut vm = VirtualMachine::new(
        daemon_config(dir.path()),
        LoopbackHypervisor::new(Behavior::default()),
    )
    .unwrap();
    assert!(vm.metrics_snapshot().is_none());
    assert!(matches!(vm.refresh_metrics().await, Err(Error::VmNotRunning)));

    vm.start().await.unwrap();
    let metrics = vm.refresh_metrics().await.unwrap();
    assert_eq!(metrics.processes, Some(3));
    assert_eq!(vm.metrics_snapshot(), Some(metrics));
    vm.shutdown().await.unwrap();
}

/// The runtime is launched as a service under its configured name.
#[tokio::test]
async fn test_launch_container_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior::default());
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    vm.start().await.unwrap();
    let outcome = vm.launch_container_runtime().await.unwrap();
    assert_eq!(
        outcome,
        LaunchOutcome::Ready {
            pid: 42,
            name: "containerd".into()
        }
    );
    assert!(hypervisor
        .calls()
        .contains(&"launch-service containerd".to_string()));
    vm.shutdown().await.unwrap();
}

/// The host answers clock-sync requests once the VM is up.
#[tokio::test]
async fn test_clock_sync_responder() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior::default());
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    vm.start().await.unwrap();

    let mut conn = hypervisor
        .device()
        .guest_connect(ports::TIMESYNC)
        .await
        .unwrap();
    conn.write_all(&timesync::encode_request(9)).await.unwrap();
    let mut reply = [0u8; timesync::REPLY_SIZE];
    conn.read_exact(&mut reply).await.unwrap();
    let (id, host_ns) = timesync::decode_reply(&reply);
    assert_eq!(id, 9);
    assert!(host_ns > 0);

    vm.shutdown().await.unwrap();
}

// =============================================================================
// SHUTDOWN
// =============================================================================

/// Shutdown asks the guest first, stops the hypervisor, and is idempotent.
#[tokio::test]
async fn test_shutdown_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior::default());
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    vm.start().await.unwrap();

    vm.shutdown().await.unwrap();
    assert_eq!(vm.phase(), Phase::Stopped);
    assert!(hypervisor.calls().contains(&"shutdown".to_string()));
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 1);
    assert_eq!(vm.state().get().unwrap().status, "stopped");
    assert!(matches!(vm.client(), Err(Error::VmNotRunning)));
    assert!(vm.tunnel().is_err());

    vm.shutdown().await.unwrap();
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 1);
}

/// A guest that never answers shutdown is stopped anyway once the timeout
/// passes.
#[tokio::test]
async fn test_shutdown_timeout_still_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = daemon_config(dir.path());
    config.timeouts.shutdown = Duration::from_millis(200);
    let hypervisor = LoopbackHypervisor::new(Behavior {
        ignore_shutdown: true,
        ..Default::default()
    });
    let mut vm = VirtualMachine::new(config, hypervisor.clone()).unwrap();
    vm.start().await.unwrap();

    let began = tokio::time::Instant::now();
    vm.shutdown().await.unwrap();
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert!(hypervisor.calls().contains(&"shutdown".to_string()));
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 1);
    assert_eq!(vm.phase(), Phase::Stopped);
    assert_eq!(vm.state().get().unwrap().status, "stopped");
}

/// Shutting down a machine that never started skips the guest entirely.
#[tokio::test]
async fn test_shutdown_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = LoopbackHypervisor::new(Behavior::default());
    let mut vm = VirtualMachine::new(daemon_config(dir.path()), hypervisor.clone()).unwrap();
    vm.shutdown().await.unwrap();
    assert_eq!(vm.phase(), Phase::Stopped);
    assert_eq!(hypervisor.stops.load(Ordering::SeqCst), 0);
}
