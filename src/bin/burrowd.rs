use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::stream;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use burrow::guest::protocol::LaunchOutcome;
use burrow::idle::IdleHandle;
use burrow::{backend, ContainerEvent, DaemonConfig, IdleLatch, PortForwardManager, TaskEvent, VirtualMachine};

#[derive(Parser)]
#[command(name = "burrowd", version)]
#[command(about = "Runs the container VM and keeps the host in step with it")]
struct Cli {
    /// YAML daemon configuration
    #[arg(long, short, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Attach the guest console and log at debug level
    #[arg(long)]
    debug: bool,

    /// Unix socket the runtime event bridge writes JSON lines to
    #[arg(long, env = "BURROW_EVENT_SOCKET")]
    event_socket: Option<PathBuf>,
}

/// One line on the event socket.
#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum FeedLine {
    Container(ContainerEvent),
    Task(TaskEvent),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    config.vm.debug |= cli.debug;

    let hypervisor = backend::create_hypervisor()?;
    let mut vm = VirtualMachine::new(config.clone(), hypervisor)?;
    vm.start().await?;

    match vm.launch_container_runtime().await {
        Ok(LaunchOutcome::Ready { .. }) => {}
        Ok(other) => tracing::warn!("container runtime not ready: {:?}", other),
        Err(e) => {
            tracing::error!("failed to launch container runtime: {}", e);
            vm.shutdown().await?;
            return Err(e.into());
        }
    }

    let forwards = Arc::new(PortForwardManager::new(
        Arc::new(vm.tunnel()?),
        config.forward.bind_addresses.clone(),
    ));

    let latch = config.idle.delay.map(|delay| {
        IdleLatch::spawn(delay, move || tracing::debug!(?delay, "idle delay elapsed"))
    });
    let idle_handle = latch.as_ref().map(IdleLatch::handle);

    let (container_tx, container_rx) = mpsc::channel::<ContainerEvent>(64);
    let (task_tx, task_rx) = mpsc::channel::<TaskEvent>(64);
    {
        let forwards = forwards.clone();
        tokio::spawn(async move { forwards.run(receiver_stream(container_rx)).await });
    }
    if let Some(handle) = idle_handle {
        tokio::spawn(watch_tasks(handle, task_rx));
    }
    if let Some(path) = &cli.event_socket {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        tracing::info!("accepting runtime events on {}", path.display());
        tokio::spawn(accept_feeds(listener, container_tx, task_tx));
    }

    // The latch task ends when it fires, or panics on a negative count.
    let idle = async move {
        match latch {
            Some(latch) => latch.join().await,
            None => std::future::pending().await,
        }
    };
    let mut latch_error = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
        joined = idle => match joined {
            Ok(()) => tracing::info!("no tasks running, shutting down"),
            Err(e) => {
                tracing::error!("idle latch failed: {}", e);
                latch_error = Some(e);
            }
        },
    }

    forwards.shutdown().await;
    vm.shutdown().await?;
    if let Some(path) = &cli.event_socket {
        let _ = std::fs::remove_file(path);
    }
    match latch_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl futures_util::Stream<Item = T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

async fn watch_tasks(handle: IdleHandle, rx: mpsc::Receiver<TaskEvent>) {
    handle.watch_tasks(receiver_stream(rx)).await
}

async fn accept_feeds(
    listener: UnixListener,
    containers: mpsc::Sender<ContainerEvent>,
    tasks: mpsc::Sender<TaskEvent>,
) {
    loop {
        let (conn, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("event socket accept failed: {}", e);
                continue;
            }
        };
        let containers = containers.clone();
        let tasks = tasks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(conn).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<FeedLine>(&line) {
                    Ok(FeedLine::Container(event)) => {
                        let _ = containers.send(event).await;
                    }
                    Ok(FeedLine::Task(event)) => {
                        let _ = tasks.send(event).await;
                    }
                    Err(e) => tracing::warn!("bad event line: {}", e),
                }
            }
        });
    }
}
