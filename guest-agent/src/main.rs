use std::sync::Arc;
use std::time::Duration;

use burrow_guest::conn::{VsockListener, VsockStream};
use burrow_guest::events::{self, EventSink};
use burrow_guest::server::{self, Agent, AgentConfig};
use burrow_guest::{kmsg, proxy, reaper, system, timesync};
use burrow_protocol::ports;

/// Grace period between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How often PID 1 collects orphaned zombies.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Bind a vsock port, retrying while the transport driver comes up.
fn bind_with_retry(port: u32) -> Option<VsockListener> {
    for attempt in 1..=30 {
        match VsockListener::bind(port) {
            Ok(listener) => return Some(listener),
            Err(e) => {
                kmsg(&format!(
                    "vsock bind on port {} failed (attempt {}): {}; retrying in 200ms",
                    port, attempt, e
                ));
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
    None
}

/// Accept connections on `listener` forever, one thread per connection.
fn serve<F>(listener: VsockListener, name: &'static str, handler: F)
where
    F: Fn(VsockStream) -> burrow_guest::Result<()> + Send + Sync + Clone + 'static,
{
    let spawned = std::thread::Builder::new()
        .name(format!("{}-accept", name))
        .spawn(move || loop {
            let stream = match listener.accept() {
                Ok(stream) => stream,
                Err(e) => {
                    kmsg(&format!("{}: accept failed: {}", name, e));
                    continue;
                }
            };
            let handler = handler.clone();
            if let Err(e) = std::thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    if let Err(e) = handler(stream) {
                        kmsg(&format!("{}: connection error: {}", name, e));
                    }
                })
            {
                kmsg(&format!("{}: failed to spawn connection thread: {}", name, e));
            }
        });
    if let Err(e) = spawned {
        kmsg(&format!("{}: failed to spawn accept thread: {}", name, e));
    }
}

fn main() {
    kmsg("burrow guest agent starting...");

    let is_init = std::process::id() == 1;
    if is_init {
        system::init_system();
        let _ = std::thread::Builder::new()
            .name("orphans".into())
            .spawn(|| reaper::run_loop(REAP_INTERVAL));
    }

    let (sink, records) = EventSink::channel();
    let _ = std::thread::Builder::new()
        .name("events".into())
        .spawn(move || events::forward(records, || VsockStream::connect_host(ports::EVENTS)));
    sink.emit("init", "guest agent started\n");

    let _ = std::thread::Builder::new().name("timesync".into()).spawn(|| {
        timesync::run_loop(
            Duration::from_secs(burrow_protocol::timesync::DEFAULT_INTERVAL_SECS),
            burrow_protocol::timesync::DEFAULT_THRESHOLD_NS,
        )
    });

    let config = AgentConfig {
        manage_system: is_init,
        ..AgentConfig::default()
    };
    let agent = Arc::new(Agent::new(config, sink, move || {
        // Reply is already on the wire; power off from a fresh thread so the
        // connection thread can finish.
        let _ = std::thread::Builder::new().name("shutdown".into()).spawn(|| {
            system::teardown(SHUTDOWN_GRACE);
            system::power_off();
        });
    }));

    for (port, name) in [
        (ports::STREAM_PROXY, "stream-proxy"),
        (ports::DATAGRAM_PROXY, "datagram-proxy"),
        (ports::CONTROL, "control"),
    ] {
        let Some(listener) = bind_with_retry(port) else {
            kmsg(&format!("giving up on vsock port {}", port));
            continue;
        };
        kmsg(&format!("listening on vsock port {}", port));
        match port {
            ports::STREAM_PROXY => serve(listener, name, proxy::handle_stream),
            ports::DATAGRAM_PROXY => serve(listener, name, proxy::handle_datagram),
            _ => {
                let agent = agent.clone();
                serve(listener, name, move |stream| {
                    server::handle_connection(stream, agent.clone())
                })
            }
        }
    }

    // PID 1 must never exit or the kernel panics.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
