//! TCP Receive Telemetry Agent
//!
//! Attaches the receive-path kprobe, decodes every record it emits, and
//! streams the events as JSON to every connected WebSocket client.
//!
//! ## Usage
//!
//! ```bash
//! # Serve on the default port 4000 using a compiled probe object
//! sudo ./tcprecv-agent --ebpf-object kernel/target/bpfel-unknown-none/release/tcprecv-probe
//!
//! # Poll faster and keep slow clients connected, dropping their messages instead
//! sudo ./tcprecv-agent --poll-interval-ms 10 --overflow drop-message
//!
//! # Emit byte counts as strings for JavaScript consumers
//! sudo ./tcprecv-agent --bytes-as-string
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::{future::Future, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tcprecv_common::constants::{DEFAULT_KERNEL_SYMBOL, EVENTS_MAP, PROGRAM_NAME};
use tcprecv_daemon::{
    broadcast::{Broadcaster, OverflowPolicy},
    config::AgentConfig,
    error::PollError,
    loader::{AyaLoader, ProbeObject},
    pipeline::Pipeline,
    registry::SubscriberRegistry,
    server::TransportServer,
    session::ProbeSession,
    types::ByteCountEncoding,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Stream kernel TCP receive events to WebSocket subscribers
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port for subscriber connections
    #[clap(short, long, env = "TCPRECV_PORT", default_value_t = 4000)]
    port: u16,

    /// Address to bind the subscriber endpoint to
    #[clap(long, env = "TCPRECV_BIND", default_value = "0.0.0.0")]
    bind: std::net::IpAddr,

    /// Interval between kernel buffer polls (in milliseconds)
    #[clap(long, env = "TCPRECV_POLL_INTERVAL_MS", default_value_t = 50)]
    poll_interval_ms: u64,

    /// Kernel function to attach the probe to
    #[clap(long, env = "TCPRECV_KERNEL_SYMBOL", default_value = DEFAULT_KERNEL_SYMBOL)]
    kernel_symbol: String,

    /// Program name inside the eBPF object
    #[clap(long, env = "TCPRECV_PROGRAM", default_value = PROGRAM_NAME)]
    program: String,

    /// Perf event map to read records from
    #[clap(long, env = "TCPRECV_CHANNEL", default_value = EVENTS_MAP)]
    channel: String,

    /// Path to eBPF object file (if not embedded)
    #[clap(long, env = "TCPRECV_EBPF_OBJECT")]
    ebpf_object: Option<PathBuf>,

    /// Pages per CPU perf buffer (power of two)
    #[clap(long, env = "TCPRECV_PERF_PAGES", default_value_t = 64)]
    perf_pages: usize,

    /// Messages queued per subscriber before the overflow policy applies
    #[clap(long, env = "TCPRECV_SUBSCRIBER_BUFFER", default_value_t = 256)]
    subscriber_buffer: usize,

    /// Full-queue behavior (drop-subscriber, drop-message)
    #[clap(long, env = "TCPRECV_OVERFLOW", default_value = "drop-subscriber")]
    overflow: OverflowPolicy,

    /// Encode byte counts as JSON strings
    #[clap(long, env = "TCPRECV_BYTES_AS_STRING")]
    bytes_as_string: bool,

    /// Progress reporting interval in seconds (0 = disabled)
    #[clap(long, env = "TCPRECV_PROGRESS_INTERVAL", default_value_t = 10)]
    progress_interval: u64,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn probe_object(&self) -> Result<ProbeObject> {
        match &self.ebpf_object {
            Some(path) => Ok(ProbeObject::Path(path.clone())),
            None => embedded_object(),
        }
    }

    fn into_config(self) -> Result<AgentConfig> {
        let mut config = AgentConfig::new(self.probe_object()?);

        config.listen = SocketAddr::new(self.bind, self.port);
        config.poll_interval = Duration::from_millis(self.poll_interval_ms);
        config.probe.kernel_symbol = self.kernel_symbol;
        config.probe.program = self.program;
        config.channel = self.channel;
        config.perf_pages = self.perf_pages;
        config.subscriber_queue = self.subscriber_buffer;
        config.overflow = self.overflow;
        config.byte_encoding = if self.bytes_as_string {
            ByteCountEncoding::String
        } else {
            ByteCountEncoding::Number
        };
        config.progress_interval =
            (self.progress_interval > 0).then(|| Duration::from_secs(self.progress_interval));

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let config = args.into_config()?;
    config.validate()?;

    info!("Starting TCP receive telemetry agent...");
    info!("   Listen: {}", config.listen);
    info!(
        "   Probe: {} -> {}",
        config.probe.program, config.probe.kernel_symbol
    );
    info!("   Poll interval: {:?}", config.poll_interval);
    info!("   Subscriber buffer: {}", config.subscriber_queue);
    info!("   Overflow: {:?}", config.overflow);

    let registry = Arc::new(SubscriberRegistry::new());
    let broadcaster = Arc::new(Broadcaster::new(
        Arc::clone(&registry),
        config.byte_encoding,
        config.overflow,
    ));
    let pipeline = Pipeline::new(broadcaster);

    // Bind before attaching the probe
    let server = TransportServer::bind(config.listen, Arc::clone(&registry), config.subscriber_queue)
        .await
        .context("Failed to start subscriber endpoint")?;

    // Load and attach the probe
    let mut session = ProbeSession::attach(AyaLoader::new(config.perf_pages), config.probe.clone())
        .context("Failed to attach probe")?;

    let handle = session
        .open_event_channel(&config.channel, pipeline.record_handler())
        .context("Failed to open event channel")?;

    let shutdown = CancellationToken::new();

    let serving = tokio::spawn(server.run(shutdown.clone()));

    if let Some(every) = config.progress_interval {
        pipeline.spawn_progress_reporter(every, shutdown.clone());
    }

    info!("Streaming events...");

    let polling = pipeline.run(session, handle, config.poll_interval, shutdown.clone());
    let result = stream_until_interrupted(polling, signal::ctrl_c(), &shutdown).await;

    // Stop the transport whether the loop ended cleanly or not
    shutdown.cancel();
    match serving.await {
        Ok(Err(e)) => error!("Subscriber endpoint failed: {}", e),
        Err(e) => error!("Subscriber endpoint task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    result?;

    info!("Agent stopped");
    Ok(())
}

/// Drive the poll loop until it ends or `interrupt` resolves
///
/// An interrupt cancels `shutdown` and waits for the loop to detach. A
/// failure to listen for the interrupt is fatal like a poll failure.
async fn stream_until_interrupted<P, I>(
    polling: P,
    interrupt: I,
    shutdown: &CancellationToken,
) -> Result<()>
where
    P: Future<Output = Result<(), PollError>>,
    I: Future<Output = io::Result<()>>,
{
    tokio::pin!(polling);

    let signal = tokio::select! {
        result = &mut polling => return result.context("Probe polling failed"),
        signal = interrupt => signal,
    };

    match signal {
        Ok(()) => info!("Interrupted, shutting down..."),
        Err(ref e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
    shutdown.cancel();
    let polled = polling.await;

    signal.context("Failed to listen for Ctrl-C")?;
    polled.context("Probe polling failed")
}

#[cfg(feature = "embedded")]
fn embedded_object() -> Result<ProbeObject> {
    Ok(ProbeObject::embedded())
}

#[cfg(not(feature = "embedded"))]
fn embedded_object() -> Result<ProbeObject> {
    anyhow::bail!("No eBPF object given: pass --ebpf-object or build with --features embedded")
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║       eBPF TCP Receive Telemetry Agent            ║
║          kprobe -> WebSocket fan-out              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    fn polling_until(shutdown: &CancellationToken) -> impl Future<Output = Result<(), PollError>> {
        let token = shutdown.clone();
        async move {
            token.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interrupt_stops_polling_cleanly() {
        let shutdown = CancellationToken::new();
        let result =
            stream_until_interrupted(polling_until(&shutdown), async { Ok(()) }, &shutdown).await;

        assert!(result.is_ok());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_listener_failure_is_fatal() {
        let shutdown = CancellationToken::new();
        let interrupt = async { Err(io::Error::new(io::ErrorKind::Other, "no signal handler")) };

        let result = stream_until_interrupted(polling_until(&shutdown), interrupt, &shutdown).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Ctrl-C"));
        // The loop was still stopped before returning
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_poll_failure_returned_without_interrupt() {
        let shutdown = CancellationToken::new();
        let polling = async { Err(PollError::SessionClosed) };

        let result = stream_until_interrupted(polling, pending(), &shutdown).await;

        assert!(result.is_err());
        assert!(!shutdown.is_cancelled());
    }
}
