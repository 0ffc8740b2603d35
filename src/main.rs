//! Fleet Transport: QUIC link with TCP+TLS fallback between fleet nodes
//!
//! Two roles in one binary: `serve` runs the accepting peer that relays
//! channel traffic between connected nodes, `connect` runs a transport
//! client against it and reports what happened.
//!
//! Usage:
//!   fleet-transport serve                                  # 127.0.0.1:4433, QUIC + TCP
//!   fleet-transport serve --port 0 --no-quic               # TCP+TLS only, OS-assigned port
//!   fleet-transport connect --port 4433 --count 10         # Send 10 messages on "fleet"
//!   fleet-transport connect --config transport.json        # Client settings from a file

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use fleet_protocol::LifecycleEvent;
use fleet_transport::{CertificateProvider, FleetPeer, Identity, PeerConfig, TransportConfig, TransportManager};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-transport", about = "Fleet Transport, a QUIC/TCP link between fleet nodes")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.fleet/logs/transport.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept fleet links and relay channel traffic between them
    Serve(ServeArgs),
    /// Connect to a peer, exchange messages and print metrics
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// IP address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Port for both QUIC and TCP (0 for OS-assigned)
    #[arg(long, default_value = "4433")]
    port: u16,

    /// Path to TLS certificate (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Disable the QUIC listener
    #[arg(long)]
    no_quic: bool,

    /// Disable the TCP+TLS listener
    #[arg(long)]
    no_tcp: bool,

    /// Refuse QUIC 0-RTT data
    #[arg(long)]
    no_0rtt: bool,

    /// Maximum concurrent sessions
    #[arg(long, default_value = "256")]
    max_sessions: usize,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Peer host name or address
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Peer port
    #[arg(long, default_value = "4433")]
    port: u16,

    /// JSON transport config; --host/--port and the flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channel to subscribe and publish on
    #[arg(long, default_value = "fleet")]
    channel: String,

    /// Number of messages to send
    #[arg(long, default_value = "1")]
    count: usize,

    /// Message payload (a sequence number is appended)
    #[arg(long, default_value = "hello")]
    message: String,

    /// How long to wait for relayed messages before closing
    #[arg(long, default_value = "2000")]
    wait_ms: u64,

    /// Trust only a peer certificate with this fingerprint (sha256:<hex>)
    #[arg(long)]
    pin: Vec<String>,

    /// Do not fall back to TCP+TLS when QUIC fails
    #[arg(long)]
    no_fallback: bool,

    /// Do not attempt 0-RTT resumption
    #[arg(long)]
    no_0rtt: bool,
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn init_tracing(verbose: bool, log_file: Option<&str>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if let Some(log_file_arg) = log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            home_dir().join(".fleet/logs/transport.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Reuse the identity at `~/.fleet/tls/`, generating and persisting one if
/// it is missing or unreadable.
fn ensure_identity(provider: &CertificateProvider) -> Result<Identity> {
    let tls_dir = home_dir().join(".fleet/tls");
    let cert_path = tls_dir.join("cert.pem");
    let key_path = tls_dir.join("key.pem");

    if cert_path.exists() && key_path.exists() {
        match provider.load(&cert_path, &key_path) {
            Ok(identity) => return Ok(identity),
            Err(e) => warn!("stored identity unusable, generating a new one: {e}"),
        }
    }

    let identity = provider.generate()?;
    identity.persist(&tls_dir)?;
    info!(dir = %tls_dir.display(), fingerprint = identity.fingerprint(), "generated peer identity");
    Ok(identity)
}

/// Resolves on Ctrl+C or when stdin reaches EOF (the parent process died).
async fn shutdown_signal() {
    let stdin_closed = Arc::new(tokio::sync::Notify::new());
    {
        let notify = stdin_closed.clone();
        std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 1];
            loop {
                match std::io::stdin().read(&mut buf) {
                    Ok(0) | Err(_) => {
                        notify.notify_one();
                        return;
                    }
                    Ok(_) => continue,
                }
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = stdin_closed.notified() => {
            eprintln!("stdin closed (parent process gone), shutting down");
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    if args.no_quic && args.no_tcp {
        bail!("--no-quic and --no-tcp together leave nothing to listen on");
    }

    let provider = CertificateProvider::new();
    let identity = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => provider.load(cert, key)?,
        _ => ensure_identity(&provider)?,
    };

    let config = PeerConfig {
        hostname: args.hostname.clone(),
        port: args.port,
        enable_quic: !args.no_quic,
        enable_tcp: !args.no_tcp,
        accept_0rtt: !args.no_0rtt,
        max_sessions: Some(args.max_sessions),
        ..PeerConfig::default()
    };
    let peer = FleetPeer::start(config, &identity)
        .await
        .context("failed to start fleet peer")?;

    let listeners = match (args.no_quic, args.no_tcp) {
        (false, false) => "QUIC + TCP+TLS",
        (true, false) => "TCP+TLS only",
        _ => "QUIC only",
    };

    println!();
    println!("  Fleet peer running");
    println!();
    println!("  Address:      {}:{}", args.hostname, peer.port());
    println!("  Listeners:    {listeners}");
    println!("  Fingerprint:  {}", peer.fingerprint());
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    shutdown_signal().await;

    println!("  Shutting down...");
    peer.stop().await;
    println!("  Peer stopped.");
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TransportConfig::from_file(path)?,
        None => TransportConfig::new(args.host.clone(), args.port),
    };
    if args.config.is_none() || args.host != "localhost" {
        config.host = args.host.clone();
    }
    if args.config.is_none() || args.port != 4433 {
        config.port = args.port;
    }
    if args.no_fallback {
        config.enable_tcp_fallback = false;
    }
    if args.no_0rtt {
        config.enable_0rtt = false;
    }
    config.trusted_fingerprints.extend(args.pin.iter().cloned());

    let transport = TransportManager::new(config);

    let mut events = transport.subscribe_events();

    let received = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let received = received.clone();
        let channel = args.channel.clone();
        transport.receive(&args.channel, move |payload: &Bytes| {
            received.fetch_add(1, Ordering::SeqCst);
            println!("  [{channel}] {}", String::from_utf8_lossy(payload));
            Ok(())
        })
    };

    if let Err(e) = transport.initialize().await {
        transport.close().await;
        print_events(&mut events);
        return Err(e).context("transport did not connect");
    }
    print_events(&mut events);
    println!("  Connected over {}", transport.get_mode());

    for seq in 0..args.count {
        let payload = format!("{} #{seq}", args.message);
        if let Err(e) = transport.send(&args.channel, payload).await {
            warn!(seq, "send failed: {e}");
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(args.wait_ms);
    while received.load(Ordering::SeqCst) < args.count && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    print_events(&mut events);
    let metrics = transport.get_metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    subscription.unsubscribe();
    transport.close().await;
    print_events(&mut events);
    Ok(())
}

/// Print lifecycle events queued since the last call.
fn print_events(events: &mut broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.try_recv() {
            Ok(LifecycleEvent::StateChange { state }) => println!("  [event] state -> {state}"),
            Ok(LifecycleEvent::Error { kind, details }) => println!("  [event] error {kind}: {details}"),
            Ok(LifecycleEvent::Reconnected) => println!("  [event] reconnected"),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                println!("  [event] ... {missed} events not shown");
            }
            Err(_) => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Connect(args) => connect(args).await,
    }
}
