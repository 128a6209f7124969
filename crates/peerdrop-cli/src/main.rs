//! peerdrop CLI
//!
//! Peer-to-peer session lifecycle and resumable chunked file transfer.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use peerdrop_core::transfer::digest_source;
use peerdrop_core::{Event, EventStream, FileSource, SessionRegistry};
use peerdrop_crypto::digest_hex;
use peerdrop_discovery::PeerId;
use peerdrop_discovery::relay::{RelayClient, RelayHub};
use peerdrop_transport::MemoryNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferBars, format_bytes};

/// How long the demo waits for every receiver to connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// peerdrop - resumable peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path [default: platform config dir]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to in-process receivers over an in-memory room
    Demo {
        /// File to send
        #[arg(short, long)]
        file: PathBuf,

        /// Number of receivers
        #[arg(short, long, default_value_t = 2)]
        receivers: usize,

        /// Disable the encrypted envelope
        #[arg(long)]
        no_encrypt: bool,

        /// Sever the first receiver's channel after this many chunks
        #[arg(long)]
        interrupt_after: Option<u64>,

        /// Directory to write received copies into
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Room name
        #[arg(long, default_value = "demo")]
        room: String,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to the configuration file path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::load_or_default(&config_path)?
    };

    init_logging(cli.verbose, config.logging.level.as_str());
    config.validate()?;

    match cli.command {
        Commands::Demo {
            file,
            receivers,
            no_encrypt,
            interrupt_after,
            output,
            room,
        } => {
            let mut config = config;
            if no_encrypt {
                config.peer.encryption = false;
            }
            let options = DemoOptions {
                file,
                receivers,
                interrupt_after,
                output,
                room,
            };
            run_demo(options, &config).await?;
        }
        Commands::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save(&config_path)?;
                println!("# written to {}", config_path.display());
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct DemoOptions {
    file: PathBuf,
    receivers: usize,
    interrupt_after: Option<u64>,
    output: Option<PathBuf>,
    room: String,
}

/// Outcome reported by a receiver task
struct Delivery {
    receiver: PeerId,
    result: Result<Vec<u8>, String>,
}

struct DemoNode {
    registry: SessionRegistry,
    events: EventStream,
    client: Arc<RelayClient>,
}

async fn spawn_node(
    hub: &RelayHub,
    network: &MemoryNetwork,
    name: &str,
    config: &Config,
) -> anyhow::Result<DemoNode> {
    let (client, signaling_events) = RelayClient::connect(hub, name).await?;
    let client = Arc::new(client);
    let local = peerdrop_discovery::SignalingClient::local_id(client.as_ref()).clone();
    let factory = network.factory(local);

    let (registry, events) = SessionRegistry::new(config.core(), client.clone(), Arc::new(factory))?;
    registry.start(signaling_events).await;
    Ok(DemoNode {
        registry,
        events,
        client,
    })
}

async fn run_demo(options: DemoOptions, config: &Config) -> anyhow::Result<()> {
    if options.receivers == 0 {
        anyhow::bail!("at least one receiver is required");
    }
    let source = FileSource::open(&options.file)
        .await
        .with_context(|| format!("opening {}", options.file.display()))?;
    let file_size = peerdrop_core::ChunkSource::len(&source);
    let expected_digest = digest_source(&source, config.transfer.chunk_size).await?;

    println!("{} {}", style("File:").bold(), options.file.display());
    println!("{} {}", style("Size:").bold(), format_bytes(file_size));
    println!("{} {}", style("Digest:").bold(), expected_digest);
    println!(
        "{} {}",
        style("Encryption:").bold(),
        if config.peer.encryption { "on" } else { "off" }
    );
    println!();

    let hub = RelayHub::new();
    let network = MemoryNetwork::new();

    let sender = spawn_node(&hub, &network, "sender", config).await?;
    sender.registry.join_room(&options.room).await?;

    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
    let mut receiver_ids = Vec::with_capacity(options.receivers);
    let mut receiver_nodes = Vec::with_capacity(options.receivers);
    for i in 0..options.receivers {
        let node = spawn_node(&hub, &network, &format!("receiver-{i}"), config).await?;
        node.registry.join_room(&options.room).await?;
        receiver_ids.push(node.registry.local_id().clone());

        let DemoNode {
            registry,
            events,
            client,
        } = node;
        let local = registry.local_id().clone();
        let tx = delivery_tx.clone();
        tokio::spawn(receive_loop(local, events, tx));
        receiver_nodes.push((registry, client));
    }
    drop(delivery_tx);

    wait_for_connections(&sender.registry, receiver_ids.len()).await?;
    println!(
        "{} {} receiver(s) connected",
        style("✓").green(),
        receiver_ids.len()
    );

    let started = Instant::now();
    let file_id = sender.registry.send_path(&options.file).await?;
    tracing::info!(file_id = %file_id, "Offer sent");

    let interrupt = options
        .interrupt_after
        .map(|chunks| (receiver_ids[0].clone(), chunks.saturating_mul(config.transfer.chunk_size as u64)));
    let watcher = tokio::spawn(watch_sender(
        sender.events,
        file_size,
        interrupt,
        network.clone(),
        sender.registry.local_id().clone(),
    ));

    let mut failures = 0usize;
    let mut delivered = 0usize;
    while delivered + failures < receiver_ids.len() {
        let Some(delivery) = delivery_rx.recv().await else {
            break;
        };
        match delivery.result {
            Ok(data) => {
                let digest = digest_hex(&data);
                if digest == expected_digest {
                    delivered += 1;
                    println!(
                        "{} {} received {} (digest verified)",
                        style("✓").green(),
                        delivery.receiver.short(),
                        format_bytes(data.len() as u64)
                    );
                    if let Some(dir) = &options.output {
                        write_copy(dir, &delivery.receiver, &options.file, &data).await?;
                    }
                } else {
                    failures += 1;
                    println!(
                        "{} {} digest mismatch: {digest}",
                        style("✗").red(),
                        delivery.receiver.short()
                    );
                }
            }
            Err(error) => {
                failures += 1;
                println!(
                    "{} {} failed: {error}",
                    style("✗").red(),
                    delivery.receiver.short()
                );
            }
        }
    }

    watcher.abort();
    let elapsed = started.elapsed();
    println!();
    println!(
        "{} {delivered}/{} deliveries in {:.2}s",
        style("Done:").bold(),
        receiver_ids.len(),
        elapsed.as_secs_f64()
    );

    sender.registry.shutdown().await;
    for (registry, _client) in receiver_nodes {
        registry.shutdown().await;
    }

    if failures > 0 {
        anyhow::bail!("{failures} receiver(s) did not get a verified copy");
    }
    Ok(())
}

async fn wait_for_connections(registry: &SessionRegistry, expected: usize) -> anyhow::Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    while registry.connected_peers().len() < expected {
        if Instant::now() >= deadline {
            anyhow::bail!(
                "only {}/{expected} receivers connected within {}s",
                registry.connected_peers().len(),
                CONNECT_TIMEOUT.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Accept every offer and report the first completed or failed transfer.
async fn receive_loop(
    local: PeerId,
    mut events: EventStream,
    deliveries: mpsc::UnboundedSender<Delivery>,
) {
    while let Some(event) = events.recv().await {
        let result = match event {
            Event::FileOffered { offer, decision } => {
                tracing::info!(receiver = %local, file = %offer.file_name, "Accepting offer");
                decision.accept();
                continue;
            }
            Event::TransferCompleted {
                data: Some(data), ..
            } => Ok(data),
            Event::TransferFailed { error, .. } => Err(error.to_string()),
            Event::TransferCancelled { .. } => Err("cancelled".to_string()),
            _ => continue,
        };
        let _ = deliveries.send(Delivery {
            receiver: local.clone(),
            result,
        });
        return;
    }
}

/// Render the sender's progress and optionally cut one receiver's channel
/// once it has been sent `interrupt` bytes.
async fn watch_sender(
    mut events: EventStream,
    file_size: u64,
    mut interrupt: Option<(PeerId, u64)>,
    network: MemoryNetwork,
    local: PeerId,
) {
    let mut bars = TransferBars::new(file_size);
    while let Some(event) = events.recv().await {
        match event {
            Event::TransferProgress(progress) => {
                bars.update(&progress);
                if let Some((peer, threshold)) = &interrupt {
                    if progress.peer == *peer && progress.bytes >= *threshold {
                        let severed = network.sever(&local, peer).await;
                        tracing::warn!(peer = %peer, channels = severed, "Simulated channel loss");
                        bars.note(peer.short(), "(interrupted)");
                        interrupt = None;
                    }
                }
                if progress.bytes >= file_size {
                    bars.finish(progress.peer.short(), format!("{} ✓", progress.peer.short()));
                }
            }
            Event::TransferPaused { .. } => tracing::info!("Transfer paused"),
            Event::TransferResumed { .. } => tracing::info!("Transfer resumed"),
            Event::TransferFailed { error, .. } => {
                tracing::error!(error = %error, "Transfer failed");
                bars.abandon();
            }
            Event::PeerStateChanged { peer, state } => {
                tracing::debug!(peer = %peer, state = %state, "Peer state");
            }
            _ => {}
        }
    }
}

async fn write_copy(
    dir: &std::path::Path,
    receiver: &PeerId,
    original: &std::path::Path,
    data: &[u8],
) -> anyhow::Result<()> {
    let name = original
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "received".to_string());
    let target_dir = dir.join(receiver.short());
    tokio::fs::create_dir_all(&target_dir).await?;
    let target = target_dir.join(name);
    tokio::fs::write(&target, data)
        .await
        .with_context(|| format!("writing {}", target.display()))?;
    Ok(())
}
