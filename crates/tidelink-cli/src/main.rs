//! Tidelink CLI
//!
//! Thin wrapper around tidelink-core for inspecting a device's outbox,
//! flushing it against a backend and simulating a crew mesh locally.
//!
//! ## Usage
//!
//! ```bash
//! # Show data directory and queue size
//! tidelink info
//!
//! # List queued events
//! tidelink outbox list
//!
//! # Queue an event by hand
//! tidelink outbox append --kind task_completion --entity 42 --payload '{"points":10}'
//!
//! # Upload everything queued
//! tidelink flush --endpoint https://api.example.com
//!
//! # Run five simulated devices in a line and watch them converge
//! tidelink simulate --devices 5 --rounds 2
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tidelink_core::{
    AppendOutcome, DeviceId, EntityKind, EventId, EventType, HttpRemote, LocalIdentity,
    MemoryRadio, Operation, Outbox, PushOutcome, RemoteEndpoint, SyncEvent, SyncManager,
    TeamNode, TidelinkConfig, OUTBOX_FILE,
};
use tokio::sync::watch;

/// Tidelink - offline-first crew sync
#[derive(Parser)]
#[command(name = "tidelink")]
#[command(version = "0.1.0")]
#[command(about = "Tidelink - offline-first outbox sync and proximity crew mesh")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.tidelink/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file; missing fields use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show data directory and outbox size
    Info,

    /// Inspect or edit the local outbox
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },

    /// Push every queued event to the backend once
    Flush {
        /// Backend base URL (events are posted to <endpoint>/events)
        #[arg(short, long)]
        endpoint: String,
    },

    /// Run simulated devices over an in-process radio
    Simulate {
        /// Number of devices, placed in a line
        #[arg(long, default_value_t = 3)]
        devices: usize,

        /// Rounds of location, chat and completion per device
        #[arg(long, default_value_t = 1)]
        rounds: usize,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[derive(Subcommand)]
enum OutboxAction {
    /// List pending events, oldest first
    List,
    /// Print the number of pending events
    Count,
    /// Queue an event
    Append {
        /// Entity kind, e.g. task_completion
        #[arg(short, long)]
        kind: String,
        /// Operation: create, update or delete
        #[arg(short, long, default_value = "create")]
        op: String,
        /// ID of the mutated entity
        #[arg(short, long)]
        entity: String,
        /// JSON body
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// Explicit event ID (defaults to a fresh ULID)
        #[arg(long)]
        id: Option<String>,
    },
    /// Remove one pending event, or every one if no ID is given
    Clear {
        /// Event ID to remove
        id: Option<String>,
    },
}

/// Initialize tracing
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.tidelink/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tidelink")
        .join("data")
}

fn load_config(path: Option<&Path>) -> Result<TidelinkConfig> {
    match path {
        Some(path) => TidelinkConfig::load(path).context("Failed to load config"),
        None => Ok(TidelinkConfig::default()),
    }
}

fn open_outbox(data_dir: &Path) -> Result<Outbox> {
    let path = data_dir.join(OUTBOX_FILE);
    Outbox::open(&path).with_context(|| format!("Failed to open outbox at {}", path.display()))
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn radio_id(index: usize) -> DeviceId {
    DeviceId::from(format!("radio-{}", index))
}

/// Remote for simulated devices, which never go online
struct Unreachable;

#[async_trait]
impl RemoteEndpoint for Unreachable {
    async fn push(&self, _event: &SyncEvent) -> PushOutcome {
        PushOutcome::Transient("no backend in simulation".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            let outbox = open_outbox(&data_dir)?;
            println!("Tidelink v0.1.0");
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Pending events: {}", outbox.pending_count()?);
            println!();
            println!("Sync:");
            println!("  Push timeout: {:?}", config.sync.push_timeout());
            println!(
                "  Backoff: {:?} .. {:?}",
                config.sync.backoff_base(),
                config.sync.backoff_cap()
            );
            println!("Transport:");
            println!("  Scan interval: {:?}", config.transport.scan_interval());
            println!("  Connect threshold: {} dBm", config.transport.connect_threshold_dbm);
        }

        Commands::Outbox { action } => {
            let outbox = open_outbox(&data_dir)?;
            match action {
                OutboxAction::List => {
                    let events = outbox.pending()?.collect::<Result<Vec<_>, _>>()?;
                    if events.is_empty() {
                        println!("Outbox is empty.");
                    } else {
                        println!("Pending events ({}):", events.len());
                        println!();
                        for event in events {
                            println!("  {} {} {}", event.id, event.event_type, event.entity_id);
                            println!("    Created: {}", format_millis(event.created_at));
                            if event.sync_attempts > 0 {
                                let last = event
                                    .last_attempt_at
                                    .map(format_millis)
                                    .unwrap_or_else(|| "-".to_string());
                                println!("    Attempts: {} (last {})", event.sync_attempts, last);
                            }
                        }
                    }
                }

                OutboxAction::Count => {
                    println!("{}", outbox.pending_count()?);
                }

                OutboxAction::Append {
                    kind,
                    op,
                    entity,
                    payload,
                    id,
                } => {
                    let kind: EntityKind = kind
                        .parse()
                        .map_err(|e| anyhow::anyhow!("Invalid entity kind: {}", e))?;
                    let op: Operation = op
                        .parse()
                        .map_err(|e| anyhow::anyhow!("Invalid operation: {}", e))?;
                    let body: serde_json::Value =
                        serde_json::from_str(&payload).context("Payload must be valid JSON")?;
                    let mut event =
                        SyncEvent::new(EventType::new(kind, op), entity, serde_json::to_vec(&body)?);
                    if let Some(id) = id {
                        event = event.with_id(EventId::from(id));
                    }
                    match outbox.append(&event)? {
                        AppendOutcome::Appended => {
                            println!("Queued {} for {}", event.event_type, event.entity_id);
                            println!("  ID: {}", event.id);
                        }
                        AppendOutcome::Duplicate => {
                            println!("Already queued: {}", event.id);
                        }
                    }
                }

                OutboxAction::Clear { id: Some(id) } => {
                    if outbox.remove(&EventId::from(id.clone()))? {
                        println!("Removed {}", id);
                    } else {
                        anyhow::bail!("No pending event with ID {}", id);
                    }
                }

                OutboxAction::Clear { id: None } => {
                    let ids = outbox
                        .pending()?
                        .map(|event| event.map(|e| e.id))
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut removed = 0;
                    for id in &ids {
                        if outbox.remove(id)? {
                            removed += 1;
                        }
                    }
                    println!("Removed {} events", removed);
                }
            }
        }

        Commands::Flush { endpoint } => {
            let outbox = open_outbox(&data_dir)?;
            let remote = HttpRemote::new(endpoint, config.sync.push_timeout())?;
            println!("Flushing to {}", remote.events_url());

            // A one-shot flush assumes the network is there and lets the push decide.
            let (_online_tx, online_rx) = watch::channel(true);
            let manager = SyncManager::new(outbox, Arc::new(remote), online_rx, config.sync);
            let report = manager
                .force_sync()
                .await
                .context("Sync cycle could not start")?;

            println!("  Pushed: {}", report.pushed);
            println!("  Rejected: {}", report.rejected);
            println!("  Remaining: {}", report.remaining);
            println!("  Status: {}", report.status);
        }

        Commands::Simulate {
            devices,
            rounds,
            timeout_secs,
        } => {
            simulate(config, devices, rounds, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}

/// Start `devices` nodes in a line; each round every node shares a position,
/// posts a chat line and records a completion. Waits until every node has
/// seen all of it.
async fn simulate(
    config: TidelinkConfig,
    devices: usize,
    rounds: usize,
    timeout: Duration,
) -> Result<()> {
    if devices < 2 {
        anyhow::bail!("Need at least 2 devices to simulate a mesh");
    }
    let radio = MemoryRadio::new(185);
    let (_online_tx, online_rx) = watch::channel(false);

    let mut nodes = Vec::with_capacity(devices);
    for i in 0..devices {
        let name = format!("crew-{}", i);
        let link = radio.station(radio_id(i), name.clone());
        let node = TeamNode::start(
            LocalIdentity::new(name.clone(), name),
            config.clone(),
            Outbox::in_memory()?,
            Arc::new(link),
            Arc::new(Unreachable),
            online_rx.clone(),
        );
        nodes.push(node);
    }
    for i in 1..devices {
        radio.set_signal(radio_id(i - 1), radio_id(i), -60.0);
    }

    let started = Instant::now();
    let deadline = started + timeout;
    let linked = |nodes: &[TeamNode]| {
        (1..nodes.len()).all(|i| {
            nodes[i - 1].transport().is_connected(&radio_id(i))
                && nodes[i].transport().is_connected(&radio_id(i - 1))
        })
    };
    while !linked(&nodes) {
        if Instant::now() > deadline {
            anyhow::bail!("Devices did not link up within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    println!("Linked {} devices in {:?}", devices, started.elapsed());

    for round in 0..rounds {
        for (i, node) in nodes.iter().enumerate() {
            let team = node.team();
            // Crew spread along the waterfront, drifting north each round.
            let latitude = 52.37 + 0.001 * round as f64;
            let longitude = 4.89 + 0.002 * i as f64;
            team.share_location(latitude, longitude, Some(10.0)).await?;
            team.send_chat(format!("{} checking in, round {}", team.identity().display_name, round))
                .await?;
            team.record_completion(format!("task-{}-{}", round, i), Some(10))
                .await?;
        }
    }

    let expected = (devices * rounds).min(config.team.completions_capacity);
    let expected_chat = (devices * rounds).min(config.team.chat_capacity);
    loop {
        let converged = nodes.iter().all(|n| {
            let team = n.team();
            team.completions().len() >= expected
                && team.chat().len() >= expected_chat
                && team.roster().iter().filter(|m| m.position.is_some()).count() == devices
        });
        if converged {
            break;
        }
        if Instant::now() > deadline {
            anyhow::bail!("Mesh did not converge within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("Mesh converged in {:?}", started.elapsed());
    println!();
    for node in &nodes {
        let team = node.team();
        println!(
            "  {}: {} completions, {} chat lines, {} queued",
            team.identity().user_id,
            team.completions().len(),
            team.chat().len(),
            node.outbox().pending_count()?
        );
    }

    println!();
    println!("Roster (as seen by {}):", nodes[0].team().identity().user_id);
    for member in nodes[0].team().roster() {
        let position = member
            .position
            .map(|p| format!("{:.4}, {:.4}", p.latitude, p.longitude))
            .unwrap_or_else(|| "unknown".to_string());
        println!("  {} {} @ {}", member.user_id, member.display_name, position);
    }

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
