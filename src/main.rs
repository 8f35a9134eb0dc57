//! WolfPeer - Replication Peer Metadata Store
//!
//! Command line front end for inspecting and managing the replication
//! peers stored in the coordination tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpeer::config::WolfPeerConfig;
use wolfpeer::error::{Error, Result};
use wolfpeer::maintenance;
use wolfpeer::peer::{
    PeerConfig, PeerEnableState, PeerId, ServerName, SyncReplicationState,
};
use wolfpeer::storage::PeerStorage;

/// Attempts for a read-modify-write before giving up
const UPDATE_ATTEMPTS: u32 = 5;

/// WolfPeer - Replication Peer Metadata Store
#[derive(Parser)]
#[command(name = "wolfpeer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfpeer.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfpeer.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// List replication peers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one peer's config and state
    Show {
        peer_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Add a replication peer
    Add {
        peer_id: String,

        /// Remote cluster key (quorum:port:/base)
        #[arg(long)]
        cluster_key: String,

        /// Create the peer disabled
        #[arg(long)]
        disabled: bool,

        /// Initial sync replication state
        #[arg(long, default_value = "none")]
        sync_state: String,

        /// Replicate only these namespaces (comma separated)
        #[arg(long, value_delimiter = ',')]
        namespaces: Vec<String>,

        /// Replicate only this table, as `table` or `table=cf1,cf2` (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Skip these namespaces (comma separated)
        #[arg(long, value_delimiter = ',')]
        exclude_namespaces: Vec<String>,

        /// Skip this table, as `table` or `table=cf1,cf2` (repeatable)
        #[arg(long = "exclude-table")]
        exclude_tables: Vec<String>,

        /// Bandwidth limit in bytes per second (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        bandwidth: u64,

        /// Keep per-region edit ordering
        #[arg(long)]
        serial: bool,

        /// Remote WAL directory for sync replication
        #[arg(long)]
        remote_wal_dir: Option<String>,

        /// Endpoint configuration entry `key=value` (repeatable)
        #[arg(long = "set")]
        settings: Vec<String>,
    },

    /// Change a peer's bandwidth, serial flag or configuration entries
    Update {
        peer_id: String,

        #[arg(long)]
        bandwidth: Option<u64>,

        #[arg(long)]
        serial: Option<bool>,

        /// Endpoint configuration entry `key=value` (repeatable)
        #[arg(long = "set")]
        settings: Vec<String>,
    },

    /// Remove a replication peer and its queues
    Remove { peer_id: String },

    /// Enable a peer
    Enable { peer_id: String },

    /// Disable a peer
    Disable { peer_id: String },

    /// Show or set a peer's sync replication state
    SyncState {
        peer_id: String,

        /// New state (none, active, downgrade-active, standby)
        state: Option<String>,

        /// Operate on the pending state of a two-phase transition
        #[arg(long)]
        pending: bool,
    },

    /// Promote a peer's pending sync replication state to current
    TransitSyncState { peer_id: String },

    /// Show replication queue positions of a peer
    Queues { peer_id: String },

    /// Remove a source server's queue entry
    DropQueue { peer_id: String, server: String },

    /// Check every peer for missing or corrupt nodes
    Check {
        /// Remove peers left partially initialized
        #[arg(long)]
        repair: bool,
    },

    /// Stream peer changes until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
        command => {
            let loaded = WolfPeerConfig::from_file(&cli.config);
            let logging = loaded
                .as_ref()
                .map(|c| c.logging.clone())
                .unwrap_or_default();
            init_logging(
                cli.log_level.as_deref().unwrap_or(&logging.level),
                &logging.format,
            );

            let config = loaded.map_err(|e| report_config_error(&cli.config, e))?;
            let storage = config.open_storage()?;
            run_command(&storage, command).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn report_config_error(path: &Path, e: Error) -> Error {
    tracing::error!("Failed to load configuration from {:?}: {}", path, e);
    tracing::error!("Run `wolfpeer init` to create one");
    e
}

fn load_config(path: &Path) -> Result<WolfPeerConfig> {
    WolfPeerConfig::from_file(path).map_err(|e| report_config_error(path, e))
}

fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{:?} already exists", output)));
    }
    let config = WolfPeerConfig::new(node_id);
    std::fs::write(&output, config.to_toml()?)?;
    println!("Wrote configuration to {:?}", output);
    Ok(())
}

fn run_validate(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    println!("Configuration is valid");
    println!("  Node ID:       {}", config.node.id);
    println!("  Backend:       {:?}", config.coordination.backend);
    println!("  Peers root:    {}", config.path_layout().peers_root());
    println!("  Op timeout:    {:?}", config.operation_timeout());
    Ok(())
}

async fn run_command(storage: &PeerStorage, command: Commands) -> Result<()> {
    match command {
        Commands::List { json } => run_list(storage, json).await,
        Commands::Show { peer_id, json } => run_show(storage, &PeerId::new(peer_id)?, json).await,
        Commands::Add {
            peer_id,
            cluster_key,
            disabled,
            sync_state,
            namespaces,
            tables,
            exclude_namespaces,
            exclude_tables,
            bandwidth,
            serial,
            remote_wal_dir,
            settings,
        } => {
            let peer_id = PeerId::new(peer_id)?;
            let mut config = PeerConfig::new(cluster_key);
            if !namespaces.is_empty() || !tables.is_empty() {
                config = config.replicate_only(namespaces, parse_tables(&tables));
            } else {
                config = config.replicate_all_except(exclude_namespaces, parse_tables(&exclude_tables));
            }
            config = config.with_bandwidth(bandwidth).with_serial(serial);
            if let Some(dir) = remote_wal_dir {
                config = config.with_remote_wal_dir(dir);
            }
            for (key, value) in parse_settings(&settings)? {
                config = config.with_configuration(key, value);
            }
            config.validate()?;

            let enabled = PeerEnableState::from(!disabled);
            let sync_state: SyncReplicationState = sync_state.parse()?;
            storage.add_peer(&peer_id, &config, enabled, sync_state).await?;
            println!("Added peer {} ({})", peer_id, enabled);
            Ok(())
        }
        Commands::Update {
            peer_id,
            bandwidth,
            serial,
            settings,
        } => {
            let peer_id = PeerId::new(peer_id)?;
            let settings = parse_settings(&settings)?;
            run_update(storage, &peer_id, |config| {
                if let Some(bw) = bandwidth {
                    config.bandwidth = bw;
                }
                if let Some(s) = serial {
                    config.serial = s;
                }
                for (key, value) in settings.iter() {
                    config.configuration.insert(key.clone(), value.clone());
                }
            })
            .await
        }
        Commands::Remove { peer_id } => {
            let peer_id = PeerId::new(peer_id)?;
            storage.remove_peer(&peer_id).await?;
            println!("Removed peer {}", peer_id);
            Ok(())
        }
        Commands::Enable { peer_id } => {
            set_enable_state(storage, &PeerId::new(peer_id)?, PeerEnableState::Enabled).await
        }
        Commands::Disable { peer_id } => {
            set_enable_state(storage, &PeerId::new(peer_id)?, PeerEnableState::Disabled).await
        }
        Commands::SyncState {
            peer_id,
            state,
            pending,
        } => {
            let peer_id = PeerId::new(peer_id)?;
            match (state, pending) {
                (Some(state), false) => {
                    let state: SyncReplicationState = state.parse()?;
                    storage.set_sync_replication_state(&peer_id, state).await?;
                    println!("Peer {} sync replication state: {}", peer_id, state);
                }
                (Some(state), true) => {
                    let state: SyncReplicationState = state.parse()?;
                    storage.set_new_sync_replication_state(&peer_id, state).await?;
                    println!("Peer {} pending sync replication state: {}", peer_id, state);
                }
                (None, false) => {
                    let state = storage.get_sync_replication_state(&peer_id).await?;
                    println!("{}", state);
                }
                (None, true) => {
                    let state = storage.get_new_sync_replication_state(&peer_id).await?;
                    println!("{}", state);
                }
            }
            Ok(())
        }
        Commands::TransitSyncState { peer_id } => {
            let peer_id = PeerId::new(peer_id)?;
            let state = storage.transit_sync_replication_state(&peer_id).await?;
            println!("Peer {} is now {}", peer_id, state);
            Ok(())
        }
        Commands::Queues { peer_id } => {
            let peer_id = PeerId::new(peer_id)?;
            let servers = storage.list_queue_servers(&peer_id).await?;
            if servers.is_empty() {
                println!("No replication queues for peer {}", peer_id);
            }
            for server in servers {
                let name = ServerName::new(server)?;
                match storage.get_queue_entry(&peer_id, &name).await? {
                    Some(pos) => println!("{:<48} {} @ {}", name, pos.log_name, pos.offset),
                    None => println!("{:<48} (drained)", name),
                }
            }
            Ok(())
        }
        Commands::DropQueue { peer_id, server } => {
            let peer_id = PeerId::new(peer_id)?;
            storage
                .remove_queue_entry(&peer_id, &ServerName::new(server)?)
                .await?;
            println!("Queue entry removed");
            Ok(())
        }
        Commands::Check { repair } => run_check(storage, repair).await,
        Commands::Watch => run_watch(storage).await,
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

#[derive(Serialize)]
struct PeerSummary {
    peer_id: String,
    cluster_key: String,
    state: String,
    sync_state: String,
    bandwidth: u64,
}

async fn run_list(storage: &PeerStorage, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for peer_id in storage.list_peer_ids().await? {
        let config = storage.get_peer_config(&peer_id).await?;
        let state = storage.get_peer_enable_state(&peer_id).await?;
        let sync_state = storage.get_sync_replication_state(&peer_id).await?;
        rows.push(PeerSummary {
            peer_id: peer_id.to_string(),
            cluster_key: config.cluster_key,
            state: state.to_string(),
            sync_state: sync_state.to_string(),
            bandwidth: config.bandwidth,
        });
    }

    if json {
        println!("{}", to_json(&rows)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<10} {:<18} {:>12}  {}",
        "PEER", "STATE", "SYNC STATE", "BANDWIDTH", "CLUSTER KEY"
    );
    println!("{}", "-".repeat(80));
    for row in rows {
        println!(
            "{:<16} {:<10} {:<18} {:>12}  {}",
            row.peer_id, row.state, row.sync_state, row.bandwidth, row.cluster_key
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct PeerDetail {
    peer_id: String,
    state: String,
    sync_state: String,
    pending_sync_state: String,
    config_version: u32,
    config: PeerConfig,
}

async fn run_show(storage: &PeerStorage, peer_id: &PeerId, json: bool) -> Result<()> {
    let config = storage.get_peer_config_versioned(peer_id).await?;
    let detail = PeerDetail {
        peer_id: peer_id.to_string(),
        state: storage.get_peer_enable_state(peer_id).await?.to_string(),
        sync_state: storage.get_sync_replication_state(peer_id).await?.to_string(),
        pending_sync_state: storage
            .get_new_sync_replication_state(peer_id)
            .await?
            .to_string(),
        config_version: config.version,
        config: config.value,
    };

    if json {
        println!("{}", to_json(&detail)?);
        return Ok(());
    }

    let c = &detail.config;
    println!("Peer:               {}", detail.peer_id);
    println!("State:              {}", detail.state);
    println!("Sync state:         {} (pending {})", detail.sync_state, detail.pending_sync_state);
    println!("Cluster key:        {}", c.cluster_key);
    println!("Config version:     {}", detail.config_version);
    println!("Replicate all:      {}", c.replicate_all_user_tables);
    if c.replicate_all_user_tables {
        println!("Exclude namespaces: {:?}", c.exclude_namespaces);
        println!("Exclude tables:     {:?}", c.exclude_table_cfs);
    } else {
        println!("Namespaces:         {:?}", c.namespaces);
        println!("Tables:             {:?}", c.table_cfs);
    }
    println!("Bandwidth:          {}", c.bandwidth);
    println!("Serial:             {}", c.serial);
    if let Some(dir) = &c.remote_wal_dir {
        println!("Remote WAL dir:     {}", dir);
    }
    for (key, value) in c.configuration.iter() {
        println!("  {} = {}", key, value);
    }
    Ok(())
}

/// Read-modify-write with bounded retry on concurrent modification
async fn run_update<F>(storage: &PeerStorage, peer_id: &PeerId, apply: F) -> Result<()>
where
    F: Fn(&mut PeerConfig),
{
    let mut backoff = Duration::from_millis(50);
    for attempt in 1..=UPDATE_ATTEMPTS {
        let current = storage.get_peer_config_versioned(peer_id).await?;
        let mut config = current.value;
        apply(&mut config);
        config.validate()?;

        match storage
            .update_peer_config_if(peer_id, &config, current.version)
            .await
        {
            Ok(version) => {
                println!("Updated peer {} (config version {})", peer_id, version);
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < UPDATE_ATTEMPTS => {
                tracing::warn!("Update attempt {} for peer {} failed: {}", attempt, peer_id, e);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn set_enable_state(
    storage: &PeerStorage,
    peer_id: &PeerId,
    state: PeerEnableState,
) -> Result<()> {
    storage.set_peer_enable_state(peer_id, state).await?;
    println!("Peer {} is now {}", peer_id, state);
    Ok(())
}

async fn run_check(storage: &PeerStorage, repair: bool) -> Result<()> {
    let reports = maintenance::inspect_all(storage).await?;
    let mut problems = 0;
    for report in reports.iter() {
        let verdict = if report.is_healthy() {
            "ok"
        } else {
            problems += 1;
            if report.is_corrupt() {
                "CORRUPT"
            } else {
                "INCOMPLETE"
            }
        };
        println!(
            "{:<16} {:<10} config={:?} state={:?} sync={:?}",
            report.peer_id, verdict, report.config, report.enable_state, report.sync_state
        );
    }
    println!("{} peers checked, {} with problems", reports.len(), problems);

    if repair {
        let removed = maintenance::repair(storage, &reports).await?;
        for peer_id in removed.iter() {
            println!("Removed incomplete peer {}", peer_id);
        }
    }
    Ok(())
}

async fn run_watch(storage: &PeerStorage) -> Result<()> {
    storage.ensure_layout().await?;
    let mut watch = storage.watch_peers().await?;
    println!("Watching {} (Ctrl+C to stop)", storage.layout().peers_root());

    loop {
        tokio::select! {
            event = watch.next_event() => match event {
                Some(event) => {
                    let peer = storage
                        .layout()
                        .peer_id_of(&event.path)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<8} {:<16} {}", event.kind, peer, event.path);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watch.cancel();
    Ok(())
}

/// Parse `table` or `table=cf1,cf2` entries
fn parse_tables(entries: &[String]) -> Vec<(String, Vec<String>)> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((table, cfs)) => (
                table.to_string(),
                cfs.split(',')
                    .filter(|cf| !cf.is_empty())
                    .map(|cf| cf.to_string())
                    .collect(),
            ),
            None => (entry.to_string(), Vec::new()),
        })
        .collect()
}

fn parse_settings(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| Error::Config(format!("expected key=value, got {:?}", entry)))
        })
        .collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Config(format!("JSON output failed: {}", e)))
}
