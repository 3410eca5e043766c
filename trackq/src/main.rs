//! trackq - operator CLI for the durable tracking queue
//!
//! This tool provides commands for:
//! - Inspecting configuration, queue size and privacy state
//! - Appending raw request URLs
//! - Flushing the queue to disk and delivering it to the collector
//! - Wiping all tracking data
//!
//! Uses XDG Base Directory specification for file locations:
//! - Data: $XDG_DATA_HOME/trackq/ (~/.local/share/trackq/)
//! - Config: $XDG_CONFIG_HOME/trackq/config.toml (~/.config/trackq/config.toml)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use trackq_core::delivery::deliver_all_blocking;
use trackq_core::{Config, DurableQueue, Preferences, StagingStore, StorageConfig};

#[derive(Parser)]
#[command(name = "trackq")]
#[command(about = "Inspect and drive the durable tracking queue")]
#[command(version)]
struct Args {
    /// Write a log file to the XDG state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the data directory (queue file, staging file, preferences)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the XDG location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, queue size and privacy state
    Status,

    /// Append one request URL to the queue
    Enqueue {
        /// Request URL exactly as it should be sent
        url: String,
    },

    /// Write cached requests and the cursor to disk
    Flush,

    /// Deliver queued requests to the collector once
    Send,

    /// Remove every queued and staged request
    Clear,
}

/// Queue and preferences opened from the resolved storage settings
struct Store {
    storage: StorageConfig,
    prefs: Arc<Preferences>,
    queue: DurableQueue,
}

impl Store {
    fn open(storage: &StorageConfig) -> Result<Self> {
        let prefs = Arc::new(
            Preferences::open(&storage.preferences_path())
                .context("failed to open preferences database")?,
        );
        let queue = DurableQueue::open(storage.queue_path(), prefs.clone(), storage)
            .context("failed to open request queue")?;
        tracing::debug!(data_dir = %storage.resolve_data_dir().display(), "Opened queue store");
        Ok(Self {
            storage: storage.clone(),
            prefs,
            queue,
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = Some(data_dir);
    }

    let _log_guard = if args.verbose {
        Some(trackq_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let store = Store::open(&config.storage)?;

    match args.command {
        Command::Status => cmd_status(&config, &store),
        Command::Enqueue { url } => cmd_enqueue(&store, &url),
        Command::Flush => cmd_flush(&store),
        Command::Send => cmd_send(&config, &store),
        Command::Clear => cmd_clear(&store),
    }
}

fn cmd_status(config: &Config, store: &Store) -> Result<()> {
    let tracking = &config.tracking;

    println!("trackq status");
    println!("=============");
    println!();
    println!(
        "Track domain:    {}",
        if tracking.track_domain.is_empty() {
            "<not set>"
        } else {
            tracking.track_domain.as_str()
        }
    );
    println!(
        "Track ID:        {}",
        if tracking.track_id.is_empty() {
            "<not set>"
        } else {
            tracking.track_id.as_str()
        }
    );
    println!("Config version:  {}", tracking.version);
    println!("Send delay:      {}s", tracking.send_delay_secs);
    println!("Sampling rate:   {}", tracking.sampling);
    if let Err(e) = tracking.validate() {
        println!("Config problem:  {}", e);
    }
    println!();

    println!("Data directory:  {}", store.storage.resolve_data_dir().display());
    println!("Queue size:      {}", store.queue.size());
    println!(
        "Staged requests: {}",
        if StagingStore::new(store.storage.staging_path()).is_empty() {
            "none"
        } else {
            "pending"
        }
    );
    println!();

    let opted_out = store
        .prefs
        .is_opted_out()
        .context("failed to read opt-out flag")?;
    println!("Opted out:       {}", opted_out);
    match store
        .prefs
        .sampling_decision()
        .context("failed to read sampling decision")?
    {
        Some(decision) => println!(
            "Sampled out:     {} (rate {})",
            decision.excluded, decision.rate
        ),
        None => println!("Sampled out:     <not decided>"),
    }
    println!(
        "EverID:          {}",
        store
            .prefs
            .ever_id()
            .context("failed to read EverID")?
            .unwrap_or_else(|| "<not set>".to_string())
    );

    Ok(())
}

fn cmd_enqueue(store: &Store, url: &str) -> Result<()> {
    store.queue.enqueue(url);
    store.queue.flush();
    println!("Queued. Queue size: {}", store.queue.size());
    Ok(())
}

fn cmd_flush(store: &Store) -> Result<()> {
    store.queue.flush();
    println!("Flushed {} queued requests", store.queue.size());
    Ok(())
}

fn cmd_send(config: &Config, store: &Store) -> Result<()> {
    if store.queue.is_empty() {
        println!("Nothing to send.");
        return Ok(());
    }

    println!("Sending {} queued requests...", store.queue.size());
    let report = deliver_all_blocking(&store.queue, &config.delivery)
        .context("failed to run delivery")?;
    store.queue.flush();

    println!("Sent:      {}", report.sent);
    println!("Dropped:   {}", report.dropped);
    println!("Remaining: {}", store.queue.size());
    if report.interrupted {
        println!();
        println!("Delivery stopped on a network error; remaining requests stay queued.");
    }
    Ok(())
}

fn cmd_clear(store: &Store) -> Result<()> {
    let removed = store.queue.size();
    store.queue.clear_all_tracking_data();
    StagingStore::new(store.storage.staging_path()).delete();
    println!("Removed {} queued requests", removed);
    Ok(())
}
