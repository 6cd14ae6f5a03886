//! eventship - operator CLI for the durable event queue
//!
//! This tool provides commands for:
//! - Checking client configuration and pending batches
//! - Sending a single event
//! - Uploading everything left on disk by earlier sessions
//!
//! Uses XDG Base Directory specification for file locations:
//! - Batches: $XDG_DATA_HOME/eventship/<write_key>/ (~/.local/share/eventship/)
//! - Config: $XDG_CONFIG_HOME/eventship/config.toml (~/.config/eventship/config.toml)
//! - Logs: $XDG_STATE_HOME/eventship/ (~/.local/state/eventship/)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eventship_core::{Client, Config, Event, FileStorage, RunStop, Storage, UploadSummary};

#[derive(Parser)]
#[command(name = "eventship")]
#[command(about = "Queue and upload analytics events")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the XDG default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and pending batch count
    Status,

    /// Queue one track event and upload it
    Track {
        /// Event name
        name: String,

        /// Event properties as a JSON object
        #[arg(short, long)]
        properties: Option<String>,

        /// Anonymous id for this event (default: the persisted one)
        #[arg(short, long)]
        anonymous_id: Option<String>,
    },

    /// Upload every pending batch
    Flush,

    /// List pending batch files
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    // Held for the whole run so buffered log lines are written on exit.
    let _log_guard = if args.verbose {
        Some(eventship_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config).await,
        Command::Track {
            name,
            properties,
            anonymous_id,
        } => cmd_track(config, &name, properties.as_deref(), anonymous_id).await,
        Command::Flush => cmd_flush(config).await,
        Command::Pending => cmd_pending(&config).await,
    }
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("eventship Configuration");
    println!("=======================");
    println!();

    let client = &config.client;

    println!(
        "Write Key:       {}",
        if client.write_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Data Plane URL:  {}",
        client.data_plane_url.as_deref().unwrap_or("<not set>")
    );
    println!("Flush At:        {} events", config.queue.flush_at);
    println!("Flush Interval:  {} ms", config.queue.flush_interval_ms);
    println!("Storage Root:    {}", config.storage_root().display());
    println!("Log File:        {}", Config::log_path().display());

    if !client.is_ready() {
        println!();
        println!("Client is not configured. Set it in config.toml:");
        println!();
        println!("  [client]");
        println!("  write_key = \"your-write-key\"");
        println!("  data_plane_url = \"https://your-data-plane.example.com\"");
        return Ok(());
    }

    if let Err(e) = client.validate() {
        println!();
        println!("Configuration error: {}", e);
        return Ok(());
    }

    let storage = open_storage(config).await?;
    println!();
    println!("Pending Batches: {}", storage.pending_batches().await.len());

    Ok(())
}

async fn cmd_track(
    config: Config,
    name: &str,
    properties: Option<&str>,
    anonymous_id: Option<String>,
) -> Result<()> {
    let properties = match properties {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw)
            .context("--properties is not valid JSON")?
        {
            serde_json::Value::Object(map) => map,
            _ => bail!("--properties must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };

    let client = build_client(config).await?;

    let mut event = Event::track(name).with_properties(properties);
    if let Some(anonymous_id) = anonymous_id {
        event = event.with_anonymous_id(anonymous_id);
    }
    let message_id = event.message_id.clone();
    client.put(event).context("failed to queue event")?;

    println!("Queued event {} ({})", name, message_id);
    let summary = client.flush_and_wait().await.context("flush failed")?;
    print_summary(&summary);
    client.shutdown();
    Ok(())
}

async fn cmd_flush(config: Config) -> Result<()> {
    let client = build_client(config).await?;

    let pending = client.pending_batches().await?.len();
    println!("Flushing {} pending batch(es)...", pending);

    let summary = client.flush_and_wait().await.context("flush failed")?;
    print_summary(&summary);
    client.shutdown();
    Ok(())
}

async fn cmd_pending(config: &Config) -> Result<()> {
    config
        .client
        .checked_write_key()
        .context("a write key is required to locate batch storage")?;
    let storage = open_storage(config).await?;
    let pending = storage.pending_batches().await;

    if pending.is_empty() {
        println!("No pending batches.");
        return Ok(());
    }

    println!("Pending batches ({}):", pending.len());
    for id in pending {
        println!("  {}", id);
    }
    Ok(())
}

async fn open_storage(config: &Config) -> Result<FileStorage> {
    let write_key = config.client.checked_write_key()?;
    let directory = config.storage_dir(write_key);
    FileStorage::open(&directory, write_key, config.queue.max_batch_bytes)
        .await
        .with_context(|| format!("failed to open batch storage at {}", directory.display()))
}

async fn build_client(mut config: Config) -> Result<Client> {
    config
        .client
        .validate()
        .context("client is not configured (see `eventship status`)")?;
    // The explicit flush below uploads everything; a second startup run is redundant.
    config.queue.startup_flush = false;
    Client::builder(config)
        .build()
        .await
        .context("failed to start client")
}

fn print_summary(summary: &UploadSummary) {
    println!();
    println!("Upload complete:");
    println!("  Batches uploaded: {}", summary.uploaded);
    println!("  Batches dropped:  {}", summary.dropped);
    println!("  Send attempts:    {}", summary.attempts);

    match summary.stopped {
        Some(RunStop::InvalidWriteKey) => {
            println!();
            println!("The data plane rejected the write key; local data was deleted.");
        }
        Some(RunStop::SourceDisabled) => {
            println!();
            println!("The source is disabled; pending batches were kept.");
        }
        Some(RunStop::Disabled) | Some(RunStop::Shutdown) | None => {}
    }
}
