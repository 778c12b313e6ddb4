//! tutorchat-server - classroom chat server

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tutorchat::config::Config;
use tutorchat::server::ServerListener;
use tutorchat::store::{MemoryStore, SqliteStore, Store};

#[derive(Parser)]
#[command(name = "tutorchat-server")]
#[command(about = "tutorchat classroom chat server")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address override
    #[arg(long)]
    host: Option<String>,

    /// Port override
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database override
    #[arg(long)]
    database: Option<PathBuf>,

    /// Keep all data in memory
    #[arg(long)]
    in_memory: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(database) = cli.database {
        config.storage.database_path = Some(database);
    }
    if cli.in_memory {
        config.storage.in_memory = true;
    }

    let store: Arc<dyn Store> = if config.storage.in_memory {
        tracing::warn!("Using in-memory store; nothing will be persisted");
        Arc::new(MemoryStore::new())
    } else {
        let path = config.database_path();
        tracing::info!("Opening database {}", path.display());
        Arc::new(
            SqliteStore::open(&path)
                .with_context(|| format!("Failed to open database {}", path.display()))?,
        )
    };

    // Rooms and timers do not survive a restart, so neither may their chats
    let stale = store.clear_active_chats()?;
    if stale > 0 {
        tracing::info!("Cleared {} stale active chat(s)", stale);
    }

    let server = ServerListener::bind(config, store).await?;
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    server.run(shutdown_rx).await
}
