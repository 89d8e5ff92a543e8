//! WebSocket server hosting collaborative document channels.
//!
//! Documents are persisted as JSON files under the data directory and
//! saved when their last subscriber leaves, on autosave, and on shutdown.

use anyhow::Context;
use clap::Parser;
use collab_sync::{ChannelConfig, ChannelRegistry, FileDocumentStore, ServerConfig, SyncServer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "sync-server", about = "Collaborative editing sync server")]
struct Args {
    /// Address to listen on, overriding the config file
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on, overriding the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding stored documents
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Contents of the configuration file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    channel: ChannelConfig,
}

impl AppConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sync_server=info,collab_sync=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let store = FileDocumentStore::new(&args.data_dir)
        .await
        .with_context(|| format!("opening data directory {}", args.data_dir.display()))?;
    tracing::info!("Storing documents in {}", store.base_path().display());

    let registry = ChannelRegistry::new(Arc::new(store), config.channel);
    let server = SyncServer::new(config.server, Arc::clone(&registry));
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    registry.shutdown_all().await;
    tracing::info!("All documents saved");
    Ok(())
}
