//! Implementation of the `callhook serve` command.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::memory::InMemoryStore;
use crate::adapters::sqlite::{initialize_database, SqliteDocumentStore};
use crate::domain::models::Config;
use crate::domain::ports::BackendStore;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::http::{serve, shutdown_signal};
use crate::infrastructure::logging::LoggerImpl;
use crate::services::{JsonCache, WebhookRouter};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Host to bind (overrides server.host)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Keep records in process memory instead of SQLite
    #[arg(long)]
    pub memory: bool,
}

async fn open_store(config: &Config, memory: bool) -> Result<Arc<dyn BackendStore>> {
    if memory {
        warn!("Using in-memory store; records are lost on exit");
        return Ok(Arc::new(InMemoryStore::new()));
    }

    let pool = initialize_database(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    info!(path = %config.database.path, "Database ready");
    Ok(Arc::new(SqliteDocumentStore::new(pool)))
}

pub async fn execute(args: ServeArgs, mut config: Config) -> Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    ConfigLoader::validate(&config)?;

    let _logger = LoggerImpl::init(&config.logging)?;

    let store = open_store(&config, args.memory).await?;
    let cache = Arc::new(JsonCache::from_config(&config.cache));
    let sweeper = cache.spawn_sweeper(config.cache.sweep_interval());
    let router = Arc::new(WebhookRouter::from_config(&config, store, Arc::clone(&cache)));

    let result = serve(&config.server, router, shutdown_signal()).await;

    sweeper.shutdown();
    info!(entries = cache.len(), "Webhook server stopped");
    result
}
