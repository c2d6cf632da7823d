//! Series Sync - scheduled, freshness-aware synchronization of external time series
//!
//! Refreshes each frequency class on its own cadence, persists one entry per
//! class, and serves the combined view over HTTP behind a response cache.

mod config;
mod error;
mod middleware;
mod server;
mod types;

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::server::{start_server, ServerState, SharedState};
use series_cache::{
    spawn_snapshot_pruning, Catalog, FileKvStore, FrequencyStore, HttpFetcher,
    PublicationCalendar, Reconstitution, RefreshExecutor, Scheduler, SnapshotManager,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("series_sync=info".parse()?)
        .add_directive("series_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Series Sync...");

    let config = Config::from_env()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Snapshot dir: {:?}", config.snapshot_dir);
    info!("Datasets file: {:?}", config.datasets_file);
    info!("Fetcher: {}", config.fetcher_base_url);
    info!(
        "Rate limit: {} calls per {}s",
        config.rate_limit.max_calls, config.rate_limit.window_secs
    );

    // Durable per-class store
    let kv = FileKvStore::new(config.cache_dir.clone());
    kv.init().await?;
    let store = Arc::new(FrequencyStore::new(Arc::new(kv)));

    let catalog_json = tokio::fs::read_to_string(&config.datasets_file).await?;
    let catalog = Arc::new(Catalog::from_json(&catalog_json, &config.slas)?);
    info!("Loaded {} datasets", catalog.len());

    let fetcher = Arc::new(HttpFetcher::new(
        &config.fetcher_base_url,
        config.fetcher_api_key.clone(),
    )?);

    let snapshots = Arc::new(SnapshotManager::new(config.snapshot_dir.clone()));
    snapshots.init().await?;

    let combined = Arc::new(Reconstitution::new(store.clone()));
    let executor = RefreshExecutor::new(catalog, fetcher, store, combined.clone())
        .with_calendar(PublicationCalendar::new(config.monthly_publish_window_days))
        .with_rate_limit(config.rate_limit)
        .with_timeout(config.refresh_timeout)
        .with_snapshots(snapshots.clone());

    let responses = Arc::new(config.response_cache.build());
    let scheduler = Arc::new(
        Scheduler::new(Arc::new(executor), config.slas.clone())
            .with_response_cache(responses.clone()),
    );

    // Background refresh jobs and snapshot retention
    scheduler.spawn(&config.cadences);
    spawn_snapshot_pruning(snapshots, config.snapshot_retention_days);

    let state: SharedState = Arc::new(ServerState::new(combined, scheduler, responses));

    // Start HTTP server (blocking)
    start_server(state, config.port)
        .await
        .map_err(|e| ServiceError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
