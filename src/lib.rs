pub mod adapters;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod scheduler;
pub mod snapshot;
pub mod sync;
mod utils;

use anyhow::{Context, Result};
use chrono::Duration;
use tokio_util::sync::CancellationToken;

use adapters::{FeedAdapter, GameAdapter, HttpSourceClient};
use cache::PageCache;
use config::{AppConfig, SourceConfig, SourceKind};
use db::Database;
use scheduler::PollScheduler;
use snapshot::SnapshotStore;

pub use utils::init_logging;

/// Shared handles an HTTP layer embeds alongside the sync loops.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub page_cache: PageCache,
}

impl AppState {
    pub fn bootstrap(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;
        let db = Database::new(config.database_path())?;
        let page_cache = PageCache::new(&config.cache);

        Ok(Self {
            config,
            db,
            page_cache,
        })
    }
}

/// Build and schedule one adapter per enabled source. Returns how many were
/// scheduled; a misconfigured source is logged and skipped.
pub fn schedule_sources(state: &AppState, scheduler: &mut PollScheduler) -> usize {
    let mut scheduled = 0;
    for (name, source) in &state.config.sources {
        match schedule_source(state, scheduler, name, source) {
            Ok(true) => scheduled += 1,
            Ok(false) => {}
            Err(err) => log::error!("[{name}] not scheduled: {err:#}"),
        }
    }
    scheduled
}

fn schedule_source(
    state: &AppState,
    scheduler: &mut PollScheduler,
    name: &str,
    source: &SourceConfig,
) -> Result<bool> {
    let interval = source.poll_interval();
    if interval.is_zero() {
        log::info!("[{name}] disabled (intervalMins = 0)");
        return Ok(false);
    }

    let client = HttpSourceClient::new(source.http_client_config())?;
    let store = SnapshotStore::new(state.config.snapshot_path(name));

    let scheduled = match source.kind {
        SourceKind::Feed => {
            let adapter = FeedAdapter::new(
                name,
                client,
                state.db.clone(),
                store,
                source.native_order(),
            );
            scheduler.schedule(name, interval, adapter)
        }
        SourceKind::Game => {
            let poll_interval = Duration::from_std(interval)
                .with_context(|| format!("poll interval of {name} out of range"))?;
            let adapter = GameAdapter::new(name, client, state.db.clone(), store, poll_interval)
                .with_device_id(source.device_id.clone());
            scheduler.schedule(name, interval, adapter)
        }
    };
    Ok(scheduled)
}

/// Run the sync daemon until ctrl-c.
pub async fn run() -> Result<()> {
    init_logging();
    log::info!("lifelog-sync starting up...");

    let state = AppState::bootstrap(AppConfig::from_env())?;
    let cancel_token = CancellationToken::new();
    let sweeper = state.page_cache.spawn_sweeper(cancel_token.child_token());

    let mut scheduler = PollScheduler::new();
    let scheduled = schedule_sources(&state, &mut scheduler);
    log::info!("{scheduled} sources scheduled");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    log::info!("shutting down");

    cancel_token.cancel();
    scheduler.shutdown().await?;
    if let Some(handle) = sweeper {
        handle.await.context("cache sweeper failed to join")?;
    }
    Ok(())
}
