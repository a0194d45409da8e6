//! weftmeshd - weftmesh host daemon
//!
//! Serves the HTTP surface (§6) over a content store, cache, and roster, and
//! runs the periodic maintenance sweeps that keep the store's refcounts and
//! the in-memory caches honest.

mod config;
mod control;
mod http;
mod state;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weftmesh_roster::RosterManager;
use weftmesh_store::{Cache, Store};

use config::Config;
use control::ControlSession;
use state::{AppState, PlayerRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("weftmeshd=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("weftmeshd v{} starting on {}", env!("CARGO_PKG_VERSION"), config.listen);

    let store = match Store::open(&config.data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("failed to open content store at {}: {e}", config.data_dir.display());
            return ExitCode::FAILURE;
        }
    };

    let cache = Arc::new(Cache::with_default_ttl(Duration::from_secs(config.cache_ttl_secs)));
    let (roster, mut roster_events) = RosterManager::new();
    let roster = Arc::new(roster);
    let players = Arc::new(PlayerRegistry::default());
    let control = Arc::new(ControlSession::new(roster.clone(), store.clone(), config.local_identity.clone()));

    tokio::spawn(async move {
        while let Some(event) = roster_events.recv().await {
            debug!(?event, "roster event");
        }
    });

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        cache,
        roster,
        players,
        control,
        started_at: Instant::now(),
    };

    spawn_maintenance_task(state.clone());

    let app = http::router(state);
    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", config.listen);
            return ExitCode::FAILURE;
        }
    };

    info!("listening on {}", config.listen);
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        warn!(error = %e, "server exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}

fn spawn_maintenance_task(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(state.config.maintenance_interval_secs.max(1)));
        loop {
            ticker.tick().await;

            let stale_age = Duration::from_secs(state.config.manifest_stale_secs);
            match state.store.evict_stale_older_than(stale_age) {
                Ok(evicted) if !evicted.is_empty() => info!(count = evicted.len(), "evicted stale manifests"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "manifest eviction sweep failed"),
            }

            match state.store.sweep_orphans() {
                Ok(removed) if !removed.is_empty() => info!(count = removed.len(), "swept orphaned blobs"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "orphan sweep failed"),
            }

            if let Err(e) = state.store.stats() {
                warn!(error = %e, "failed to persist storage stats");
            }

            let expired = state.cache.cleanup();
            if expired > 0 {
                debug!(count = expired, "expired cache entries cleaned up");
            }

            state.roster.cleanup_stale();
        }
    });
}
