/**
 * VIPER KERNEL - Point d'entrée du pipeline d'agrégation de nœuds
 *
 * RÔLE : Assemble config, datastore, source upstream, health checker, orchestrateur,
 * scheduler et API HTTP. Arrêt propre sur Ctrl-C (annulation des boucles puis join).
 *
 * ARCHITECTURE : poll/webhook → réconciliation → snapshot local + datastore REST ;
 * vérification périodique et health checks écrivent les statuts en retour.
 */

mod config;
mod health;
mod http;
mod identity;
mod lifecycle;
mod links;
mod models;
mod reconcile;
mod scoring;
mod state;
mod status;
mod store;
mod sync;
mod upstream;
mod webhook;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::load_config;
use crate::health::runner::HealthRunner;
use crate::health::HealthChecker;
use crate::http::{AppState, HttpAuth};
use crate::status::StatusTracker;
use crate::store::{RestStore, SnapshotStore, StoreError};
use crate::sync::{SchedulerIntervals, SyncOrchestrator, SyncScheduler, SyncSettings};
use crate::upstream::{FetchError, UpstreamClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("viper_kernel=info")),
        )
        .init();

    let cfg = load_config().await;

    let datastore = match RestStore::from_config(&cfg.datastore) {
        Ok(store) => Some(store),
        Err(StoreError::NotConfigured) => {
            warn!("[kernel] no datastore configured, writes stay local");
            None
        }
        Err(e) => return Err(e).context("building datastore client"),
    };

    let upstream = match UpstreamClient::from_config(&cfg.upstream) {
        Ok(client) => {
            info!("[kernel] upstream source {}", client.source_url());
            Some(client)
        }
        Err(FetchError::NotConfigured) => {
            warn!("[kernel] no upstream source configured, webhook only");
            None
        }
        Err(e) => return Err(e).context("building upstream client"),
    };

    let checker = Arc::new(
        HealthChecker::from_config(&cfg.health).context("building health checker")?,
    );

    let orchestrator = Arc::new(
        SyncOrchestrator::open(
            SyncSettings::from(&cfg.sync),
            SnapshotStore::new(&cfg.sync.snapshot_path),
            datastore.clone(),
            upstream,
            checker.clone(),
            cfg.scoring.clone(),
        )
        .await,
    );
    info!("[kernel] working set: {} nodes", orchestrator.working_set().len());

    let runner = Arc::new(HealthRunner::new(
        checker,
        datastore,
        cfg.datastore.upsert_batch_size,
        cfg.health.batch_size,
    ));
    let status = StatusTracker::new();

    let token = CancellationToken::new();
    let scheduler = SyncScheduler::start(
        orchestrator.clone(),
        runner.clone(),
        status.clone(),
        SchedulerIntervals::from_config(&cfg),
        token.clone(),
    );

    let app_state = AppState {
        orchestrator,
        runner,
        status,
        scheduler: scheduler.state_handle(),
        auth: Arc::new(HttpAuth::from(&cfg.http)),
    };
    if app_state.auth.api_key.is_none() {
        warn!("[kernel] VIPER_API_KEY not set - protected routes will deny every request");
    }

    let app = http::build_router(app_state);
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);

    let shutdown = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("[kernel] shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await
        .context("http server")?;

    scheduler.stop().await;
    info!("[kernel] bye");
    Ok(())
}
