mod broadcast;
mod cache;
mod config;
mod db;
mod error;
mod ingest;
mod model;
mod mqtt;
mod payload;
mod presence;
mod provision;
mod state;
mod web;
mod ws;

use anyhow::{Context, Result};
use std::{env, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use broadcast::Broadcaster;
use cache::SnapshotCache;
use db::Db;
use ingest::Ingestor;
use presence::PresenceTracker;
use provision::Provisioner;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:tanks.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Core services ───────────────────────────────────────────────
    let cache = Arc::new(SnapshotCache::warm(&db).await?);
    let broadcaster = Arc::new(Broadcaster::new(cfg.broadcast.subscriber_buffer));
    let provisioner = Arc::new(Provisioner::new(
        db.clone(),
        cache.clone(),
        broadcaster.clone(),
    ));

    // Seed [[units]] from the config file; the store stays the source of truth.
    config::apply(&cfg, &db, &provisioner).await?;

    let units = cache.len().await;
    if units == 0 {
        warn!("no units provisioned yet");
    }
    info!(units, db = %db_url, "store ready");

    let ingestor = Arc::new(Ingestor::new(
        db.clone(),
        cache.clone(),
        broadcaster.clone(),
        cfg.thresholds,
        cfg.limits.clone(),
    ));

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = state::new_shared();
    shared
        .write()
        .await
        .record_system(format!("hub started with {units} unit(s)"));

    // ── Presence sweep ──────────────────────────────────────────────
    let sweep_cancel = CancellationToken::new();
    let tracker = Arc::new(PresenceTracker::new(
        db.clone(),
        cache.clone(),
        broadcaster.clone(),
        shared.clone(),
        cfg.presence.sweep_interval(),
        cfg.presence.offline_timeout(),
    ));
    let sweep_task = tracker.spawn(sweep_cancel.clone());

    // ── Intake: HTTP + MQTT ─────────────────────────────────────────
    let shutdown = CancellationToken::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.web.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;
    let app_state = web::AppState {
        db: db.clone(),
        cache: cache.clone(),
        broadcaster: broadcaster.clone(),
        ingestor: ingestor.clone(),
        provisioner,
        shared: shared.clone(),
        shutdown: shutdown.clone(),
    };
    let web_task = tokio::spawn(web::serve(listener, app_state));

    let mqtt_task = if cfg.mqtt.enabled {
        Some(tokio::spawn(mqtt::run(
            cfg.mqtt.clone(),
            ingestor,
            shared.clone(),
            shutdown.clone(),
        )))
    } else {
        info!("mqtt ingestion disabled");
        None
    };

    shutdown_signal().await;

    // ── Shutdown: sweep, then intake, then store ────────────────────
    sweep_cancel.cancel();
    if let Err(e) = sweep_task.await {
        warn!(error = %e, "presence task ended abnormally");
    }

    shutdown.cancel();
    match web_task.await {
        Ok(Err(e)) => warn!(error = %format!("{e:#}"), "web server ended with error"),
        Err(e) => warn!(error = %e, "web task ended abnormally"),
        Ok(Ok(())) => {}
    }
    if let Some(task) = mqtt_task {
        if let Err(e) = task.await {
            warn!(error = %e, "mqtt task ended abnormally");
        }
    }

    broadcaster.close_all().await;
    db.close().await;
    info!("hub stopped");
    Ok(())
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
