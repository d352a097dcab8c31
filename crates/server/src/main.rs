// crates/server/src/main.rs
//! Claude-remote server binary: the composition root.
//!
//! Wires config → store → bus → background tasks → HTTP, exactly once.
//! Exits 0 on SIGINT-driven shutdown, non-zero when startup prerequisites
//! are missing (log root, database, listen port).

use anyhow::Context;
use claude_remote_core::RemoteConfig;
use claude_remote_db::Database;
use claude_remote_server::{
    create_app, watcher, AppState, EventBus, IdleDetector, Indexer, LoggingDeliveryPort,
    MuxController, NotificationDispatcher, ProcessRegistry,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = RemoteConfig::from_env().context("invalid configuration")?;

    if !config.projects_root.is_dir() {
        anyhow::bail!(
            "log root does not exist: {}",
            config.projects_root.display()
        );
    }

    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("opening index database at {}", config.db_path.display()))?;

    let bus = EventBus::new();
    let registry = Arc::new(ProcessRegistry::new(&config));
    let mux = Arc::new(MuxController::new(&config, db.clone(), registry.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Optional notify fast path: a capability probe gates it; polling stays
    // the correctness backbone either way.
    let (nudge, _nudger) = if watcher::probe_notify_support(&config.projects_root) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        match watcher::start_notify_nudger(&config.projects_root, tx) {
            Ok(handle) => {
                tracing::info!("notify fast path enabled");
                (Some(rx), Some(handle))
            }
            Err(e) => {
                tracing::info!(error = %e, "notify unavailable; polling only");
                (None, None)
            }
        }
    } else {
        tracing::info!("log root mount not suitable for notify; polling only");
        (None, None)
    };

    // Background engine: indexer, idle detector, notification dispatcher.
    let indexer = Indexer::new(db.clone(), bus.clone(), &config)
        .await
        .context("seeding indexer watermarks")?;
    tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = indexer.run(shutdown, nudge).await {
                tracing::error!(error = %e, "indexer failed fatally");
                std::process::exit(1);
            }
        }
    });

    let detector = IdleDetector::new(db.clone(), bus.clone(), &config);
    tokio::spawn(detector.run(shutdown_rx.clone()));

    let dispatcher =
        NotificationDispatcher::new(db.clone(), Arc::new(LoggingDeliveryPort), &config);
    tokio::spawn(dispatcher.run(bus.clone(), shutdown_rx.clone()));

    // HTTP surface.
    let state = AppState::new(config.clone(), db, bus, registry, mux);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!(addr = %config.listen, root = %config.projects_root.display(), "claude-remote listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serving HTTP")?;

    Ok(())
}
