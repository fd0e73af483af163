//! HTTP surface: the resume trigger and status endpoints, plus the
//! background reconciliation sweep. Routing and state wiring follow the
//! `api`/`server` split, with `ServerConfig` carrying everything tunable.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::engine::Engine;
use crate::engine::notify::NotificationGateway;
use crate::engine::phase::Pipeline;
use crate::engine::store::{EngineDb, StoreHandle};
use crate::engine::sweep::Sweeper;

use api::{AppState, SharedState};

/// Configuration for the engine server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    /// Callback URL notified when a run needs a decision. None disables
    /// notifications; pending decisions are still discoverable by polling.
    pub notify_url: Option<String>,
    /// How long a pending decision stays actionable.
    pub decision_ttl: chrono::Duration,
    /// How often the reconciliation sweep runs.
    pub sweep_interval: std::time::Duration,
    /// A running run with no progress event for this long is considered
    /// stuck and re-advanced by the sweep.
    pub stale_after: chrono::Duration,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4180,
            db_path: std::path::PathBuf::from(".greenlight/engine.db"),
            notify_url: None,
            decision_ttl: chrono::Duration::days(7),
            sweep_interval: std::time::Duration::from_secs(60),
            stale_after: chrono::Duration::minutes(10),
            dev_mode: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the engine server with the given pipeline.
pub async fn start_server(config: ServerConfig, pipeline: Pipeline) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = EngineDb::new(&config.db_path).context("Failed to initialize engine database")?;
    let store = StoreHandle::new(db);
    let notifier = NotificationGateway::new(config.notify_url.clone());
    let engine = Engine::new(store.clone(), pipeline, notifier, config.decision_ttl);

    let sweeper = Sweeper::new(
        store,
        Arc::clone(engine.controller()),
        config.stale_after,
    );
    tokio::spawn(sweeper.run_forever(config.sweep_interval));

    let state = Arc::new(AppState { engine });
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Greenlight engine running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
