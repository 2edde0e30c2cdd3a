/// Server setup and initialization
///
/// Wires together storage, registry, node handlers, the execution
/// coordinator, and the HTTP routes. Provides the application factory
/// used by both `main` and the integration tests.

use crate::{
    api::{
        scheduler::{create_scheduler_routes, SchedulerState},
        webhooks::create_webhook_routes,
        workflows::{create_workflow_routes, AppState},
    },
    config::Config,
    credentials::StorageCredentialResolver,
    engine::coordinator::ExecutionCoordinator,
    nodes::NodeHandlerRegistry,
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes wired up.
pub async fn create_app(config: Config) -> Result<Router> {
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("failed to create data directory: {e}"))?;

    let db_path = std::path::Path::new(&config.database.data_dir).join("strandway.db");
    tracing::info!(path = %db_path.display(), "opening engine database");
    let pool = SqlitePoolOptions::new()
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true),
        )
        .await?;

    let storage = WorkflowStorage::new(pool);
    storage.init_schema().await?;

    let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
    registry.init_from_storage().await?;

    let http = reqwest::Client::new();
    let handlers = Arc::new(NodeHandlerRegistry::builtin(http.clone()));
    let credentials = Arc::new(StorageCredentialResolver::new(storage.clone()));
    let coordinator = Arc::new(ExecutionCoordinator::new(
        handlers,
        credentials,
        registry.clone(),
        http,
        config.engine.loop_limit,
    ));

    let app_state = AppState {
        storage,
        registry,
        coordinator,
    };
    let scheduler_state = SchedulerState {
        app_state: app_state.clone(),
        token: config.engine.scheduler_token.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes().with_state(app_state.clone()))
        .merge(create_webhook_routes().with_state(app_state))
        .merge(create_scheduler_routes().with_state(scheduler_state));

    tracing::info!("application initialized");
    Ok(app)
}

/// Start the HTTP server with the given configuration.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("starting Strandway server");
    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("server listening on http://{bind_addr}");

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
