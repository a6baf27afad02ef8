//! healthcheckd -- named health-check commands executed on demand as
//! ephemeral cluster jobs, with a recorded execution history per check.
//!
//! This crate provides the command validator, the execution backends
//! (cluster jobs or local simulation), the run orchestrator, persistence,
//! and the HTTP API.

pub mod api;
pub mod backend;
pub mod config;
pub mod model;
pub mod service;
pub mod shutdown;
pub mod storage;
pub mod validate;

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::service::HealthCheckService;
use crate::storage::{HealthCheckStore, MemoryStore, SqliteStore};

/// Open the store named by the configuration.
pub fn open_store(config: &Config) -> Result<Arc<dyn HealthCheckStore>> {
    if config.storage.is_in_memory() {
        tracing::warn!("using in-memory storage; health checks will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    tracing::info!(db_path = %config.storage.path, "Initializing database");
    Ok(Arc::new(SqliteStore::open(&config.storage.path)?))
}

/// Wire storage and the execution backend into a service.
pub fn build_service(config: &Config) -> Result<HealthCheckService> {
    let store = open_store(config)?;
    let backend = backend::select(&config.cluster)?;
    Ok(HealthCheckService::new(store, backend))
}

/// Start the daemon: HTTP API in front of the health-check service.
pub async fn serve(config: Config) -> Result<()> {
    let shutdown = shutdown::install_shutdown_handler();
    let service = build_service(&config)?.with_shutdown(shutdown.clone());

    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let app = api::router(api::state::AppState { service });

    tracing::info!(%addr, "healthcheckd listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("healthcheckd stopped");
    Ok(())
}
