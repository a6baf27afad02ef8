//! Execution backends: where a health-check command actually runs.
//!
//! The backend is chosen once at startup. With cluster credentials available
//! commands run as ephemeral jobs; without them a local simulation stands in
//! so callers see the same result shape either way.

pub mod cluster;
pub mod job;
pub mod kube;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ClusterConfig, ClusterMode};

pub use self::cluster::{ClusterBackend, JobSettings};
pub use self::kube::{ClusterApi, ClusterError, Connection, JobStatus, KubeClient};
pub use self::local::{LocalBackend, SIMULATED_OUTPUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cluster,
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cluster => write!(f, "cluster"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// Why a run ended in `FAILED`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to dispatch job {job}: {source}")]
    Dispatch { job: String, source: ClusterError },

    #[error("job {job} failed to execute")]
    JobFailed { job: String },

    #[error("job {job} timed out after {}s", .after.as_secs())]
    Timeout { job: String, after: Duration },

    #[error("could not read status of job {job}: {source}")]
    StatusUnavailable { job: String, source: ClusterError },

    #[error("could not list pods for job {job}: {source}")]
    PodLookup { job: String, source: ClusterError },

    #[error("could not find pod for job {job}")]
    PodNotFound { job: String },

    #[error("interrupted while waiting for job {job}")]
    Interrupted { job: String },

    #[error("{0}")]
    Unexpected(String),
}

/// Runs one command to completion and returns its captured output.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether a run spends observable time in `RUNNING`.
    fn is_remote(&self) -> bool;

    /// Execute `command`, giving up with [`ExecutionError::Interrupted`]
    /// once `cancel` fires.
    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<String, ExecutionError>;
}

/// Choose the backend for this process from configuration and the
/// environment.
pub fn select(config: &ClusterConfig) -> Result<Arc<dyn ExecutionBackend>> {
    config.validate()?;

    let connection = match config.mode {
        ClusterMode::Local => None,
        ClusterMode::Cluster => Some(
            Connection::discover(config.kubeconfig.as_deref())
                .context("cluster mode requires cluster credentials")?
                .context("cluster mode requires cluster credentials, none found")?,
        ),
        ClusterMode::Auto => match Connection::discover(config.kubeconfig.as_deref()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "cluster credentials unusable");
                None
            }
        },
    };

    let Some(connection) = connection else {
        warn!("no cluster available; health checks will be simulated");
        return Ok(Arc::new(LocalBackend));
    };

    let client = KubeClient::new(
        connection,
        config.namespace.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )
    .context("failed to build cluster client")?;

    info!(namespace = %config.namespace, image = %config.image, "health checks will run as cluster jobs");
    Ok(Arc::new(ClusterBackend::new(
        Arc::new(client),
        JobSettings::from(config),
    )))
}
