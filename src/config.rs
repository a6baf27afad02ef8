//! TOML configuration for the health-check daemon.
//!
//! Every section has compiled-in defaults, so an empty or missing file is a
//! valid configuration. The file is looked up from an explicit path, the
//! `HEALTHCHECKD_CONFIG` environment variable, then the system location.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "HEALTHCHECKD_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/healthcheckd/healthcheckd.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()
    }

    /// Resolve configuration, in order:
    /// 1. `explicit`, if given (errors are fatal).
    /// 2. The path in `HEALTHCHECKD_CONFIG`.
    /// 3. `/etc/healthcheckd/healthcheckd.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "HEALTHCHECKD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `:memory:` keeps everything in process.
    pub path: String,
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/healthcheckd.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// How the execution backend is chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Use a cluster if credentials are found, otherwise simulate.
    Auto,
    /// Require a cluster; startup fails without one.
    Cluster,
    /// Always simulate.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// Namespace jobs are created in.
    pub namespace: String,
    /// Container image the command runs in.
    pub image: String,
    /// Pod restarts the cluster may attempt before failing the job.
    pub backoff_limit: u32,
    pub poll_interval_secs: u64,
    /// Wall-clock limit from dispatch to completion.
    pub timeout_secs: u64,
    /// Per-request limit for cluster API calls.
    pub request_timeout_secs: u64,
    /// Cluster-side garbage collection of finished jobs; 0 disables.
    pub ttl_seconds_after_finished: u32,
    /// Kubeconfig to use instead of `$KUBECONFIG` / `~/.kube/config`.
    pub kubeconfig: Option<PathBuf>,
}

impl ClusterConfig {
    /// The poll loop must sleep between status reads and the run must have
    /// a deadline.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.poll_interval_secs > 0,
            "cluster.poll_interval_secs must be at least 1"
        );
        anyhow::ensure!(self.timeout_secs > 0, "cluster.timeout_secs must be at least 1");
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Auto,
            namespace: "health-checks".to_string(),
            image: "busybox".to_string(),
            backoff_limit: 1,
            poll_interval_secs: 5,
            timeout_secs: 120,
            request_timeout_secs: 30,
            ttl_seconds_after_finished: 300,
            kubeconfig: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
