//! Stand-in backend used when the process has no cluster to talk to.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{BackendKind, ExecutionBackend, ExecutionError};

pub const SIMULATED_OUTPUT: &str = "execution simulated; cluster not available";

/// Reports every command as succeeded without running it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn execute(&self, command: &str, _cancel: &CancellationToken) -> Result<String, ExecutionError> {
        info!(command, "simulating run; no cluster configured");
        Ok(SIMULATED_OUTPUT.to_string())
    }
}
