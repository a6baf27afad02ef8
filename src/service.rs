//! The health-check service: CRUD over stored definitions and the run
//! orchestration that records each execution.
//!
//! A run moves its log through `PENDING -> RUNNING -> {SUCCESS | FAILED}`.
//! For a remote backend the `RUNNING` state is persisted before dispatch so
//! observers can see the run in flight; the terminal state is written once
//! the backend has returned and cleaned up after itself. Every execution
//! failure ends up in the log rather than in the returned error.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{BackendKind, ExecutionBackend, ExecutionError};
use crate::model::{ExecutionLog, HealthCheck, NewHealthCheck, RunStatus};
use crate::storage::HealthCheckStore;
use crate::validate::{validate, CommandRejected};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("health check not found with id: {id}")]
    NotFound { id: String },

    #[error(transparent)]
    InvalidCommand(#[from] CommandRejected),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct HealthCheckService {
    store: Arc<dyn HealthCheckStore>,
    backend: Arc<dyn ExecutionBackend>,
    shutdown: CancellationToken,
}

impl HealthCheckService {
    pub fn new(store: Arc<dyn HealthCheckStore>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            store,
            backend,
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs started through [`run`](Self::run) are interrupted when `token`
    /// is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn list(&self) -> Result<Vec<HealthCheck>, ServiceError> {
        Ok(self.store.list_all().await?)
    }

    pub async fn get(&self, id: &str) -> Result<HealthCheck, ServiceError> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound { id: id.to_string() })
    }

    /// Validate the command and persist a new definition.
    pub async fn create(&self, req: NewHealthCheck) -> Result<HealthCheck, ServiceError> {
        validate(&req.command)?;
        let saved = self
            .store
            .save(&HealthCheck::from(req))
            .await?
            .ok_or_else(|| anyhow::anyhow!("new health check was not stored"))?;
        info!(check_id = ?saved.id, name = %saved.name, "health check created");
        Ok(saved)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        if !self.store.exists(id).await? {
            return Err(ServiceError::NotFound { id: id.to_string() });
        }
        self.store.delete(id).await?;
        info!(check_id = %id, "health check deleted");
        Ok(())
    }

    /// Execute the stored command once and append the outcome to the
    /// check's history.
    ///
    /// Only an unknown `id` (including a check deleted while the run was in
    /// flight) or a store failure is returned as an error; the command's own
    /// success or failure is recorded in the new log.
    pub async fn run(&self, id: &str, triggered_by: &str) -> Result<HealthCheck, ServiceError> {
        let cancel = self.shutdown.child_token();
        self.run_with_cancel(id, triggered_by, &cancel).await
    }

    /// As [`run`](Self::run), interrupted by `cancel` instead of the
    /// service's shutdown token. If the run is interrupted, `cancel` is left
    /// cancelled for the caller to observe.
    pub async fn run_with_cancel(
        &self,
        id: &str,
        triggered_by: &str,
        cancel: &CancellationToken,
    ) -> Result<HealthCheck, ServiceError> {
        let mut check = self.get(id).await?;
        let mut log = ExecutionLog::new(triggered_by);
        let remote = self.backend.is_remote();

        // The command was validated at creation and definitions are immutable.
        if remote {
            log.mark_running();
            check.execution_logs.push(log.clone());
            match self.store.save(&check).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!(check_id = %id, "health check deleted before dispatch");
                    return Err(ServiceError::NotFound { id: id.to_string() });
                }
                Err(e) => warn!(check_id = %id, error = %e, "failed to persist running state"),
            }
        }

        info!(check_id = %id, backend = %self.backend.kind(), triggered_by, "running health check");

        let outcome = AssertUnwindSafe(self.backend.execute(&check.command, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ExecutionError::Unexpected(panic_message(panic.as_ref()))));

        let started = log.start_time;
        match outcome {
            Ok(output) if remote => log.finish(RunStatus::Success, output),
            Ok(output) => log.finish_at(RunStatus::Success, output, started),
            Err(err) => {
                if let ExecutionError::Interrupted { .. } = err {
                    warn!(check_id = %id, "run interrupted");
                    cancel.cancel();
                }
                error!(check_id = %id, error = %err, "health check run failed");
                log.finish(RunStatus::Failed, failure_output(&err));
            }
        }

        info!(check_id = %id, status = %log.status, "health check finished");

        match check.execution_logs.iter_mut().find(|l| l.id == log.id) {
            Some(slot) => *slot = log,
            None => check.execution_logs.push(log),
        }
        // A check deleted mid-run stays deleted; the outcome is dropped with it.
        self.store.save(&check).await?.ok_or_else(|| {
            warn!(check_id = %id, "health check deleted during run, discarding result");
            ServiceError::NotFound { id: id.to_string() }
        })
    }
}

fn failure_output(err: &ExecutionError) -> String {
    match err {
        ExecutionError::Unexpected(msg) => format!("An unexpected error occurred: {}", msg),
        other => format!("Failed to execute command. Error: {}", other),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution backend panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, SIMULATED_OUTPUT};
    use crate::storage::MemoryStore;

    fn service() -> HealthCheckService {
        HealthCheckService::new(Arc::new(MemoryStore::new()), Arc::new(LocalBackend))
    }

    fn req(command: &str) -> NewHealthCheck {
        NewHealthCheck {
            name: "gateway".into(),
            owner: "netops".into(),
            command: command.into(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_command_and_persists_nothing() {
        let svc = service();
        let err = svc.create(req("ping host; rm -rf /")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidCommand(CommandRejected::ForbiddenMetacharacters)
        ));
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_run_succeeds_with_simulated_output() {
        let svc = service();
        let check = svc.create(req("ping -c 4 host")).await.unwrap();
        let id = check.id.unwrap();

        let updated = svc.run(&id, "alice").await.unwrap();
        assert_eq!(updated.execution_logs.len(), 1);
        let log = &updated.execution_logs[0];
        assert_eq!(log.status, RunStatus::Success);
        assert_eq!(log.output.as_deref(), Some(SIMULATED_OUTPUT));
        assert_eq!(log.triggered_by, "alice");
        assert_eq!(log.end_time, Some(log.start_time));
    }

    #[tokio::test]
    async fn test_run_unknown_id_is_not_found() {
        let svc = service();
        let err = svc.run("nope", "alice").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { ref id } if id == "nope"));
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let svc = service();
        assert!(matches!(
            svc.delete("nope").await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_failure_output_prefixes() {
        let err = ExecutionError::JobFailed { job: "j".into() };
        assert_eq!(
            failure_output(&err),
            "Failed to execute command. Error: job j failed to execute"
        );
        let err = ExecutionError::Unexpected("boom".into());
        assert_eq!(failure_output(&err), "An unexpected error occurred: boom");
    }
}
