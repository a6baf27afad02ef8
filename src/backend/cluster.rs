//! Runs a command as an ephemeral cluster job: dispatch, bounded polling,
//! output retrieval, and cleanup of the job on every exit path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{job_name, JobSpec};
use super::kube::{ClusterApi, ClusterError};
use super::{BackendKind, ExecutionBackend, ExecutionError};
use crate::config::ClusterConfig;

/// Knobs for the jobs this backend creates and how long it waits on them.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub image: String,
    pub backoff_limit: u32,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub ttl_seconds_after_finished: Option<u32>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            image: "busybox".to_string(),
            backoff_limit: 1,
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            ttl_seconds_after_finished: Some(300),
        }
    }
}

impl From<&ClusterConfig> for JobSettings {
    fn from(c: &ClusterConfig) -> Self {
        Self {
            image: c.image.clone(),
            backoff_limit: c.backoff_limit,
            poll_interval: Duration::from_secs(c.poll_interval_secs.max(1)),
            timeout: Duration::from_secs(c.timeout_secs.max(1)),
            ttl_seconds_after_finished: (c.ttl_seconds_after_finished > 0)
                .then_some(c.ttl_seconds_after_finished),
        }
    }
}

pub struct ClusterBackend {
    api: Arc<dyn ClusterApi>,
    settings: JobSettings,
}

impl ClusterBackend {
    pub fn new(api: Arc<dyn ClusterApi>, settings: JobSettings) -> Self {
        Self { api, settings }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    async fn drive(&self, job: &str, command: &str, cancel: &CancellationToken) -> Result<String, ExecutionError> {
        let spec = JobSpec {
            name: job.to_string(),
            image: self.settings.image.clone(),
            command: command.to_string(),
            backoff_limit: self.settings.backoff_limit,
            active_deadline_secs: Some(self.settings.timeout.as_secs().max(1)),
            ttl_seconds_after_finished: self.settings.ttl_seconds_after_finished,
        };

        info!(%job, image = %spec.image, "creating job");
        self.api
            .submit_job(&spec)
            .await
            .map_err(|source| ExecutionError::Dispatch {
                job: job.to_string(),
                source,
            })?;

        self.wait_for_completion(job, cancel).await?;
        info!(%job, "job completed");

        let pods = self
            .api
            .list_pods_for_job(job)
            .await
            .map_err(|source| ExecutionError::PodLookup {
                job: job.to_string(),
                source,
            })?;
        let pod = pods.into_iter().next().ok_or_else(|| ExecutionError::PodNotFound {
            job: job.to_string(),
        })?;

        // The job already succeeded; a log fetch failure only affects the output text.
        match self.api.pod_output(&pod).await {
            Ok(output) => Ok(output),
            Err(e) => {
                error!(%job, %pod, error = %e, "failed to retrieve pod logs");
                Ok(format!("Error retrieving logs: {}", e))
            }
        }
    }

    /// Poll job status every `poll_interval` until it reports success or
    /// failure, the timeout elapses, or `cancel` fires.
    async fn wait_for_completion(&self, job: &str, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        let deadline = Instant::now() + self.settings.timeout;
        let timed_out = || ExecutionError::Timeout {
            job: job.to_string(),
            after: self.settings.timeout,
        };
        let interrupted = || ExecutionError::Interrupted {
            job: job.to_string(),
        };

        let mut polls = 0u32;
        loop {
            polls += 1;
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted()),
                res = tokio::time::timeout_at(deadline, self.api.job_status(job)) => match res {
                    Ok(Ok(status)) => status,
                    Ok(Err(source)) => {
                        return Err(ExecutionError::StatusUnavailable {
                            job: job.to_string(),
                            source,
                        })
                    }
                    Err(_) => return Err(timed_out()),
                },
            };
            debug!(%job, polls, succeeded = status.succeeded, failed = status.failed, "job status");

            if status.succeeded > 0 {
                return Ok(());
            }
            if status.failed > 0 {
                return Err(ExecutionError::JobFailed {
                    job: job.to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }

            let pause = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ClusterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<String, ExecutionError> {
        let job = job_name();
        let guard = JobGuard::new(self.api.clone(), job.clone());
        let outcome = self.drive(&job, command, cancel).await;
        guard.release().await;
        outcome
    }
}

/// Deletes the job when released, or in the background if dropped
/// unreleased (panic or cancelled future).
struct JobGuard {
    api: Arc<dyn ClusterApi>,
    job: String,
    released: bool,
}

impl JobGuard {
    fn new(api: Arc<dyn ClusterApi>, job: String) -> Self {
        Self {
            api,
            job,
            released: false,
        }
    }

    async fn release(mut self) {
        delete_job(self.api.as_ref(), &self.job).await;
        self.released = true;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(job = %self.job, "job dropped before cleanup, deleting in background");
        let api = self.api.clone();
        let job = std::mem::take(&mut self.job);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    delete_job(api.as_ref(), &job).await;
                });
            }
            Err(_) => {
                error!(%job, "no runtime to clean up job; manual cleanup may be required");
            }
        }
    }
}

/// Best-effort delete. Never fails the run.
async fn delete_job(api: &dyn ClusterApi, job: &str) {
    info!(%job, "cleaning up job");
    match api.delete_job(job).await {
        Ok(()) => {}
        Err(ClusterError::NotFound { .. }) => debug!(%job, "job already gone"),
        Err(e) => error!(%job, error = %e, "failed to clean up job; manual cleanup may be required"),
    }
}
