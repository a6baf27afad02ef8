//! Ephemeral job specification and its `batch/v1` manifest.

use serde_json::{json, Value};

pub const JOB_NAME_PREFIX: &str = "health-check-job-";
pub const CONTAINER_NAME: &str = "health-check-container";
pub const MANAGED_BY: &str = "healthcheckd";

/// A fresh job name with an 8-hex-char random suffix.
///
/// Not guaranteed unique, but collisions within one namespace are
/// negligible for short-lived jobs.
pub fn job_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", JOB_NAME_PREFIX, &suffix[..8])
}

/// Everything needed to submit one command as a cluster job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: String,
    /// Restarts the cluster itself may attempt before marking the job failed.
    pub backoff_limit: u32,
    pub active_deadline_secs: Option<u64>,
    pub ttl_seconds_after_finished: Option<u32>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: command.into(),
            backoff_limit: 1,
            active_deadline_secs: None,
            ttl_seconds_after_finished: None,
        }
    }

    /// Render the Kubernetes Job object.
    pub fn to_manifest(&self, namespace: &str) -> Value {
        let mut spec = json!({
            "backoffLimit": self.backoff_limit,
            "template": {
                "metadata": {
                    "name": self.name,
                    "labels": { "app.kubernetes.io/managed-by": MANAGED_BY }
                },
                "spec": {
                    "restartPolicy": "OnFailure",
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": self.image,
                        "command": ["/bin/sh", "-c"],
                        "args": [self.command]
                    }]
                }
            }
        });
        if let Some(deadline) = self.active_deadline_secs {
            spec["activeDeadlineSeconds"] = json!(deadline);
        }
        if let Some(ttl) = self.ttl_seconds_after_finished {
            spec["ttlSecondsAfterFinished"] = json!(ttl);
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": { "app.kubernetes.io/managed-by": MANAGED_BY }
            },
            "spec": spec
        })
    }
}
