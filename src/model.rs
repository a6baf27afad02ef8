//! Health-check definitions and their execution history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single run: `Pending -> Running -> {Success | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    /// `Success` and `Failed` admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status '{}'", other),
        }
    }
}

/// The record of one run of a health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub output: Option<String>,
    pub triggered_by: String,
}

impl ExecutionLog {
    /// A fresh `Pending` log stamped with the current time.
    pub fn new(triggered_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Pending,
            output: None,
            triggered_by: triggered_by.into(),
        }
    }

    /// Dispatch has begun. No-op once terminal.
    pub fn mark_running(&mut self) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
        }
    }

    /// Record the terminal outcome of the run, ending it now.
    pub fn finish(&mut self, status: RunStatus, output: impl Into<String>) {
        self.finish_at(status, output, Utc::now());
    }

    /// Record the terminal outcome with an explicit end time.
    ///
    /// `end_time` is clamped so it never precedes `start_time`, even if the
    /// wall clock stepped backwards during the run.
    pub fn finish_at(&mut self, status: RunStatus, output: impl Into<String>, at: DateTime<Utc>) {
        debug_assert!(status.is_terminal(), "finish called with {status}");
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.output = Some(output.into());
        self.end_time = Some(at.max(self.start_time));
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A named command definition plus its run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Assigned by the store on first save.
    pub id: Option<String>,
    pub name: String,
    pub owner: String,
    pub command: String,
    /// Append-only, in run order.
    #[serde(default)]
    pub execution_logs: Vec<ExecutionLog>,
}

impl HealthCheck {
    pub fn latest_log(&self) -> Option<&ExecutionLog> {
        self.execution_logs.last()
    }
}

/// Request payload for creating a health check. Missing fields read as
/// empty so an absent command is rejected by validation, not by decoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewHealthCheck {
    pub name: String,
    pub owner: String,
    pub command: String,
}

impl From<NewHealthCheck> for HealthCheck {
    fn from(req: NewHealthCheck) -> Self {
        Self {
            id: None,
            name: req.name,
            owner: req.owner,
            command: req.command,
            execution_logs: Vec::new(),
        }
    }
}
