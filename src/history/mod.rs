//! Execution history records for scheduled jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// One recorded execution attempt of a task against an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// Name of the task this run executed. Soft reference, the task may no
    /// longer exist in the directory.
    pub task: String,
    /// Scope the run pertains to (region, shard, jurisdiction...).
    pub entity: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Failure detail. Some backends record failures only here.
    pub failure: Option<String>,
}

impl Run {
    /// A freshly started run with a new identifier.
    pub fn start(task: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::start_at(task, entity, Utc::now())
    }

    pub fn start_at(
        task: impl Into<String>,
        entity: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            entity: entity.into(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            failure: None,
        }
    }

    /// Mark the run successful, stamping the end time.
    pub fn succeed(mut self) -> Self {
        self.status = RunStatus::Success;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Mark the run failed with a detail message, stamping the end time.
    pub fn fail(mut self, detail: impl Into<String>) -> Self {
        self.status = RunStatus::Failure;
        self.failure = Some(detail.into());
        self.finished_at = Some(Utc::now());
        self
    }

    /// Whether this run counts as a failure: a `failure` status, or a failure
    /// detail attached to any other status.
    pub fn is_failure(&self) -> bool {
        self.status == RunStatus::Failure || self.failure.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// Named definition of a schedulable job. Execution metadata is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_running() {
        let run = Run::start("scrape", "nc");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert!(!run.is_failure());
        assert!(run.duration().is_none());
    }

    #[test]
    fn test_failure_detail_counts_as_failure() {
        let mut run = Run::start("scrape", "nc").succeed();
        assert!(!run.is_failure());
        run.failure = Some("partial scrape".to_string());
        assert!(run.is_failure());
    }

    #[test]
    fn test_fail_sets_status_and_detail() {
        let run = Run::start("scrape", "nc").fail("timeout");
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.failure.as_deref(), Some("timeout"));
        assert!(run.duration().is_some());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Success".parse::<RunStatus>().unwrap(), RunStatus::Success);
        assert_eq!(" running ".parse::<RunStatus>().unwrap(), RunStatus::Running);
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&RunStatus::Failure).unwrap();
        assert_eq!(json, "\"failure\"");
    }
}
