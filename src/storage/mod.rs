//! Run history storage -- backend contract, filters, and backend selection.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{BackendKind, StorageConfig};
use crate::history::{Run, RunStatus, Task};

pub use self::memory::InMemoryStorage;
pub use self::sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("run {0} already exists")]
    DuplicateIdentifier(Uuid),

    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("run {0} is complete and can no longer be modified")]
    Immutable(Uuid),

    #[error("inconsistent update to run {id}: {reason}")]
    InconsistentRun { id: Uuid, reason: &'static str },

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn run_not_found(id: Uuid) -> Self {
        StorageError::NotFound {
            kind: "run",
            key: id.to_string(),
        }
    }

    pub fn task_not_found(name: &str) -> Self {
        StorageError::NotFound {
            kind: "task",
            key: name.to_string(),
        }
    }

    /// Transient failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::BackendUnavailable(_))
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        StorageError::BackendUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::BackendUnavailable(format!("storage worker failed: {}", e))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Which statuses a query matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    Any,
    Exact(RunStatus),
    AnyOf(HashSet<RunStatus>),
}

impl StatusFilter {
    /// Parse a comma-separated list of status names. Empty input means no filter.
    pub fn parse(input: &str) -> StorageResult<Self> {
        let mut statuses = HashSet::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let status = part
                .parse::<RunStatus>()
                .map_err(StorageError::InvalidFilter)?;
            statuses.insert(status);
        }
        Ok(match statuses.len() {
            0 => StatusFilter::Any,
            1 => match statuses.into_iter().next() {
                Some(s) => StatusFilter::Exact(s),
                None => StatusFilter::Any,
            },
            _ => StatusFilter::AnyOf(statuses),
        })
    }

    pub fn matches(&self, status: RunStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Exact(s) => *s == status,
            StatusFilter::AnyOf(set) => set.contains(&status),
        }
    }
}

/// Query over stored runs. All populated criteria must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub status: StatusFilter,
    pub task: Option<String>,
    /// Only runs started strictly after this instant.
    pub started_after: Option<DateTime<Utc>>,
    /// Keep only the N most recently inserted matches, in insertion order.
    pub latest: Option<usize>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    pub fn task(mut self, name: impl Into<String>) -> Self {
        self.task = Some(name.into());
        self
    }

    pub fn started_after(mut self, at: DateTime<Utc>) -> Self {
        self.started_after = Some(at);
        self
    }

    pub fn latest(mut self, n: usize) -> Self {
        self.latest = Some(n);
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.latest == Some(0) {
            return Err(StorageError::InvalidFilter(
                "latest must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a run satisfies every criterion except `latest`.
    pub fn matches(&self, run: &Run) -> bool {
        self.status.matches(run.status)
            && self.task.as_deref().map_or(true, |t| run.task == t)
            && self.started_after.map_or(true, |after| run.started_at > after)
    }
}

/// Persistence contract for runs and the task directory.
///
/// Backends own persisted state; reads hand out copies and changes only reach
/// the store through `add_run` / `save_run` / `set_tasks`.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Acquire the backend connection. Safe to call repeatedly.
    async fn connect(&self) -> StorageResult<()>;

    async fn add_run(&self, run: &Run) -> StorageResult<()>;

    /// Persist status, end time and failure detail of an existing run.
    async fn save_run(&self, run: &Run) -> StorageResult<()>;

    async fn get_run(&self, id: Uuid) -> StorageResult<Option<Run>>;

    /// Matching runs in insertion order.
    async fn get_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>>;

    async fn get_tasks(&self) -> StorageResult<Vec<Task>>;

    async fn get_task(&self, name: &str) -> StorageResult<Task>;

    /// Replace the whole task directory atomically.
    async fn set_tasks(&self, tasks: &[Task]) -> StorageResult<()>;
}

/// An update must carry an end time exactly when its status is terminal.
pub(crate) fn check_update(run: &Run) -> StorageResult<()> {
    let reason = match (run.status.is_terminal(), run.finished_at.is_some()) {
        (true, false) => "completed run has no end time",
        (false, true) => "running run has an end time",
        _ => return Ok(()),
    };
    Err(StorageError::InconsistentRun { id: run.id, reason })
}

/// Collapse duplicate task names: last definition wins, first position kept.
pub(crate) fn dedup_tasks(tasks: &[Task]) -> Vec<Task> {
    let mut out: Vec<Task> = Vec::with_capacity(tasks.len());
    for task in tasks {
        match out.iter_mut().find(|t| t.name == task.name) {
            Some(existing) => *existing = task.clone(),
            None => out.push(task.clone()),
        }
    }
    out
}

/// Build the configured backend and connect it.
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.backend {
        BackendKind::Memory => Arc::new(InMemoryStorage::new()),
        BackendKind::Sqlite => Arc::new(SqliteStorage::new(&config.path)),
    };
    tracing::info!(backend = ?config.backend, path = %config.path.display(), "Opening run storage");
    storage.connect().await?;
    Ok(storage)
}
