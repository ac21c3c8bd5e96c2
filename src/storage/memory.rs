//! In-process run storage, for tests and single-shot tooling.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{check_update, dedup_tasks, RunFilter, Storage, StorageError, StorageResult};
use crate::history::{Run, Task};

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    runs: RwLock<Vec<Run>>,
    tasks: RwLock<Arc<Vec<Task>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn connect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn add_run(&self, run: &Run) -> StorageResult<()> {
        let mut runs = self.runs.write().await;
        if runs.iter().any(|r| r.id == run.id) {
            warn!(run_id = %run.id, "Rejected duplicate run");
            return Err(StorageError::DuplicateIdentifier(run.id));
        }
        runs.push(run.clone());
        debug!(run_id = %run.id, task = %run.task, entity = %run.entity, "Run added");
        Ok(())
    }

    async fn save_run(&self, run: &Run) -> StorageResult<()> {
        check_update(run)?;
        let mut runs = self.runs.write().await;
        let stored = runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| StorageError::run_not_found(run.id))?;

        if stored.is_complete() {
            warn!(run_id = %run.id, status = %stored.status, "Rejected update to completed run");
            return Err(StorageError::Immutable(run.id));
        }

        stored.status = run.status;
        stored.finished_at = run.finished_at;
        stored.failure = run.failure.clone();
        debug!(run_id = %run.id, status = %run.status, "Run saved");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> StorageResult<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs.iter().find(|r| r.id == id).cloned())
    }

    async fn get_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        filter.validate()?;
        let runs = self.runs.read().await;
        let mut matched: Vec<Run> = runs.iter().filter(|r| filter.matches(r)).cloned().collect();
        if let Some(n) = filter.latest {
            // insertion order, so the tail is the newest
            let skip = matched.len().saturating_sub(n);
            matched.drain(..skip);
        }
        Ok(matched)
    }

    async fn get_tasks(&self) -> StorageResult<Vec<Task>> {
        let tasks = self.tasks.read().await.clone();
        Ok(tasks.as_ref().clone())
    }

    async fn get_task(&self, name: &str) -> StorageResult<Task> {
        let tasks = self.tasks.read().await.clone();
        tasks
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| StorageError::task_not_found(name))
    }

    async fn set_tasks(&self, tasks: &[Task]) -> StorageResult<()> {
        let directory = Arc::new(dedup_tasks(tasks));
        let count = directory.len();
        *self.tasks.write().await = directory;
        debug!(count, "Task directory replaced");
        Ok(())
    }
}
