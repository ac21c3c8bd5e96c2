//! SQLite-backed run storage.
//!
//! Connections come from an r2d2 pool built on first use. Every query runs on
//! the blocking thread pool so callers never stall the async runtime.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    check_update, dedup_tasks, schema, RunFilter, StatusFilter, Storage, StorageError,
    StorageResult,
};
use crate::history::{Run, RunStatus, Task};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const RUN_COLUMNS: &str = "id, task, entity, status, failure, started_at, finished_at";

/// Open (or create) the SQLite database and return a migrated connection pool.
pub fn open_pool(path: &Path) -> StorageResult<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::BackendUnavailable(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

pub struct SqliteStorage {
    path: PathBuf,
    pool: OnceCell<Pool>,
}

impl SqliteStorage {
    /// Point at a database file. Nothing is opened until first use.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> StorageResult<Pool> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let path = self.path.clone();
                info!(path = %path.display(), "Opening SQLite run storage");
                tokio::task::spawn_blocking(move || open_pool(&path)).await?
            })
            .await?;
        Ok(pool.clone())
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool().await?;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait::async_trait]
impl Storage for SqliteStorage {
    async fn connect(&self) -> StorageResult<()> {
        self.pool().await.map(|_| ())
    }

    async fn add_run(&self, run: &Run) -> StorageResult<()> {
        let run = run.clone();
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO runs (id, task, entity, status, failure, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id.to_string(),
                    run.task,
                    run.entity,
                    run.status.as_str(),
                    run.failure,
                    encode_ts(&run.started_at),
                    run.finished_at.as_ref().map(encode_ts),
                ],
            );
            match res {
                Ok(_) => {
                    debug!(run_id = %run.id, task = %run.task, entity = %run.entity, "Run added");
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    warn!(run_id = %run.id, "Rejected duplicate run");
                    Err(StorageError::DuplicateIdentifier(run.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn save_run(&self, run: &Run) -> StorageResult<()> {
        check_update(run)?;
        let run = run.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = run.id.to_string();

            let current: Option<String> = tx
                .query_row("SELECT status FROM runs WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            let current = current.ok_or_else(|| StorageError::run_not_found(run.id))?;
            if decode_status(&current)?.is_terminal() {
                warn!(run_id = %run.id, status = %current, "Rejected update to completed run");
                return Err(StorageError::Immutable(run.id));
            }

            tx.execute(
                "UPDATE runs SET status = ?1, failure = ?2, finished_at = ?3 WHERE id = ?4",
                params![
                    run.status.as_str(),
                    run.failure,
                    run.finished_at.as_ref().map(encode_ts),
                    id,
                ],
            )?;
            tx.commit()?;
            debug!(run_id = %run.id, status = %run.status, "Run saved");
            Ok(())
        })
        .await
    }

    async fn get_run(&self, id: Uuid) -> StorageResult<Option<Run>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                    params![id.to_string()],
                    RunRow::from_row,
                )
                .optional()?;
            row.map(RunRow::into_run).transpose()
        })
        .await
    }

    async fn get_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        filter.validate()?;
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (sql, values) = build_runs_query(&filter);
            debug!(%sql, "Querying runs");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), RunRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut runs = rows
                .into_iter()
                .map(RunRow::into_run)
                .collect::<StorageResult<Vec<_>>>()?;
            if filter.latest.is_some() {
                // fetched newest first for the LIMIT
                runs.reverse();
            }
            Ok(runs)
        })
        .await
    }

    async fn get_tasks(&self) -> StorageResult<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name, metadata_json FROM tasks ORDER BY seq")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(name, json)| decode_task(name, &json))
                .collect()
        })
        .await
    }

    async fn get_task(&self, name: &str) -> StorageResult<Task> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT metadata_json FROM tasks WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => decode_task(name, &json),
                None => Err(StorageError::task_not_found(&name)),
            }
        })
        .await
    }

    async fn set_tasks(&self, tasks: &[Task]) -> StorageResult<()> {
        let tasks = dedup_tasks(tasks);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM tasks", [])?;
            {
                let mut insert =
                    tx.prepare("INSERT INTO tasks (name, metadata_json) VALUES (?1, ?2)")?;
                for task in &tasks {
                    let json = serde_json::to_string(&task.metadata)
                        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                    insert.execute(params![task.name, json])?;
                }
            }
            tx.commit()?;
            debug!(count = tasks.len(), "Task directory replaced");
            Ok(())
        })
        .await
    }
}

/// Translate a filter into SQL plus positional parameters.
fn build_runs_query(filter: &RunFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    match &filter.status {
        StatusFilter::Any => {}
        StatusFilter::Exact(status) => {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        StatusFilter::AnyOf(set) if set.is_empty() => clauses.push("0".to_string()),
        StatusFilter::AnyOf(set) => {
            let mut slots = Vec::with_capacity(set.len());
            for status in set {
                values.push(Value::Text(status.as_str().to_string()));
                slots.push(format!("?{}", values.len()));
            }
            clauses.push(format!("status IN ({})", slots.join(", ")));
        }
    }
    if let Some(task) = &filter.task {
        values.push(Value::Text(task.clone()));
        clauses.push(format!("task = ?{}", values.len()));
    }
    if let Some(after) = &filter.started_after {
        values.push(Value::Text(encode_ts(after)));
        clauses.push(format!("started_at > ?{}", values.len()));
    }

    let mut sql = format!("SELECT {} FROM runs", RUN_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    match filter.latest {
        Some(n) => {
            values.push(Value::Integer(i64::try_from(n).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" ORDER BY seq DESC LIMIT ?{}", values.len()));
        }
        None => sql.push_str(" ORDER BY seq ASC"),
    }
    (sql, values)
}

/// Fixed-width UTC text so lexical order matches chronological order.
fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

fn decode_status(s: &str) -> StorageResult<RunStatus> {
    s.parse::<RunStatus>().map_err(StorageError::Corrupt)
}

fn decode_task(name: String, json: &str) -> StorageResult<Task> {
    let metadata = serde_json::from_str(json)
        .map_err(|e| StorageError::Corrupt(format!("task '{}' metadata: {}", name, e)))?;
    Ok(Task { name, metadata })
}

struct RunRow {
    id: String,
    task: String,
    entity: String,
    status: String,
    failure: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task: row.get(1)?,
            entity: row.get(2)?,
            status: row.get(3)?,
            failure: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }

    fn into_run(self) -> StorageResult<Run> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StorageError::Corrupt(format!("bad run id '{}': {}", self.id, e)))?;
        Ok(Run {
            id,
            task: self.task,
            entity: self.entity,
            status: decode_status(&self.status)?,
            failure: self.failure,
            started_at: decode_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(decode_ts).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn storage() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::new(dir.path().join("runs.db"));
        (dir, storage)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (_dir, storage) = storage();
        storage.connect().await.unwrap();
        storage.connect().await.unwrap();
        assert!(storage.get_runs(&RunFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_record() {
        let (_dir, storage) = storage();
        let run = Run::start("scrape", "wy").fail("http 500");
        storage.add_run(&run).await.unwrap();
        assert_eq!(storage.get_run(run.id).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn test_duplicate_insert_maps_to_duplicate_identifier() {
        let (_dir, storage) = storage();
        let run = Run::start("scrape", "wy");
        storage.add_run(&run).await.unwrap();
        let err = storage.add_run(&run).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateIdentifier(_)));
    }

    #[tokio::test]
    async fn test_completed_run_cannot_be_reopened() {
        let (_dir, storage) = storage();
        let run = Run::start("scrape", "wy");
        storage.add_run(&run).await.unwrap();
        let done = run.clone().succeed();
        storage.save_run(&done).await.unwrap();

        let err = storage.save_run(&run).await.unwrap_err();
        assert!(matches!(err, StorageError::Immutable(_)));
        let stored = storage.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_started_after_is_exclusive() {
        let (_dir, storage) = storage();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let early = Run::start_at("scrape", "wy", t0);
        let late = Run::start_at("scrape", "wy", t0 + chrono::Duration::nanoseconds(1));
        storage.add_run(&early).await.unwrap();
        storage.add_run(&late).await.unwrap();

        let runs = storage
            .get_runs(&RunFilter::new().started_after(t0))
            .await
            .unwrap();
        assert_eq!(runs, vec![late]);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.db");
        let run = Run::start("scrape", "wy");
        {
            let storage = SqliteStorage::new(&path);
            storage.add_run(&run).await.unwrap();
            storage.set_tasks(&[Task::new("scrape")]).await.unwrap();
        }
        let storage = SqliteStorage::new(&path);
        assert_eq!(storage.get_run(run.id).await.unwrap(), Some(run));
        assert_eq!(storage.get_task("scrape").await.unwrap().name, "scrape");
    }

    #[test]
    fn test_query_builder_numbers_parameters() {
        let filter = RunFilter::new()
            .status(StatusFilter::Exact(RunStatus::Failure))
            .task("scrape")
            .latest(3);
        let (sql, values) = build_runs_query(&filter);
        assert!(sql.contains("status = ?1"));
        assert!(sql.contains("task = ?2"));
        assert!(sql.ends_with("ORDER BY seq DESC LIMIT ?3"));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_timestamp_encoding_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert!(encode_ts(&a) < encode_ts(&b));
        assert_eq!(decode_ts(&encode_ts(&a)).unwrap(), a);
    }
}
