//! Durable SQLite store for runs and steps.
//!
//! The store treats step blobs as opaque bytes: it never inspects or
//! re-encodes them, and the `blob_codec` column alone determines the decode
//! path at query time. Readers and the writer share the file through WAL.

mod store_exporter;

pub use store_exporter::StorageExporter;

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::events::{now_ms, RunOutcome};
use crate::pipeline::{BlobCodec, Pipeline};

const SCHEMA_VERSION: i64 = 1;

/// Hard cap on page size for list queries.
pub const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub id: String,
    pub name: String,
    pub status: RunStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: RunRow,
    pub step_count: i64,
    pub error_count: i64,
}

/// Step row with its payload decoded through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StepRow {
    pub id: i64,
    pub run_id: String,
    pub event_id: i64,
    pub event_type: String,
    pub name: String,
    pub status: String,
    pub timestamp_ms: i64,
    pub duration_ms: Option<i64>,
    pub parent_event_id: Option<i64>,
    /// Decoded payload; `None` when the blob failed to decode.
    pub data: Option<Value>,
}

/// Compact per-event summary for the UI timeline. No blob access.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub id: i64,
    pub event_id: i64,
    pub event_type: String,
    pub name: String,
    pub timestamp_ms: i64,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub parent_event_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunExport {
    pub run: RunRow,
    pub timeline: Vec<StepRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_runs: i64,
    pub runs_by_status: Vec<(String, i64)>,
    pub total_steps: i64,
    pub steps_by_type: Vec<(String, i64)>,
    pub db_size_bytes: i64,
}

/// Filters and paging for `list_runs`.
#[derive(Debug, Clone, Default)]
pub struct ListRunsFilter {
    pub status: Option<RunStatus>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Case-insensitive substring match over `name`.
    pub search: Option<String>,
    pub started_after: Option<i64>,
    pub started_before: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

/// One write inside a batch transaction. The storage exporter translates
/// events into these; `apply_batch` commits them atomically.
#[derive(Debug, Clone)]
pub enum BatchOp {
    InsertRun {
        id: String,
        name: String,
        started_at_ms: i64,
        user_id: Option<String>,
        session_id: Option<String>,
        parent_run_id: Option<String>,
        metadata: Value,
    },
    InsertStep(StepInsert),
    FinishRun {
        run_id: String,
        outcome: RunOutcome,
        ended_at_ms: i64,
    },
}

#[derive(Debug, Clone)]
pub struct StepInsert {
    pub run_id: String,
    pub event_id: i64,
    pub event_type: String,
    pub name: String,
    pub status: String,
    pub timestamp_ms: i64,
    pub duration_ms: Option<i64>,
    pub parent_event_id: Option<i64>,
    pub blob: Vec<u8>,
    pub blob_codec: String,
}

/// SQLite-backed store. Cheap to clone; connections are pooled.
#[derive(Clone)]
pub struct TraceStore {
    pool: SqlitePool,
    pipeline: std::sync::Arc<Pipeline>,
}

impl TraceStore {
    /// Open (creating if missing) the store at `config.db_path` and run
    /// migrations.
    pub async fn open(config: &TraceConfig) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        set_db_file_permissions(&config.db_path);
        migrate(&pool).await?;

        Ok(Self {
            pool,
            pipeline: std::sync::Arc::new(Pipeline::new(config)?),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn pipeline(&self) -> std::sync::Arc<Pipeline> {
        std::sync::Arc::clone(&self.pipeline)
    }

    /// Cheap connectivity probe for health checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------

    pub async fn run_exists(&self, run_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Apply every op of one batch in a single transaction. Either the whole
    /// batch commits or none of it does.
    pub async fn apply_batch(&self, ops: &[BatchOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                BatchOp::InsertRun {
                    id,
                    name,
                    started_at_ms,
                    user_id,
                    session_id,
                    parent_run_id,
                    metadata,
                } => {
                    sqlx::query(
                        "INSERT OR IGNORE INTO runs \
                         (id, name, status, started_at_ms, user_id, session_id, parent_run_id, metadata) \
                         VALUES (?, ?, 'running', ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(name)
                    .bind(started_at_ms)
                    .bind(user_id)
                    .bind(session_id)
                    .bind(parent_run_id)
                    .bind(metadata.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                BatchOp::InsertStep(step) => {
                    sqlx::query(
                        "INSERT INTO steps \
                         (run_id, event_id, event_type, name, status, timestamp_ms, duration_ms, parent_event_id, blob, blob_codec) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&step.run_id)
                    .bind(step.event_id)
                    .bind(&step.event_type)
                    .bind(&step.name)
                    .bind(&step.status)
                    .bind(step.timestamp_ms)
                    .bind(step.duration_ms)
                    .bind(step.parent_event_id)
                    .bind(&step.blob)
                    .bind(&step.blob_codec)
                    .execute(&mut *tx)
                    .await?;
                }
                BatchOp::FinishRun {
                    run_id,
                    outcome,
                    ended_at_ms,
                } => {
                    // Guard the state machine: running is the only state a
                    // run can leave.
                    sqlx::query(
                        "UPDATE runs SET status = ?, ended_at_ms = ? \
                         WHERE id = ? AND status = 'running'",
                    )
                    .bind(outcome.as_str())
                    .bind(ended_at_ms)
                    .bind(run_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -----------------------------------------------------------------
    // Read contract
    // -----------------------------------------------------------------

    pub async fn list_runs(&self, filter: &ListRunsFilter) -> Result<(Vec<RunRow>, i64)> {
        let mut clauses: Vec<&str> = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if filter.user_id.is_some() {
            clauses.push("user_id = ?");
        }
        if filter.session_id.is_some() {
            clauses.push("session_id = ?");
        }
        if filter.search.is_some() {
            clauses.push("name COLLATE NOCASE LIKE ? ESCAPE '\\'");
        }
        if filter.started_after.is_some() {
            clauses.push("started_at_ms >= ?");
        }
        if filter.started_before.is_some() {
            clauses.push("started_at_ms <= ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let search_like = filter
            .search
            .as_ref()
            .map(|s| format!("%{}%", like_escape(s)));

        let count_sql = format!("SELECT COUNT(*) AS n FROM runs{where_sql}");
        let mut count_query = sqlx::query(&count_sql);
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
        }
        if let Some(user_id) = &filter.user_id {
            count_query = count_query.bind(user_id);
        }
        if let Some(session_id) = &filter.session_id {
            count_query = count_query.bind(session_id);
        }
        if let Some(like) = &search_like {
            count_query = count_query.bind(like);
        }
        if let Some(after) = filter.started_after {
            count_query = count_query.bind(after);
        }
        if let Some(before) = filter.started_before {
            count_query = count_query.bind(before);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        let limit = if filter.limit == 0 {
            MAX_LIST_LIMIT
        } else {
            filter.limit.min(MAX_LIST_LIMIT)
        };
        let list_sql = format!(
            "SELECT * FROM runs{where_sql} ORDER BY started_at_ms DESC LIMIT ? OFFSET ?"
        );
        let mut list_query = sqlx::query(&list_sql);
        if let Some(status) = filter.status {
            list_query = list_query.bind(status.as_str());
        }
        if let Some(user_id) = &filter.user_id {
            list_query = list_query.bind(user_id);
        }
        if let Some(session_id) = &filter.session_id {
            list_query = list_query.bind(session_id);
        }
        if let Some(like) = &search_like {
            list_query = list_query.bind(like);
        }
        if let Some(after) = filter.started_after {
            list_query = list_query.bind(after);
        }
        if let Some(before) = filter.started_before {
            list_query = list_query.bind(before);
        }
        let rows = list_query
            .bind(limit as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let runs = rows
            .iter()
            .map(run_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((runs, total))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunDetail> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TraceError::NotFound(format!("run {run_id}")))?;
        let run = run_from_row(&row)?;

        let counts = sqlx::query(
            "SELECT COUNT(*) AS steps, \
             COALESCE(SUM(CASE WHEN event_type = 'error' THEN 1 ELSE 0 END), 0) AS errors \
             FROM steps WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RunDetail {
            run,
            step_count: counts.try_get("steps")?,
            error_count: counts.try_get("errors")?,
        })
    }

    pub async fn get_steps(
        &self,
        run_id: &str,
        event_type: Option<&str>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<StepRow>> {
        if !self.run_exists(run_id).await? {
            return Err(TraceError::NotFound(format!("run {run_id}")));
        }

        let mut sql = String::from("SELECT * FROM steps WHERE run_id = ?");
        if event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        sql.push_str(" ORDER BY timestamp_ms ASC, id ASC");
        if limit.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut q = sqlx::query(&sql).bind(run_id);
        if let Some(t) = event_type {
            q = q.bind(t);
        }
        if let Some(l) = limit {
            q = q.bind(l as i64).bind(offset as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.step_from_row(row)).collect()
    }

    pub async fn get_timeline(&self, run_id: &str) -> Result<Vec<TimelineEntry>> {
        if !self.run_exists(run_id).await? {
            return Err(TraceError::NotFound(format!("run {run_id}")));
        }
        let rows = sqlx::query(
            "SELECT id, event_id, event_type, name, timestamp_ms, duration_ms, status, parent_event_id \
             FROM steps WHERE run_id = ? ORDER BY timestamp_ms ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TimelineEntry {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    event_type: row.try_get("event_type")?,
                    name: row.try_get("name")?,
                    timestamp_ms: row.try_get("timestamp_ms")?,
                    duration_ms: row.try_get("duration_ms")?,
                    status: row.try_get("status")?,
                    parent_event_id: row.try_get("parent_event_id")?,
                })
            })
            .collect()
    }

    /// Fully decoded payload of a single step. Decode failures surface as
    /// errors here, unlike the lenient list path.
    pub async fn get_step_data(&self, run_id: &str, step_id: i64) -> Result<Value> {
        let row = sqlx::query("SELECT blob, blob_codec FROM steps WHERE run_id = ? AND id = ?")
            .bind(run_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TraceError::NotFound(format!("step {step_id} of run {run_id}")))?;

        let blob: Vec<u8> = row.try_get("blob")?;
        let codec = BlobCodec::parse(row.try_get("blob_codec")?)?;
        self.pipeline.decode(&blob, &codec)
    }

    pub async fn export_run(&self, run_id: &str) -> Result<RunExport> {
        let detail = self.get_run(run_id).await?;
        let timeline = self.get_steps(run_id, None, None, 0).await?;
        Ok(RunExport {
            run: detail.run,
            timeline,
        })
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let total_runs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM runs")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let by_status = sqlx::query("SELECT status, COUNT(*) AS n FROM runs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let runs_by_status = by_status
            .iter()
            .map(|r| Ok((r.try_get::<String, _>("status")?, r.try_get::<i64, _>("n")?)))
            .collect::<Result<Vec<_>>>()?;

        let total_steps: i64 = sqlx::query("SELECT COUNT(*) AS n FROM steps")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let by_type =
            sqlx::query("SELECT event_type, COUNT(*) AS n FROM steps GROUP BY event_type")
                .fetch_all(&self.pool)
                .await?;
        let steps_by_type = by_type
            .iter()
            .map(|r| {
                Ok((
                    r.try_get::<String, _>("event_type")?,
                    r.try_get::<i64, _>("n")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let db_size_bytes: i64 = sqlx::query(
            "SELECT page_count * page_size AS size \
             FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("size")?;

        Ok(StoreStats {
            total_runs,
            runs_by_status,
            total_steps,
            steps_by_type,
            db_size_bytes,
        })
    }

    // -----------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------

    /// Delete runs started before `now − older_than_days`; steps cascade.
    pub async fn prune(&self, older_than_days: u32) -> Result<u64> {
        let cutoff_ms = now_ms() - i64::from(older_than_days) * 86_400_000;
        let result = sqlx::query("DELETE FROM runs WHERE started_at_ms < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, older_than_days, "pruned old runs");
        }
        Ok(deleted)
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Atomic snapshot copy. Fails if `path` already exists.
    pub async fn backup(&self, path: &str) -> Result<()> {
        if Path::new(path).exists() {
            return Err(TraceError::StoreFatal(format!(
                "backup target '{path}' already exists"
            )));
        }
        sqlx::query("VACUUM INTO ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        info!(path, "database backup written");
        Ok(())
    }

    fn step_from_row(&self, row: &SqliteRow) -> Result<StepRow> {
        let id: i64 = row.try_get("id")?;
        let blob: Vec<u8> = row.try_get("blob")?;
        let codec_tag: String = row.try_get("blob_codec")?;

        let data = match BlobCodec::parse(&codec_tag).and_then(|c| self.pipeline.decode(&blob, &c))
        {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(step_id = id, "failed to decode step blob: {e}");
                None
            }
        };

        Ok(StepRow {
            id,
            run_id: row.try_get("run_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            timestamp_ms: row.try_get("timestamp_ms")?,
            duration_ms: row.try_get("duration_ms")?,
            parent_event_id: row.try_get("parent_event_id")?,
            data,
        })
    }
}

fn run_from_row(row: &SqliteRow) -> Result<RunRow> {
    let status_raw: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| TraceError::StoreFatal(format!("unknown run status '{status_raw}'")))?;
    let started_at_ms: i64 = row.try_get("started_at_ms")?;
    let ended_at_ms: Option<i64> = row.try_get("ended_at_ms")?;
    let metadata_raw: String = row.try_get("metadata")?;
    let metadata =
        serde_json::from_str(&metadata_raw).unwrap_or(Value::Object(serde_json::Map::new()));

    Ok(RunRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status,
        started_at_ms,
        ended_at_ms,
        duration_ms: ended_at_ms.map(|end| end - started_at_ms),
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        parent_run_id: row.try_get("parent_run_id")?,
        metadata,
    })
}

/// Escape LIKE wildcards so search terms match literally. Pairs with the
/// `ESCAPE '\'` clause on the search queries.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Idempotent schema setup.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at_ms INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
            started_at_ms INTEGER NOT NULL,
            ended_at_ms INTEGER,
            user_id TEXT,
            session_id TEXT,
            parent_run_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}'
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            event_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'ok',
            timestamp_ms INTEGER NOT NULL,
            duration_ms INTEGER,
            parent_event_id INTEGER,
            blob BLOB NOT NULL,
            blob_codec TEXT NOT NULL,
            UNIQUE (run_id, event_id)
        )",
    )
    .execute(pool)
    .await?;

    for idx in [
        "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at_ms DESC)",
        "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
        "CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id)",
        "CREATE INDEX IF NOT EXISTS idx_steps_run_time ON steps(run_id, timestamp_ms)",
        "CREATE INDEX IF NOT EXISTS idx_steps_time ON steps(timestamp_ms)",
    ] {
        sqlx::query(idx).execute(pool).await?;
    }

    sqlx::query("INSERT OR IGNORE INTO schema_version (version, applied_at_ms) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind(now_ms())
        .execute(pool)
        .await?;

    Ok(())
}

/// Owner-only read/write on the database and its WAL side files.
#[cfg(unix)]
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        warn!("failed to set permissions on {db_path}: {e}");
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{db_path}{suffix}");
        if Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                warn!("failed to set permissions on {path}: {e}");
            }
        }
    }
}

#[cfg(not(unix))]
fn set_db_file_permissions(_db_path: &str) {}
