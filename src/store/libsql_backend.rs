//! libSQL ledger backend.
//!
//! Conditional updates are optimistic: read the row, evaluate the predicate
//! in Rust, then write with `WHERE id = ? AND version = ?`. A zero row count
//! means another writer got there first, so the update re-reads and tries
//! again against the fresh record.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params, params::Params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::predicate::{TaskFilter, TaskPredicate, TaskUpdate};
use crate::store::traits::TaskLedger;
use crate::tasks::{Task, TaskId, TaskResponse};

/// Re-reads allowed before a contended conditional update gives up.
const MAX_CAS_ATTEMPTS: usize = 8;

const TASK_COLUMNS: &str = "id, account_id, task_type, payload, mode, status, capabilities, \
    assigned_worker_id, created_at, expiry_at, started_at, last_broadcast_at, broadcast_count, \
    validation_started_at, validating_workers, validation_complete_workers, \
    already_tried_workers, abort_pending_for, wait_id, timeout_ms, result, version";

/// libSQL task ledger.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db).await?;
        info!(path = %path.display(), "Task ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Write every mutable column, guarded by the version the caller read.
    async fn write_if_version(&self, task: &Task, read_version: i64) -> Result<bool, DatabaseError> {
        let mut values = mutable_values(task)?;
        values.push(Value::Text(task.id.to_string()));
        values.push(Value::Integer(read_version));

        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET task_type = ?1, payload = ?2, mode = ?3, status = ?4, \
                 capabilities = ?5, assigned_worker_id = ?6, expiry_at = ?7, started_at = ?8, \
                 last_broadcast_at = ?9, broadcast_count = ?10, validation_started_at = ?11, \
                 validating_workers = ?12, validation_complete_workers = ?13, \
                 already_tried_workers = ?14, abort_pending_for = ?15, wait_id = ?16, \
                 timeout_ms = ?17, result = ?18, version = ?19 \
                 WHERE id = ?20 AND version = ?21",
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conditional_update: {e}")))?;
        Ok(changed > 0)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Integer(dt.timestamp_millis()),
        None => Value::Null,
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("column {column}: {e}")))
}

/// Values for every column except id, account_id and created_at, in the
/// order `write_if_version` binds them.
fn mutable_values(task: &Task) -> Result<Vec<Value>, DatabaseError> {
    let result = match &task.result {
        Some(response) => Value::Text(to_json(response)?),
        None => Value::Null,
    };
    Ok(vec![
        Value::Text(task.task_type.clone()),
        Value::Text(to_json(&task.payload)?),
        Value::Text(task.mode.as_str().to_string()),
        Value::Text(task.status.as_str().to_string()),
        Value::Text(to_json(&task.capabilities)?),
        opt_text(task.assigned_worker_id.as_deref()),
        Value::Integer(millis(task.expiry_at)),
        opt_millis(task.started_at),
        opt_millis(task.last_broadcast_at),
        Value::Integer(i64::from(task.broadcast_count)),
        opt_millis(task.validation_started_at),
        Value::Text(to_json(&task.validating_workers)?),
        Value::Text(to_json(&task.validation_complete_workers)?),
        Value::Text(to_json(&task.already_tried_workers)?),
        opt_text(task.abort_pending_for.as_deref()),
        opt_text(task.wait_id.as_deref()),
        Value::Integer(task.timeout_ms as i64),
        result,
        Value::Integer(task.version),
    ])
}

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task id {id_str}: {e}")))?;
    let payload: String = row.get(3).map_err(col)?;
    let mode: String = row.get(4).map_err(col)?;
    let status: String = row.get(5).map_err(col)?;
    let capabilities: String = row.get(6).map_err(col)?;
    let validating: String = row.get(14).map_err(col)?;
    let complete: String = row.get(15).map_err(col)?;
    let tried: String = row.get(16).map_err(col)?;
    let result: Option<String> = row.get(20).ok();

    Ok(Task {
        id,
        account_id: row.get(1).map_err(col)?,
        task_type: row.get(2).map_err(col)?,
        payload: from_json(&payload, "payload")?,
        mode: mode.parse().map_err(DatabaseError::Serialization)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        capabilities: from_json(&capabilities, "capabilities")?,
        assigned_worker_id: row.get::<String>(7).ok(),
        created_at: from_millis(row.get(8).map_err(col)?),
        expiry_at: from_millis(row.get(9).map_err(col)?),
        started_at: row.get::<i64>(10).ok().map(from_millis),
        last_broadcast_at: row.get::<i64>(11).ok().map(from_millis),
        broadcast_count: row.get::<i64>(12).map_err(col)?.try_into().unwrap_or(u32::MAX),
        validation_started_at: row.get::<i64>(13).ok().map(from_millis),
        validating_workers: from_json::<BTreeSet<String>>(&validating, "validating_workers")?,
        validation_complete_workers: from_json(&complete, "validation_complete_workers")?,
        already_tried_workers: from_json(&tried, "already_tried_workers")?,
        abort_pending_for: row.get::<String>(17).ok(),
        wait_id: row.get::<String>(18).ok(),
        timeout_ms: row.get::<i64>(19).map_err(col)?.max(0) as u64,
        result: result
            .map(|s| from_json::<TaskResponse>(&s, "result"))
            .transpose()?,
        version: row.get(21).map_err(col)?,
    })
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskLedger for LibSqlLedger {
    async fn insert(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut values = vec![
            Value::Text(task.id.to_string()),
            Value::Text(task.account_id.clone()),
            Value::Integer(millis(task.created_at)),
        ];
        values.extend(mutable_values(task)?);

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO tasks (id, account_id, created_at, task_type, payload, mode, status, \
                 capabilities, assigned_worker_id, expiry_at, started_at, last_broadcast_at, \
                 broadcast_count, validation_started_at, validating_workers, \
                 validation_complete_workers, already_tried_workers, abort_pending_for, wait_id, \
                 timeout_ms, result, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22) \
                 ON CONFLICT(id) DO NOTHING",
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        if inserted == 0 {
            return Err(DatabaseError::DuplicateId(task.id));
        }
        debug!(task_id = %task.id, account_id = %task.account_id, "Task inserted into DB");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn conditional_update(
        &self,
        id: TaskId,
        predicate: &TaskPredicate,
        update: &TaskUpdate,
    ) -> Result<Option<Task>, DatabaseError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(mut task) = self.get(id).await? else {
                return Ok(None);
            };
            if !predicate.matches(&task) || !update.permits(&task) {
                return Ok(None);
            }

            let read_version = task.version;
            update.apply(&mut task);
            if self.write_if_version(&task, read_version).await? {
                return Ok(Some(task));
            }
            debug!(task_id = %id, attempt, "Version changed under conditional update, retrying");
        }

        warn!(task_id = %id, "Conditional update gave up under contention");
        Err(DatabaseError::Constraint(format!(
            "conditional_update {id}: version contention after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    async fn delete(&self, id: TaskId) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(deleted > 0)
    }

    async fn scan(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        // Narrow in SQL on the indexed columns, then apply the full filter in Rust.
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(account_id) = &filter.account_id {
            values.push(Value::Text(account_id.clone()));
            clauses.push(format!("account_id = ?{}", values.len()));
        }
        if !filter.statuses.is_empty() {
            let start = values.len() + 1;
            values.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
            clauses.push(format!(
                "status IN ({})",
                placeholders(start, filter.statuses.len())
            ));
        }
        if let Some(mode) = filter.mode {
            values.push(Value::Text(mode.as_str().to_string()));
            clauses.push(format!("mode = ?{}", values.len()));
        }
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let start = values.len() + 1;
            values.extend(ids.iter().map(|id| Value::Text(id.to_string())));
            clauses.push(format!("id IN ({})", placeholders(start, ids.len())));
        }
        if let Some(after) = filter.created_after {
            values.push(Value::Integer(millis(after)));
            clauses.push(format!("created_at > ?{}", values.len()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks{where_sql} ORDER BY created_at ASC, id ASC");

        let mut rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("scan_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let task = row_to_task(&row)?;
            if filter.matches(&task) {
                tasks.push(task);
                if filter.limit.is_some_and(|limit| tasks.len() >= limit) {
                    break;
                }
            }
        }
        Ok(tasks)
    }
}
