use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::engine::error::WorkflowError;
use crate::engine::types::{ErrorInfo, TaskStatus};
use crate::records::{RecordStore, StepRecord, TaskRecord, retry_copy, undo_copy};

/// sqlx-backed record store. The schema is created on connect; SQLite's
/// default isolation (serialized writers, snapshot readers) satisfies the
/// read-committed requirement.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    user TEXT NOT NULL,
    parent_step TEXT,
    parent_step_pos INTEGER NOT NULL DEFAULT 0,
    parallel INTEGER NOT NULL DEFAULT 0,
    hidden INTEGER NOT NULL DEFAULT 0,
    information_package TEXT,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    composite INTEGER NOT NULL DEFAULT 0,
    params TEXT NOT NULL,
    result TEXT,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    time_started TEXT,
    time_done TEXT,
    attempt TEXT NOT NULL,
    parent_step TEXT,
    parent_step_pos INTEGER NOT NULL DEFAULT 0,
    parent TEXT,
    parent_pos INTEGER NOT NULL DEFAULT 0,
    parallel INTEGER NOT NULL DEFAULT 0,
    hidden INTEGER NOT NULL DEFAULT 0,
    undo_type INTEGER NOT NULL DEFAULT 0,
    retried TEXT,
    undone TEXT,
    einfo TEXT,
    event_outcome TEXT,
    information_package TEXT,
    created TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_parent ON steps(parent_step);
CREATE INDEX IF NOT EXISTS idx_tasks_parent_step ON tasks(parent_step);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_undone ON tasks(undone);
CREATE INDEX IF NOT EXISTS idx_tasks_retried ON tasks(retried);
CREATE INDEX IF NOT EXISTS idx_tasks_step_pos ON tasks(parent_step, parent_step_pos);
"#;

impl SqliteRecordStore {
    /// Connect to a database URL (e.g. `sqlite://arkflow.db?mode=rwc`) and
    /// ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("failed to open record store at '{}'", url))?;
        Self::init(pool).await
    }

    /// A private in-memory database, handy for tests.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }
        Ok(Self { pool })
    }
}

fn uuid_col(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).with_context(|| format!("bad uuid in column '{}'", col))
}

fn opt_uuid_col(row: &SqliteRow, col: &str) -> Result<Option<Uuid>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|v| Uuid::parse_str(&v).with_context(|| format!("bad uuid in column '{}'", col)))
        .transpose()
}

fn time_col(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    Ok(DateTime::parse_from_rfc3339(&raw)
        .with_context(|| format!("bad timestamp in column '{}'", col))?
        .with_timezone(&Utc))
}

fn opt_time_col(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("bad timestamp in column '{}'", col))
    })
    .transpose()
}

fn step_from_row(row: &SqliteRow) -> Result<StepRecord> {
    Ok(StepRecord {
        id: uuid_col(row, "id")?,
        name: row.try_get("name")?,
        user: row.try_get("user")?,
        parent_step: opt_uuid_col(row, "parent_step")?,
        parent_step_pos: row.try_get("parent_step_pos")?,
        parallel: row.try_get("parallel")?,
        hidden: row.try_get("hidden")?,
        information_package: opt_uuid_col(row, "information_package")?,
        created: time_col(row, "created")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord> {
    let params: String = row.try_get("params")?;
    let result: Option<String> = row.try_get("result")?;
    let einfo: Option<String> = row.try_get("einfo")?;
    let status: String = row.try_get("status")?;

    Ok(TaskRecord {
        id: uuid_col(row, "id")?,
        name: row.try_get("name")?,
        composite: row.try_get("composite")?,
        params: serde_json::from_str(&params)?,
        result: result.map(|v| serde_json::from_str(&v)).transpose()?,
        status: status.parse()?,
        progress: row.try_get::<i64, _>("progress")? as u8,
        time_started: opt_time_col(row, "time_started")?,
        time_done: opt_time_col(row, "time_done")?,
        attempt: uuid_col(row, "attempt")?,
        parent_step: opt_uuid_col(row, "parent_step")?,
        parent_step_pos: row.try_get("parent_step_pos")?,
        parent: opt_uuid_col(row, "parent")?,
        parent_pos: row.try_get("parent_pos")?,
        parallel: row.try_get("parallel")?,
        hidden: row.try_get("hidden")?,
        undo_type: row.try_get("undo_type")?,
        retried: opt_uuid_col(row, "retried")?,
        undone: opt_uuid_col(row, "undone")?,
        einfo: einfo.map(|v| serde_json::from_str::<ErrorInfo>(&v)).transpose()?,
        event_outcome: row.try_get("event_outcome")?,
        information_package: opt_uuid_col(row, "information_package")?,
        created: time_col(row, "created")?,
    })
}

const INSERT_TASK: &str = r#"
INSERT INTO tasks (
    id, name, composite, params, result, status, progress,
    time_started, time_done, attempt,
    parent_step, parent_step_pos, parent, parent_pos,
    parallel, hidden, undo_type, retried, undone,
    einfo, event_outcome, information_package, created
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

fn bind_task<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    task: &'q TaskRecord,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>> {
    Ok(query
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(task.composite)
        .bind(serde_json::to_string(&task.params)?)
        .bind(
            task.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(task.status.to_string())
        .bind(task.progress as i64)
        .bind(task.time_started.map(|t| t.to_rfc3339()))
        .bind(task.time_done.map(|t| t.to_rfc3339()))
        .bind(task.attempt.to_string())
        .bind(task.parent_step.map(|v| v.to_string()))
        .bind(task.parent_step_pos)
        .bind(task.parent.map(|v| v.to_string()))
        .bind(task.parent_pos)
        .bind(task.parallel)
        .bind(task.hidden)
        .bind(task.undo_type)
        .bind(task.retried.map(|v| v.to_string()))
        .bind(task.undone.map(|v| v.to_string()))
        .bind(
            task.einfo
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&task.event_outcome)
        .bind(task.information_package.map(|v| v.to_string()))
        .bind(task.created.to_rfc3339()))
}

const LIVE: &str = "undo_type = 0 AND retried IS NULL";

/// Fetch a task inside an open transaction.
async fn get_task_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: Uuid,
) -> Result<TaskRecord> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task not found: {}", id))?;
    task_from_row(&row)
}

impl SqliteRecordStore {
    fn delete_step_rec(&self, id: Uuid) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let children = self.child_steps(id).await?;
            for child in children {
                self.delete_step_rec(child.id).await?;
            }
            let tasks = self.tasks_of_step(id).await?;
            for task in tasks {
                self.delete_task_rec(task.id).await?;
            }
            sqlx::query("DELETE FROM steps WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn delete_task_rec(&self, id: Uuid) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let children = self.child_tasks(id).await?;
            for child in children {
                self.delete_task_rec(child.id).await?;
            }
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    async fn step_tasks_where(&self, step: Uuid, clause: &str) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT * FROM tasks WHERE parent_step = ? AND {} \
             ORDER BY parent_step_pos, created, id",
            clause
        );
        let rows = sqlx::query(&sql)
            .bind(step.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_step(&self, step: &StepRecord) -> Result<()> {
        if let Some(parent) = step.parent_step {
            let clash: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM steps WHERE parent_step = ? AND parent_step_pos = ?",
            )
            .bind(parent.to_string())
            .bind(step.parent_step_pos)
            .fetch_one(&self.pool)
            .await?;
            if clash > 0 {
                return Err(WorkflowError::Integrity(format!(
                    "duplicate sibling position for step '{}'",
                    step.name
                ))
                .into());
            }
        }

        sqlx::query(
            "INSERT INTO steps (id, name, user, parent_step, parent_step_pos, \
             parallel, hidden, information_package, created) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(step.id.to_string())
        .bind(&step.name)
        .bind(&step.user)
        .bind(step.parent_step.map(|v| v.to_string()))
        .bind(step.parent_step_pos)
        .bind(step.parallel)
        .bind(step.hidden)
        .bind(step.information_package.map(|v| v.to_string()))
        .bind(step.created.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<()> {
        if task.is_live() {
            let clash: i64 = match (task.parent_step, task.parent) {
                (Some(step), _) => {
                    sqlx::query_scalar(&format!(
                        "SELECT COUNT(*) FROM tasks \
                         WHERE parent_step = ? AND parent_step_pos = ? AND {}",
                        LIVE
                    ))
                    .bind(step.to_string())
                    .bind(task.parent_step_pos)
                    .fetch_one(&self.pool)
                    .await?
                }
                (None, Some(parent)) => {
                    sqlx::query_scalar(&format!(
                        "SELECT COUNT(*) FROM tasks \
                         WHERE parent = ? AND parent_pos = ? AND {}",
                        LIVE
                    ))
                    .bind(parent.to_string())
                    .bind(task.parent_pos)
                    .fetch_one(&self.pool)
                    .await?
                }
                (None, None) => 0,
            };
            if clash > 0 {
                return Err(WorkflowError::Integrity(format!(
                    "duplicate sibling position for task '{}'",
                    task.name
                ))
                .into());
            }
        }

        bind_task(sqlx::query(INSERT_TASK), task)?
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<StepRecord> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("step not found: {}", id))?;
        step_from_row(&row)
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskRecord> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task not found: {}", id))?;
        task_from_row(&row)
    }

    async fn delete_step(&self, id: Uuid) -> Result<()> {
        self.delete_step_rec(id).await
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        sqlx::query("UPDATE tasks SET progress = MAX(progress, ?) WHERE id = ?")
            .bind(progress.min(100) as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_result(&self, id: Uuid, result: Option<serde_json::Value>) -> Result<()> {
        sqlx::query("UPDATE tasks SET result = ? WHERE id = ?")
            .bind(result.as_ref().map(serde_json::to_string).transpose()?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_einfo(&self, id: Uuid, einfo: Option<ErrorInfo>) -> Result<()> {
        sqlx::query("UPDATE tasks SET einfo = ? WHERE id = ?")
            .bind(einfo.as_ref().map(serde_json::to_string).transpose()?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_event_outcome(&self, id: Uuid, outcome: Option<String>) -> Result<()> {
        sqlx::query("UPDATE tasks SET event_outcome = ? WHERE id = ?")
            .bind(outcome)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_time_started(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE tasks SET time_started = ? WHERE id = ?")
            .bind(at.map(|t| t.to_rfc3339()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_time_done(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE tasks SET time_done = ? WHERE id = ?")
            .bind(at.map(|t| t.to_rfc3339()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn child_steps(&self, step: Uuid) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM steps WHERE parent_step = ? ORDER BY parent_step_pos, created, id",
        )
        .bind(step.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn tasks_of_step(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        self.step_tasks_where(step, "1 = 1").await
    }

    async fn live_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        self.step_tasks_where(step, LIVE).await
    }

    async fn failed_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        self.step_tasks_where(step, "undo_type = 0 AND retried IS NULL AND status = 'FAILURE'")
            .await
    }

    async fn pending_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        self.step_tasks_where(
            step,
            "undone IS NULL AND undo_type = 0 AND status = 'PENDING'",
        )
        .await
    }

    async fn undone_unretried_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        self.step_tasks_where(step, "undone IS NOT NULL AND retried IS NULL")
            .await
    }

    async fn child_tasks(&self, task: Uuid) -> Result<Vec<TaskRecord>> {
        let rows =
            sqlx::query("SELECT * FROM tasks WHERE parent = ? ORDER BY parent_pos, created, id")
                .bind(task.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn live_child_tasks(&self, task: Uuid) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT * FROM tasks WHERE parent = ? AND {} ORDER BY parent_pos, created, id",
            LIVE
        );
        let rows = sqlx::query(&sql)
            .bind(task.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn create_undo_task(&self, original: Uuid, attempt: Uuid) -> Result<TaskRecord> {
        let mut tx = self.pool.begin().await?;

        let orig = get_task_in_tx(&mut tx, original).await?;
        let undo = undo_copy(&orig, attempt);

        // Claim the pointer with a guarded update; losing a race to a
        // concurrent undo leaves zero rows affected.
        let claimed = sqlx::query("UPDATE tasks SET undone = ? WHERE id = ? AND undone IS NULL")
            .bind(undo.id.to_string())
            .bind(original.to_string())
            .execute(&mut *tx)
            .await?;
        if claimed.rows_affected() == 0 {
            return Err(WorkflowError::Integrity(format!(
                "task {} already has an outstanding undo",
                original
            ))
            .into());
        }

        bind_task(sqlx::query(INSERT_TASK), &undo)?
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(undo)
    }

    async fn create_retry_task(&self, original: Uuid, attempt: Uuid) -> Result<TaskRecord> {
        let mut tx = self.pool.begin().await?;

        let orig = get_task_in_tx(&mut tx, original).await?;
        let retry = retry_copy(&orig, attempt);

        let claimed = sqlx::query("UPDATE tasks SET retried = ? WHERE id = ? AND retried IS NULL")
            .bind(retry.id.to_string())
            .bind(original.to_string())
            .execute(&mut *tx)
            .await?;
        if claimed.rows_affected() == 0 {
            return Err(WorkflowError::Integrity(format!(
                "task {} has already been retried",
                original
            ))
            .into());
        }

        bind_task(sqlx::query(INSERT_TASK), &retry)?
            .execute(&mut *tx)
            .await?;
        // The replacement adopts the original's sub-plan.
        sqlx::query("UPDATE tasks SET parent = ? WHERE parent = ?")
            .bind(retry.id.to_string())
            .bind(original.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(retry)
    }
}
