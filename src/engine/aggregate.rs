use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::engine::types::TaskStatus;
use crate::records::{RecordStore, StepRecord, TaskRecord};

/// Aggregates are pure functions over the persisted tree; they read
/// committed state and are eventually consistent with running workers.

fn rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Failure => 3,
        TaskStatus::Started => 2,
        // Prepared and retry-announced records read as not-yet-done.
        TaskStatus::Pending | TaskStatus::Prepared | TaskStatus::Retry => 1,
        TaskStatus::Success => 0,
    }
}

fn from_rank(rank: u8) -> TaskStatus {
    match rank {
        3 => TaskStatus::Failure,
        2 => TaskStatus::Started,
        1 => TaskStatus::Pending,
        _ => TaskStatus::Success,
    }
}

/// Derived status of a step: the precedence reduction
/// `FAILURE > STARTED > PENDING > SUCCESS` over child steps and live
/// tasks. An empty step is `SUCCESS`.
pub fn step_status<'a>(
    store: &'a dyn RecordStore,
    step: &'a StepRecord,
) -> BoxFuture<'a, Result<TaskStatus>> {
    Box::pin(async move {
        let child_steps = store.child_steps(step.id).await?;
        let tasks = store.live_tasks(step.id).await?;

        if child_steps.is_empty() && tasks.is_empty() {
            return Ok(TaskStatus::Success);
        }

        let mut worst = 0;
        for child in &child_steps {
            worst = worst.max(rank(step_status(store, child).await?));
            if worst == 3 {
                return Ok(TaskStatus::Failure);
            }
        }
        for task in &tasks {
            worst = worst.max(rank(task_status(store, task).await?));
            if worst == 3 {
                return Ok(TaskStatus::Failure);
            }
        }
        Ok(from_rank(worst))
    })
}

/// Derived status of a task.
///
/// A retried task transparently reports its replacement's status; an
/// undone task without a replacement reads as `PENDING` (awaiting retry).
/// Otherwise a stamped `FAILURE` wins, and the task's own status is
/// reduced together with its live children — so a failed chain surfaces
/// as `FAILURE` even while the owning task has not been stamped yet.
pub fn task_status<'a>(
    store: &'a dyn RecordStore,
    task: &'a TaskRecord,
) -> BoxFuture<'a, Result<TaskStatus>> {
    Box::pin(async move {
        if let Some(retried) = task.retried {
            let replacement = store.get_task(retried).await?;
            return task_status(store, &replacement).await;
        }
        if task.undone.is_some() {
            return Ok(TaskStatus::Pending);
        }
        if task.status == TaskStatus::Failure {
            return Ok(TaskStatus::Failure);
        }

        let children = store.live_child_tasks(task.id).await?;
        let mut worst = rank(task.status);
        for child in &children {
            worst = worst.max(rank(task_status(store, child).await?));
            if worst == 3 {
                break;
            }
        }
        Ok(from_rank(worst))
    })
}

/// Derived progress of a step: the average over child steps and live
/// tasks, integer-truncated. Undone-but-unretried tasks count toward the
/// denominator but contribute nothing until retried.
pub fn step_progress<'a>(
    store: &'a dyn RecordStore,
    step: &'a StepRecord,
) -> BoxFuture<'a, Result<u8>> {
    Box::pin(async move {
        let child_steps = store.child_steps(step.id).await?;
        let tasks = store.live_tasks(step.id).await?;

        let total = (child_steps.len() + tasks.len()) as u64;
        if total == 0 {
            return Ok(100);
        }

        let mut sum: u64 = 0;
        for child in &child_steps {
            sum += step_progress(store, child).await? as u64;
        }
        for task in &tasks {
            if task.undone.is_none() {
                sum += task.progress as u64;
            }
        }
        Ok((sum / total) as u8)
    })
}

/// True when any descendant task has been undone and not yet retried.
pub fn step_undone<'a>(
    store: &'a dyn RecordStore,
    step: &'a StepRecord,
) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        if !store.undone_unretried_tasks(step.id).await?.is_empty() {
            return Ok(true);
        }
        for task in store.tasks_of_step(step.id).await? {
            if task_undone(store, task.id).await? {
                return Ok(true);
            }
        }
        for child in store.child_steps(step.id).await? {
            if step_undone(store, &child).await? {
                return Ok(true);
            }
        }
        Ok(false)
    })
}

fn task_undone(store: &dyn RecordStore, task: Uuid) -> BoxFuture<'_, Result<bool>> {
    Box::pin(async move {
        for child in store.child_tasks(task).await? {
            if child.undone.is_some() && child.retried.is_none() {
                return Ok(true);
            }
            if task_undone(store, child.id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    })
}

/// Start time of the first task (by declared order) under the step.
pub async fn step_time_started(
    store: &dyn RecordStore,
    step: &StepRecord,
) -> Result<Option<DateTime<Utc>>> {
    Ok(store
        .tasks_of_step(step.id)
        .await?
        .first()
        .and_then(|t| t.time_started))
}

/// Completion time of the first task (by declared order) under the step.
pub async fn step_time_done(
    store: &dyn RecordStore,
    step: &StepRecord,
) -> Result<Option<DateTime<Utc>>> {
    Ok(store
        .tasks_of_step(step.id)
        .await?
        .first()
        .and_then(|t| t.time_done))
}
