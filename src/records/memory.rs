use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::error::WorkflowError;
use crate::engine::types::{ErrorInfo, TaskStatus};
use crate::records::{RecordStore, StepRecord, TaskRecord, retry_copy, undo_copy};

/// In-memory record store used by tests and nested sub-plan execution.
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    steps: HashMap<Uuid, StepRecord>,
    tasks: HashMap<Uuid, TaskRecord>,
}

impl MemoryRecordStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_steps(mut steps: Vec<StepRecord>) -> Vec<StepRecord> {
    steps.sort_by(|a, b| {
        (a.parent_step_pos, a.created, a.id).cmp(&(b.parent_step_pos, b.created, b.id))
    });
    steps
}

fn sort_step_tasks(mut tasks: Vec<TaskRecord>) -> Vec<TaskRecord> {
    tasks.sort_by(|a, b| {
        (a.parent_step_pos, a.created, a.id).cmp(&(b.parent_step_pos, b.created, b.id))
    });
    tasks
}

fn sort_child_tasks(mut tasks: Vec<TaskRecord>) -> Vec<TaskRecord> {
    tasks.sort_by(|a, b| (a.parent_pos, a.created, a.id).cmp(&(b.parent_pos, b.created, b.id)));
    tasks
}

impl Inner {
    fn task(&self, id: Uuid) -> Result<&TaskRecord> {
        self.tasks
            .get(&id)
            .ok_or_else(|| anyhow::anyhow!("task not found: {}", id))
    }

    fn task_mut(&mut self, id: Uuid) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("task not found: {}", id))
    }

    /// Sibling positions must be unique among live records of one parent.
    /// Undo and retry records copy the position of the task they mirror,
    /// so the check only considers live forward tasks.
    fn check_task_position(&self, task: &TaskRecord) -> Result<()> {
        if !task.is_live() {
            return Ok(());
        }
        let clash = match (task.parent_step, task.parent) {
            (Some(step), _) => self.tasks.values().any(|t| {
                t.parent_step == Some(step)
                    && t.is_live()
                    && t.parent_step_pos == task.parent_step_pos
                    && t.id != task.id
            }),
            (None, Some(parent)) => self.tasks.values().any(|t| {
                t.parent == Some(parent)
                    && t.is_live()
                    && t.parent_pos == task.parent_pos
                    && t.id != task.id
            }),
            (None, None) => false,
        };
        if clash {
            return Err(WorkflowError::Integrity(format!(
                "duplicate sibling position for task '{}'",
                task.name
            ))
            .into());
        }
        Ok(())
    }

    fn check_step_position(&self, step: &StepRecord) -> Result<()> {
        if let Some(parent) = step.parent_step {
            let clash = self.steps.values().any(|s| {
                s.parent_step == Some(parent)
                    && s.parent_step_pos == step.parent_step_pos
                    && s.id != step.id
            });
            if clash {
                return Err(WorkflowError::Integrity(format!(
                    "duplicate sibling position for step '{}'",
                    step.name
                ))
                .into());
            }
        }
        Ok(())
    }

    fn delete_step_rec(&mut self, id: Uuid) {
        let children: Vec<Uuid> = self
            .steps
            .values()
            .filter(|s| s.parent_step == Some(id))
            .map(|s| s.id)
            .collect();
        for child in children {
            self.delete_step_rec(child);
        }

        let tasks: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.parent_step == Some(id))
            .map(|t| t.id)
            .collect();
        for task in tasks {
            self.delete_task_rec(task);
        }

        self.steps.remove(&id);
    }

    fn delete_task_rec(&mut self, id: Uuid) {
        let children: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.parent == Some(id))
            .map(|t| t.id)
            .collect();
        for child in children {
            self.delete_task_rec(child);
        }
        self.tasks.remove(&id);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_step(&self, step: &StepRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_step_position(step)?;
        inner.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_task_position(task)?;
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<StepRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("step not found: {}", id))
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskRecord> {
        let inner = self.inner.lock().unwrap();
        inner.task(id).cloned()
    }

    async fn delete_step(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.delete_step_rec(id);
        Ok(())
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_mut(id)?.status = status;
        Ok(())
    }

    async fn set_task_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.task_mut(id)?;
        if progress > task.progress {
            task.progress = progress.min(100);
        }
        Ok(())
    }

    async fn set_task_result(&self, id: Uuid, result: Option<serde_json::Value>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_mut(id)?.result = result;
        Ok(())
    }

    async fn set_task_einfo(&self, id: Uuid, einfo: Option<ErrorInfo>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_mut(id)?.einfo = einfo;
        Ok(())
    }

    async fn set_task_event_outcome(&self, id: Uuid, outcome: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_mut(id)?.event_outcome = outcome;
        Ok(())
    }

    async fn set_task_time_started(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_mut(id)?.time_started = at;
        Ok(())
    }

    async fn set_task_time_done(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_mut(id)?.time_done = at;
        Ok(())
    }

    async fn child_steps(&self, step: Uuid) -> Result<Vec<StepRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_steps(
            inner
                .steps
                .values()
                .filter(|s| s.parent_step == Some(step))
                .cloned()
                .collect(),
        ))
    }

    async fn tasks_of_step(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_step_tasks(
            inner
                .tasks
                .values()
                .filter(|t| t.parent_step == Some(step))
                .cloned()
                .collect(),
        ))
    }

    async fn live_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_step_tasks(
            inner
                .tasks
                .values()
                .filter(|t| t.parent_step == Some(step) && t.is_live())
                .cloned()
                .collect(),
        ))
    }

    async fn failed_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_step_tasks(
            inner
                .tasks
                .values()
                .filter(|t| {
                    t.parent_step == Some(step) && t.is_live() && t.status == TaskStatus::Failure
                })
                .cloned()
                .collect(),
        ))
    }

    async fn pending_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_step_tasks(
            inner
                .tasks
                .values()
                .filter(|t| {
                    t.parent_step == Some(step)
                        && t.undone.is_none()
                        && !t.undo_type
                        && t.status == TaskStatus::Pending
                })
                .cloned()
                .collect(),
        ))
    }

    async fn undone_unretried_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_step_tasks(
            inner
                .tasks
                .values()
                .filter(|t| {
                    t.parent_step == Some(step) && t.undone.is_some() && t.retried.is_none()
                })
                .cloned()
                .collect(),
        ))
    }

    async fn child_tasks(&self, task: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_child_tasks(
            inner
                .tasks
                .values()
                .filter(|t| t.parent == Some(task))
                .cloned()
                .collect(),
        ))
    }

    async fn live_child_tasks(&self, task: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(sort_child_tasks(
            inner
                .tasks
                .values()
                .filter(|t| t.parent == Some(task) && t.is_live())
                .cloned()
                .collect(),
        ))
    }

    async fn create_undo_task(&self, original: Uuid, attempt: Uuid) -> Result<TaskRecord> {
        let mut inner = self.inner.lock().unwrap();
        let orig = inner.task(original)?.clone();
        if orig.undone.is_some() {
            return Err(WorkflowError::Integrity(format!(
                "task {} already has an outstanding undo",
                original
            ))
            .into());
        }

        let undo = undo_copy(&orig, attempt);
        inner.tasks.insert(undo.id, undo.clone());
        inner.task_mut(original)?.undone = Some(undo.id);
        Ok(undo)
    }

    async fn create_retry_task(&self, original: Uuid, attempt: Uuid) -> Result<TaskRecord> {
        let mut inner = self.inner.lock().unwrap();
        let orig = inner.task(original)?.clone();
        if orig.retried.is_some() {
            return Err(WorkflowError::Integrity(format!(
                "task {} has already been retried",
                original
            ))
            .into());
        }

        let retry = retry_copy(&orig, attempt);
        inner.tasks.insert(retry.id, retry.clone());
        inner.task_mut(original)?.retried = Some(retry.id);

        // The replacement inherits the original's sub-plan so a re-run can
        // pick up unfinished children instead of replanning from scratch.
        let children: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| t.parent == Some(original))
            .map(|t| t.id)
            .collect();
        for child in children {
            inner.task_mut(child)?.parent = Some(retry.id);
        }

        Ok(retry)
    }
}
