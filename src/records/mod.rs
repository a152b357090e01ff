pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::types::{ErrorInfo, TaskStatus};

/// A named composite workflow node owning ordered child steps and tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub name: String,
    pub user: String,
    pub parent_step: Option<Uuid>,
    pub parent_step_pos: i32,
    pub parallel: bool,
    pub hidden: bool,
    /// Domain back-reference, e.g. the information package this step works on.
    pub information_package: Option<Uuid>,
    pub created: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(name: &str, user: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            user: user.to_string(),
            parent_step: None,
            parent_step_pos: 0,
            parallel: false,
            hidden: false,
            information_package: None,
            created: Utc::now(),
        }
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn under(mut self, parent: Uuid, pos: i32) -> Self {
        self.parent_step = Some(parent);
        self.parent_step_pos = pos;
        self
    }
}

/// A leaf workflow node bound to a registered task name.
///
/// Tasks can themselves own child tasks (sub-plans created at execution
/// time); `composite` marks records that exist purely to group children and
/// are exempt from registry validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub composite: bool,
    pub params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub progress: u8,
    pub time_started: Option<DateTime<Utc>>,
    pub time_done: Option<DateTime<Utc>>,
    /// Groups all records created by one undo or retry invocation.
    pub attempt: Uuid,
    pub parent_step: Option<Uuid>,
    pub parent_step_pos: i32,
    pub parent: Option<Uuid>,
    pub parent_pos: i32,
    pub parallel: bool,
    pub hidden: bool,
    pub undo_type: bool,
    /// The task that replaced this one after a retry.
    pub retried: Option<Uuid>,
    /// The undo record created to reverse this task.
    pub undone: Option<Uuid>,
    pub einfo: Option<ErrorInfo>,
    pub event_outcome: Option<String>,
    pub information_package: Option<Uuid>,
    pub created: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(name: &str, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            composite: false,
            params,
            result: None,
            status: TaskStatus::Pending,
            progress: 0,
            time_started: None,
            time_done: None,
            attempt: Uuid::new_v4(),
            parent_step: None,
            parent_step_pos: 0,
            parent: None,
            parent_pos: 0,
            parallel: false,
            hidden: false,
            undo_type: false,
            retried: None,
            undone: None,
            einfo: None,
            event_outcome: None,
            information_package: None,
            created: Utc::now(),
        }
    }

    pub fn in_step(mut self, step: Uuid, pos: i32) -> Self {
        self.parent_step = Some(step);
        self.parent_step_pos = pos;
        self
    }

    pub fn child_of(mut self, task: Uuid, pos: i32) -> Self {
        self.parent = Some(task);
        self.parent_pos = pos;
        self
    }

    /// A task is live while it has not been superseded by a retry record
    /// and is not itself an undo record.
    pub fn is_live(&self) -> bool {
        !self.undo_type && self.retried.is_none()
    }
}

/// The two node kinds of the workflow forest.
#[derive(Debug, Clone)]
pub enum Node {
    Step(StepRecord),
    Task(TaskRecord),
}

impl Node {
    pub fn id(&self) -> Uuid {
        match self {
            Node::Step(s) => s.id,
            Node::Task(t) => t.id,
        }
    }
}

/// Durable storage for step and task records.
///
/// Writes must be visible to concurrent readers at step boundaries
/// (read-committed or better). All result/status/progress fields are
/// written only by the task runtime for the owning leaf; undo/retry
/// pointers only by the lifecycle operators.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_step(&self, step: &StepRecord) -> Result<()>;
    async fn create_task(&self, task: &TaskRecord) -> Result<()>;

    async fn get_step(&self, id: Uuid) -> Result<StepRecord>;
    async fn get_task(&self, id: Uuid) -> Result<TaskRecord>;

    /// Delete a step and everything under it.
    async fn delete_step(&self, id: Uuid) -> Result<()>;

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()>;
    /// Monotonic: a lower value than the persisted one is ignored.
    async fn set_task_progress(&self, id: Uuid, progress: u8) -> Result<()>;
    async fn set_task_result(&self, id: Uuid, result: Option<serde_json::Value>) -> Result<()>;
    async fn set_task_einfo(&self, id: Uuid, einfo: Option<ErrorInfo>) -> Result<()>;
    async fn set_task_event_outcome(&self, id: Uuid, outcome: Option<String>) -> Result<()>;
    async fn set_task_time_started(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<()>;
    async fn set_task_time_done(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<()>;

    /// Child steps ordered by `(parent_step_pos, created)`.
    async fn child_steps(&self, step: Uuid) -> Result<Vec<StepRecord>>;
    /// All tasks directly under a step, ordered by `(parent_step_pos, created)`.
    async fn tasks_of_step(&self, step: Uuid) -> Result<Vec<TaskRecord>>;
    /// Tasks under a step with `undo_type = false AND retried IS NULL`.
    async fn live_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>>;
    /// Live tasks under a step with `status = FAILURE`.
    async fn failed_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>>;
    /// Tasks with `undone IS NULL AND undo_type = false AND status = PENDING`.
    async fn pending_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>>;
    /// Tasks with `undone IS NOT NULL AND retried IS NULL`.
    async fn undone_unretried_tasks(&self, step: Uuid) -> Result<Vec<TaskRecord>>;

    /// Child tasks of a task ordered by `(parent_pos, created)`.
    async fn child_tasks(&self, task: Uuid) -> Result<Vec<TaskRecord>>;
    /// Child tasks with `undo_type = false AND retried IS NULL`.
    async fn live_child_tasks(&self, task: Uuid) -> Result<Vec<TaskRecord>>;

    /// Create the undo record for `original` and point `original.undone` at
    /// it, atomically. The undo record copies the original's params and
    /// positions, with `undo_type = true`, `status = PREPARED` and the
    /// given attempt id. Fails with an integrity error when an outstanding
    /// undo already exists.
    async fn create_undo_task(&self, original: Uuid, attempt: Uuid) -> Result<TaskRecord>;

    /// Create the retry record for `original` and point `original.retried`
    /// at it, atomically. The replacement copies name, params and
    /// positions with `status = PREPARED` and a fresh attempt, and adopts
    /// the original's child tasks so an inherited sub-plan can be resumed.
    /// Fails with an integrity error when a retry already exists.
    async fn create_retry_task(&self, original: Uuid, attempt: Uuid) -> Result<TaskRecord>;
}

/// Copy shared by both stores when building an undo record.
pub(crate) fn undo_copy(original: &TaskRecord, attempt: Uuid) -> TaskRecord {
    TaskRecord {
        id: Uuid::new_v4(),
        name: original.name.clone(),
        composite: original.composite,
        params: original.params.clone(),
        result: None,
        status: TaskStatus::Prepared,
        progress: 0,
        time_started: None,
        time_done: None,
        attempt,
        parent_step: original.parent_step,
        parent_step_pos: original.parent_step_pos,
        parent: original.parent,
        parent_pos: original.parent_pos,
        parallel: original.parallel,
        hidden: original.hidden,
        undo_type: true,
        retried: None,
        undone: None,
        einfo: None,
        event_outcome: None,
        information_package: original.information_package,
        created: Utc::now(),
    }
}

/// Copy shared by both stores when building a retry record.
pub(crate) fn retry_copy(original: &TaskRecord, attempt: Uuid) -> TaskRecord {
    TaskRecord {
        id: Uuid::new_v4(),
        name: original.name.clone(),
        composite: original.composite,
        params: original.params.clone(),
        result: None,
        status: TaskStatus::Prepared,
        progress: 0,
        time_started: None,
        time_done: None,
        attempt,
        parent_step: original.parent_step,
        parent_step_pos: original.parent_step_pos,
        parent: original.parent,
        parent_pos: original.parent_pos,
        parallel: original.parallel,
        hidden: original.hidden,
        undo_type: false,
        retried: None,
        undone: None,
        einfo: None,
        event_outcome: None,
        information_package: original.information_package,
        created: Utc::now(),
    }
}
