use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::dispatcher::EagerDispatcher;
use crate::engine::error::WorkflowError;
use crate::engine::planner;
use crate::engine::types::{EngineConfig, ErrorInfo, LifecycleMode, TaskOutcome, TaskStatus};
use crate::records::{Node, RecordStore, TaskRecord};
use crate::tasks::TaskRegistry;

/// Per-invocation view handed to task implementations: the record snapshot,
/// bound params, progress reporting and engine access for nested sub-plans.
pub struct TaskHandle {
    record: TaskRecord,
    prev: Option<serde_json::Value>,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn RecordStore>,
    config: Arc<EngineConfig>,
}

impl TaskHandle {
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.record.params
    }

    /// Result of the preceding leaf when this task runs inside a chain.
    pub fn prev_result(&self) -> Option<&serde_json::Value> {
        self.prev.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist progress as `round(100 * current / total)`. Updates are
    /// best-effort and monotonic non-decreasing; the store drops regressions.
    pub async fn set_progress(&self, current: u64, total: u64) -> Result<()> {
        let pct = if total == 0 {
            100
        } else {
            (((current.min(total)) * 100 + total / 2) / total) as u8
        };
        self.store.set_task_progress(self.record.id, pct).await
    }

    /// Execute a nested sub-plan inline, regardless of the engine mode.
    /// Sub-plans spawned from inside a leaf must never block on the worker
    /// pool the leaf itself occupies.
    pub async fn run_eagerly(&self, node: &Node) -> Result<Vec<TaskOutcome>> {
        let plan = planner::plan(self.store.as_ref(), node, LifecycleMode::Run, false).await?;
        self.execute_plan_eagerly(&plan, None).await
    }

    /// Run already-persisted task records as an inline chain, threading
    /// each leaf's result into the next and halting on the first failure.
    /// `seed` becomes the first leaf's previous result, which lets a
    /// resumed chain pick up where the last completed leaf left off.
    pub async fn run_chain_eagerly(
        &self,
        tasks: &[Uuid],
        seed: Option<serde_json::Value>,
    ) -> Result<Vec<TaskOutcome>> {
        let plan = planner::Plan::Chain(tasks.iter().copied().map(planner::Plan::Leaf).collect());
        self.execute_plan_eagerly(&plan, seed).await
    }

    async fn execute_plan_eagerly(
        &self,
        plan: &planner::Plan,
        seed: Option<serde_json::Value>,
    ) -> Result<Vec<TaskOutcome>> {
        let runtime = TaskRuntime::new(
            self.registry.clone(),
            self.store.clone(),
            self.config.clone(),
        );
        EagerDispatcher::new(runtime).execute_seeded(plan, seed).await
    }
}

/// Executes a single leaf: status transitions, parameter validation,
/// handler invocation and outcome recording.
#[derive(Clone)]
pub struct TaskRuntime {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn RecordStore>,
    config: Arc<EngineConfig>,
}

impl TaskRuntime {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn RecordStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Run one task record. Leaf failures are captured into the record's
    /// `einfo` and reported through the outcome; an `Err` here means the
    /// store itself failed.
    pub async fn execute(
        &self,
        task_id: Uuid,
        prev: Option<serde_json::Value>,
    ) -> Result<TaskOutcome> {
        let record = self.store.get_task(task_id).await?;

        // Pure composites group children and have nothing to execute.
        if record.composite {
            return Ok(TaskOutcome {
                task: task_id,
                status: TaskStatus::Success,
                result: None,
                error: None,
            });
        }

        self.store
            .set_task_status(task_id, TaskStatus::Started)
            .await?;
        self.store
            .set_task_time_started(task_id, Some(Utc::now()))
            .await?;
        self.store.set_task_einfo(task_id, None).await?;

        info!(task = %task_id, name = %record.name, undo = record.undo_type, "running task");

        let handler = match self.registry.resolve(&record.name) {
            Ok(h) => h,
            Err(e) => return self.fail(task_id, &record, e).await,
        };

        if let Some(schema) = handler.params_schema()
            && let Err(message) = validate_params(&schema, &record.params)
        {
            let err = WorkflowError::Parameter {
                task: record.name.clone(),
                message,
            };
            return self.fail(task_id, &record, err.into()).await;
        }

        let handle = TaskHandle {
            record: record.clone(),
            prev,
            registry: self.registry.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
        };

        let invoked = if record.undo_type {
            handler.undo(&handle).await.map(|_| serde_json::Value::Null)
        } else {
            handler.run(&handle).await
        };

        match invoked {
            Ok(value) => {
                self.store
                    .set_task_result(task_id, Some(value.clone()))
                    .await?;
                self.store
                    .set_task_status(task_id, TaskStatus::Success)
                    .await?;
                self.store.set_task_progress(task_id, 100).await?;
                self.store
                    .set_task_time_done(task_id, Some(Utc::now()))
                    .await?;

                if !record.undo_type
                    && let Some(outcome) = handler.event_outcome_success(&record.params)
                {
                    self.store
                        .set_task_event_outcome(task_id, Some(outcome))
                        .await?;
                }

                info!(task = %task_id, name = %record.name, "task succeeded");

                Ok(TaskOutcome {
                    task: task_id,
                    status: TaskStatus::Success,
                    result: Some(value),
                    error: None,
                })
            }
            Err(e) => self.fail(task_id, &record, e).await,
        }
    }

    async fn fail(
        &self,
        task_id: Uuid,
        record: &TaskRecord,
        error: anyhow::Error,
    ) -> Result<TaskOutcome> {
        let einfo = capture(&error);
        warn!(
            task = %task_id,
            name = %record.name,
            kind = %einfo.kind,
            error = %einfo.message,
            "task failed"
        );

        self.store
            .set_task_einfo(task_id, Some(einfo.clone()))
            .await?;
        self.store
            .set_task_status(task_id, TaskStatus::Failure)
            .await?;
        self.store.set_task_progress(task_id, 100).await?;
        self.store
            .set_task_time_done(task_id, Some(Utc::now()))
            .await?;

        Ok(TaskOutcome {
            task: task_id,
            status: TaskStatus::Failure,
            result: None,
            error: Some(einfo),
        })
    }
}

/// Classify an error into the persisted `einfo` record.
fn capture(error: &anyhow::Error) -> ErrorInfo {
    let kind = error
        .downcast_ref::<WorkflowError>()
        .map(WorkflowError::kind)
        .unwrap_or("LeafFailure");

    ErrorInfo {
        kind: kind.to_string(),
        message: format!("{:#}", error),
        traceback: Some(format!("{:?}", error)),
    }
}

fn validate_params(schema: &serde_json::Value, params: &serde_json::Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    let errors: Vec<String> = validator
        .iter_errors(params)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
