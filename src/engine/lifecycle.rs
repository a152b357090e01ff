use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::engine::dispatcher::{Dispatcher, EagerDispatcher, QueuedDispatcher};
use crate::engine::planner::{self, Plan};
use crate::engine::queue::WorkQueue;
use crate::engine::runtime::TaskRuntime;
use crate::engine::types::{EngineConfig, LifecycleMode, TaskOutcome};
use crate::records::{Node, RecordStore};
use crate::tasks::TaskRegistry;

/// The lifecycle operators: run, undo, retry and resume over a step/task
/// tree. Plans are dispatched eagerly or through the worker pools
/// depending on the engine configuration.
pub struct WorkflowEngine {
    runtime: TaskRuntime,
    config: Arc<EngineConfig>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn RecordStore>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let runtime = TaskRuntime::new(registry, store, config.clone());

        let dispatcher: Arc<dyn Dispatcher> = if config.eager_mode {
            Arc::new(EagerDispatcher::new(runtime.clone()))
        } else {
            let queue = WorkQueue::start(runtime.clone(), &config.worker_pools);
            Arc::new(QueuedDispatcher::new(queue, runtime.clone()))
        };

        Self {
            runtime,
            config,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.runtime.store()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.runtime.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan a node in the given mode without dispatching it.
    pub async fn plan(&self, node: &Node, mode: LifecycleMode) -> Result<Plan> {
        planner::plan(self.store().as_ref(), node, mode, false).await
    }

    /// Execute the node's tree.
    pub async fn run(&self, node: &Node) -> Result<Vec<TaskOutcome>> {
        self.dispatch(node, LifecycleMode::Run, false).await
    }

    /// Reverse the node's already-executed tasks by creating and running
    /// undo records, tasks before child steps, in reverse declared order.
    pub async fn undo(&self, node: &Node, only_failed: bool) -> Result<Vec<TaskOutcome>> {
        self.dispatch(node, LifecycleMode::Undo, only_failed).await
    }

    /// Re-execute failed or undone tasks through replacement records;
    /// still-pending tasks are carried along so interrupted chains finish.
    pub async fn retry(&self, node: &Node) -> Result<Vec<TaskOutcome>> {
        self.dispatch(node, LifecycleMode::Retry, false).await
    }

    /// Run only the work that is still pending.
    pub async fn resume(&self, node: &Node) -> Result<Vec<TaskOutcome>> {
        self.dispatch(node, LifecycleMode::Resume, false).await
    }

    /// Fire-and-forget variant of `run`; the plan is built before this
    /// returns, execution continues in the background.
    pub async fn run_detached(&self, node: &Node) -> Result<()> {
        self.dispatch_detached(node, LifecycleMode::Run, false).await
    }

    pub async fn undo_detached(&self, node: &Node, only_failed: bool) -> Result<()> {
        self.dispatch_detached(node, LifecycleMode::Undo, only_failed)
            .await
    }

    pub async fn retry_detached(&self, node: &Node) -> Result<()> {
        self.dispatch_detached(node, LifecycleMode::Retry, false)
            .await
    }

    pub async fn resume_detached(&self, node: &Node) -> Result<()> {
        self.dispatch_detached(node, LifecycleMode::Resume, false)
            .await
    }

    async fn dispatch(
        &self,
        node: &Node,
        mode: LifecycleMode,
        only_failed: bool,
    ) -> Result<Vec<TaskOutcome>> {
        let plan = planner::plan(self.store().as_ref(), node, mode, only_failed).await?;
        info!(node = %node.id(), mode = ?mode, leaves = plan.leaves().len(), "dispatching plan");

        let outcomes = self.dispatcher.execute(&plan).await?;

        if self.config.eager_mode
            && self.config.propagate_exceptions
            && let Some(failed) = outcomes.iter().find(|o| o.is_failure())
        {
            let einfo = failed.error.clone();
            return Err(anyhow::anyhow!(
                "task {} failed: {}",
                failed.task,
                einfo.map(|e| e.message).unwrap_or_default()
            ));
        }

        Ok(outcomes)
    }

    async fn dispatch_detached(
        &self,
        node: &Node,
        mode: LifecycleMode,
        only_failed: bool,
    ) -> Result<()> {
        let plan = planner::plan(self.store().as_ref(), node, mode, only_failed).await?;
        let dispatcher = self.dispatcher.clone();
        let id = node.id();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.execute(&plan).await {
                tracing::error!(node = %id, error = %e, "detached plan failed");
            }
        });
        Ok(())
    }
}
