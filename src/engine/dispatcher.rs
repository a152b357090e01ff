use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, join_all};
use uuid::Uuid;

use crate::engine::planner::Plan;
use crate::engine::queue::WorkQueue;
use crate::engine::runtime::TaskRuntime;
use crate::engine::types::TaskOutcome;

/// Executes a plan and joins the leaf outcomes.
///
/// Both implementations must yield identical observable outcomes: the same
/// terminal status on every affected record, the same results, the same
/// captured error metadata. Only the execution venue differs.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn execute(&self, plan: &Plan) -> Result<Vec<TaskOutcome>>;
}

/// How one leaf gets executed; the single point where eager and queued
/// dispatch differ.
#[async_trait]
trait LeafRunner: Sync {
    async fn run_leaf(&self, id: Uuid, prev: Option<serde_json::Value>) -> Result<TaskOutcome>;
}

/// Result of executing one plan subtree.
struct Exec {
    outcomes: Vec<TaskOutcome>,
    /// Value handed to the next chain sibling.
    last: Option<serde_json::Value>,
    failed: bool,
}

impl Exec {
    fn empty() -> Self {
        Self {
            outcomes: Vec::new(),
            last: None,
            failed: false,
        }
    }
}

/// Walk a plan. Chains run in order, thread the previous result into the
/// next leaf and halt on the first failure. Groups run all children
/// concurrently and never cancel siblings; the group's failure surfaces
/// only once every child has terminated.
fn walk<'a>(
    plan: &'a Plan,
    prev: Option<serde_json::Value>,
    runner: &'a dyn LeafRunner,
) -> BoxFuture<'a, Result<Exec>> {
    Box::pin(async move {
        match plan {
            Plan::Leaf(id) => {
                let outcome = runner.run_leaf(*id, prev).await?;
                Ok(Exec {
                    failed: outcome.is_failure(),
                    last: outcome.result.clone(),
                    outcomes: vec![outcome],
                })
            }

            Plan::Chain(children) => {
                let mut exec = Exec::empty();
                let mut prev = prev;
                for child in children {
                    let child_exec = walk(child, prev, runner).await?;
                    prev = child_exec.last.clone();
                    exec.last = child_exec.last;
                    exec.failed = child_exec.failed;
                    exec.outcomes.extend(child_exec.outcomes);
                    if exec.failed {
                        break;
                    }
                }
                Ok(exec)
            }

            Plan::Group(children) => {
                let runs = children
                    .iter()
                    .map(|child| walk(child, prev.clone(), runner));
                let results = join_all(runs).await;

                let mut exec = Exec::empty();
                let mut lasts = Vec::new();
                for child_exec in results {
                    let child_exec = child_exec?;
                    exec.failed |= child_exec.failed;
                    lasts.push(child_exec.last.unwrap_or(serde_json::Value::Null));
                    exec.outcomes.extend(child_exec.outcomes);
                }
                exec.last = Some(serde_json::Value::Array(lasts));
                Ok(exec)
            }
        }
    })
}

/// Runs every leaf inline in the calling context. Used by tests and by
/// nested sub-plans spawned from inside a worker.
pub struct EagerDispatcher {
    runtime: TaskRuntime,
}

impl EagerDispatcher {
    pub fn new(runtime: TaskRuntime) -> Self {
        Self { runtime }
    }

    /// Execute with an initial chained result, used when resuming a chain
    /// whose earlier leaves already completed.
    pub async fn execute_seeded(
        &self,
        plan: &Plan,
        seed: Option<serde_json::Value>,
    ) -> Result<Vec<TaskOutcome>> {
        let exec = walk(plan, seed, self).await?;
        Ok(exec.outcomes)
    }
}

#[async_trait]
impl LeafRunner for EagerDispatcher {
    async fn run_leaf(&self, id: Uuid, prev: Option<serde_json::Value>) -> Result<TaskOutcome> {
        self.runtime.execute(id, prev).await
    }
}

#[async_trait]
impl Dispatcher for EagerDispatcher {
    async fn execute(&self, plan: &Plan) -> Result<Vec<TaskOutcome>> {
        let exec = walk(plan, None, self).await?;
        Ok(exec.outcomes)
    }
}

/// Submits leaves to the work queue; the pool is chosen by the handler's
/// queue hint. Only the task id and the chained previous result cross the
/// queue — the implementation is re-resolved by name on the worker side.
pub struct QueuedDispatcher {
    queue: Arc<WorkQueue>,
    runtime: TaskRuntime,
}

impl QueuedDispatcher {
    pub fn new(queue: Arc<WorkQueue>, runtime: TaskRuntime) -> Self {
        Self { queue, runtime }
    }
}

#[async_trait]
impl LeafRunner for QueuedDispatcher {
    async fn run_leaf(&self, id: Uuid, prev: Option<serde_json::Value>) -> Result<TaskOutcome> {
        let record = self.runtime.store().get_task(id).await?;
        let pool = self
            .runtime
            .registry()
            .resolve(&record.name)
            .map(|h| h.queue().to_string())
            .unwrap_or_else(|_| "default".to_string());
        self.queue.submit(&pool, id, prev).await
    }
}

#[async_trait]
impl Dispatcher for QueuedDispatcher {
    async fn execute(&self, plan: &Plan) -> Result<Vec<TaskOutcome>> {
        let exec = walk(plan, None, self).await?;
        Ok(exec.outcomes)
    }
}
