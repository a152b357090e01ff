use anyhow::Result;
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::engine::types::{LifecycleMode, TaskStatus};
use crate::records::{Node, RecordStore, StepRecord, TaskRecord};

/// Execution plan produced by walking a step/task tree.
///
/// `Chain` runs children in order, passing each leaf's result to the next
/// and halting on the first failure. `Group` runs children concurrently and
/// reports the first failure only after all of them terminate.
#[derive(Debug, Clone)]
pub enum Plan {
    Chain(Vec<Plan>),
    Group(Vec<Plan>),
    Leaf(Uuid),
}

impl Plan {
    pub fn empty() -> Self {
        Plan::Chain(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Plan::Leaf(_) => false,
            Plan::Chain(children) | Plan::Group(children) => children.is_empty(),
        }
    }

    /// All leaf task ids, in declared order.
    pub fn leaves(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<Uuid>) {
        match self {
            Plan::Leaf(id) => out.push(*id),
            Plan::Chain(children) | Plan::Group(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

/// Combine sibling plans under the step's composition operator.
/// Empty input elides the node, a single child collapses into itself.
fn operator(parallel: bool, plans: Vec<Plan>) -> Option<Plan> {
    let mut plans: Vec<Plan> = plans.into_iter().filter(|p| !p.is_empty()).collect();
    match plans.len() {
        0 => None,
        1 => plans.pop(),
        _ => Some(if parallel {
            Plan::Group(plans)
        } else {
            Plan::Chain(plans)
        }),
    }
}

fn chain_pair(first: Option<Plan>, second: Option<Plan>) -> Option<Plan> {
    match (first, second) {
        (None, other) | (other, None) => other,
        (Some(a), Some(b)) => Some(Plan::Chain(vec![a, b])),
    }
}

/// Build the execution plan for a node in the given lifecycle mode.
///
/// UNDO and RETRY allocate one attempt id for the whole invocation and
/// create their undo/retry records while planning, so a returned plan's
/// leaves are always the records that should actually execute.
pub async fn plan(
    store: &dyn RecordStore,
    node: &Node,
    mode: LifecycleMode,
    only_failed: bool,
) -> Result<Plan> {
    let attempt = Uuid::new_v4();
    let built = match node {
        Node::Step(step) => plan_step(store, step.clone(), mode, only_failed, attempt).await?,
        Node::Task(task) => plan_task(store, task.clone(), mode, only_failed, attempt).await?,
    };
    Ok(built.unwrap_or_else(Plan::empty))
}

fn plan_step(
    store: &dyn RecordStore,
    step: StepRecord,
    mode: LifecycleMode,
    only_failed: bool,
    attempt: Uuid,
) -> BoxFuture<'_, Result<Option<Plan>>> {
    Box::pin(async move {
        match mode {
            LifecycleMode::Run => {
                let mut children = Vec::new();
                for child in store.child_steps(step.id).await? {
                    if let Some(p) =
                        plan_step(store, child, LifecycleMode::Run, false, attempt).await?
                    {
                        children.push(p);
                    }
                }

                let tasks: Vec<Plan> = store
                    .live_tasks(step.id)
                    .await?
                    .into_iter()
                    .map(|t| Plan::Leaf(t.id))
                    .collect();

                // Child steps always finish before this step's own tasks.
                Ok(chain_pair(
                    operator(step.parallel, children),
                    operator(step.parallel, tasks),
                ))
            }

            LifecycleMode::Undo => {
                let mut tasks = Vec::new();
                let mut selected: Vec<TaskRecord> = store
                    .tasks_of_step(step.id)
                    .await?
                    .into_iter()
                    .filter(|t| !t.undo_type && t.undone.is_none() && t.retried.is_none())
                    .filter(|t| !only_failed || t.status == TaskStatus::Failure)
                    .collect();
                selected.reverse();
                for task in selected {
                    let undo = store.create_undo_task(task.id, attempt).await?;
                    tasks.push(Plan::Leaf(undo.id));
                }

                let mut children = Vec::new();
                let mut child_steps = store.child_steps(step.id).await?;
                child_steps.reverse();
                for child in child_steps {
                    if let Some(p) =
                        plan_step(store, child, LifecycleMode::Undo, only_failed, attempt).await?
                    {
                        children.push(p);
                    }
                }

                // Reverse of run: tasks unwind before child steps.
                Ok(chain_pair(
                    operator(step.parallel, tasks),
                    operator(step.parallel, children),
                ))
            }

            LifecycleMode::Retry => {
                let mut children = Vec::new();
                for child in store.child_steps(step.id).await? {
                    if let Some(p) =
                        plan_step(store, child, LifecycleMode::Retry, false, attempt).await?
                    {
                        children.push(p);
                    }
                }

                let mut tasks = Vec::new();
                for task in store.live_tasks(step.id).await? {
                    if let Some(leaf) = retry_leaf(store, &task, attempt).await? {
                        tasks.push(leaf);
                    }
                }

                Ok(chain_pair(
                    operator(step.parallel, children),
                    operator(step.parallel, tasks),
                ))
            }

            LifecycleMode::Resume => {
                let mut children = Vec::new();
                for child in store.child_steps(step.id).await? {
                    if step_has_pending(store, child.id).await? {
                        if let Some(p) =
                            plan_step(store, child, LifecycleMode::Resume, false, attempt).await?
                        {
                            children.push(p);
                        }
                    }
                }

                let tasks: Vec<Plan> = store
                    .pending_tasks(step.id)
                    .await?
                    .into_iter()
                    .map(|t| Plan::Leaf(t.id))
                    .collect();

                Ok(chain_pair(
                    operator(step.parallel, children),
                    operator(step.parallel, tasks),
                ))
            }
        }
    })
}

/// Retry-mode handling of one task under a step: failed or undone tasks get
/// a replacement record, still-pending tasks ride along as plain leaves so
/// an interrupted chain completes. Finished or in-flight tasks are skipped.
async fn retry_leaf(
    store: &dyn RecordStore,
    task: &TaskRecord,
    attempt: Uuid,
) -> Result<Option<Plan>> {
    debug_assert!(task.retried.is_none());
    if task.undone.is_some() || task.status == TaskStatus::Failure {
        let replacement = store.create_retry_task(task.id, attempt).await?;
        return Ok(Some(Plan::Leaf(replacement.id)));
    }
    if task.status == TaskStatus::Pending {
        return Ok(Some(Plan::Leaf(task.id)));
    }
    Ok(None)
}

fn step_has_pending(store: &dyn RecordStore, step: Uuid) -> BoxFuture<'_, Result<bool>> {
    Box::pin(async move {
        if !store.pending_tasks(step).await?.is_empty() {
            return Ok(true);
        }
        for child in store.child_steps(step).await? {
            if step_has_pending(store, child.id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    })
}

fn plan_task(
    store: &dyn RecordStore,
    task: TaskRecord,
    mode: LifecycleMode,
    only_failed: bool,
    attempt: Uuid,
) -> BoxFuture<'_, Result<Option<Plan>>> {
    Box::pin(async move {
        match mode {
            LifecycleMode::Run => {
                let own = (!task.composite).then_some(Plan::Leaf(task.id));
                let mut children = Vec::new();
                for child in store.live_child_tasks(task.id).await? {
                    if let Some(p) =
                        plan_task(store, child, LifecycleMode::Run, false, attempt).await?
                    {
                        children.push(p);
                    }
                }
                Ok(chain_pair(own, operator(task.parallel, children)))
            }

            LifecycleMode::Undo => {
                let mut children = Vec::new();
                let mut selected: Vec<TaskRecord> = store
                    .live_child_tasks(task.id)
                    .await?
                    .into_iter()
                    .filter(|t| !only_failed || t.status == TaskStatus::Failure)
                    .collect();
                selected.reverse();
                for child in selected {
                    if let Some(p) =
                        plan_task(store, child, LifecycleMode::Undo, only_failed, attempt).await?
                    {
                        children.push(p);
                    }
                }

                let own = if !task.composite
                    && !task.undo_type
                    && task.undone.is_none()
                    && task.retried.is_none()
                {
                    let undo = store.create_undo_task(task.id, attempt).await?;
                    Some(Plan::Leaf(undo.id))
                } else {
                    None
                };

                Ok(chain_pair(operator(task.parallel, children), own))
            }

            LifecycleMode::Retry => {
                if task.retried.is_none()
                    && !task.composite
                    && (task.undone.is_some() || task.status == TaskStatus::Failure)
                {
                    // The replacement adopts this task's children and its
                    // handler decides how to resume them, so there is
                    // nothing further to plan here.
                    let replacement = store.create_retry_task(task.id, attempt).await?;
                    return Ok(Some(Plan::Leaf(replacement.id)));
                }

                let mut children = Vec::new();
                for child in store.live_child_tasks(task.id).await? {
                    if let Some(leaf) = retry_leaf(store, &child, attempt).await? {
                        children.push(leaf);
                    }
                }
                Ok(operator(task.parallel, children))
            }

            LifecycleMode::Resume => {
                let own = (!task.composite
                    && !task.undo_type
                    && task.undone.is_none()
                    && task.status == TaskStatus::Pending)
                    .then_some(Plan::Leaf(task.id));

                let mut children = Vec::new();
                for child in store.live_child_tasks(task.id).await? {
                    if let Some(p) =
                        plan_task(store, child, LifecycleMode::Resume, false, attempt).await?
                    {
                        children.push(p);
                    }
                }
                Ok(chain_pair(own, operator(task.parallel, children)))
            }
        }
    })
}
