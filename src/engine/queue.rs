use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use crate::engine::runtime::TaskRuntime;

/// A unit of deferred work: the task record id plus the chained previous
/// result. Everything else is re-resolved from the store and the registry
/// on the worker side.
struct WorkItem {
    task: Uuid,
    prev: Option<serde_json::Value>,
    done: oneshot::Sender<Result<crate::engine::types::TaskOutcome>>,
}

/// Named worker pools backed by tokio tasks.
///
/// Each pool shares one channel; workers compete for items. A submission
/// with an unknown pool name falls back to the `default` pool, which always
/// exists.
pub struct WorkQueue {
    pools: HashMap<String, mpsc::Sender<WorkItem>>,
}

impl WorkQueue {
    /// Spawn the configured pools. `pools` maps pool name to worker count;
    /// a `default` pool is added when the configuration lacks one.
    pub fn start(runtime: TaskRuntime, pools: &HashMap<String, usize>) -> Arc<Self> {
        let mut senders = HashMap::new();

        let mut pools = pools.clone();
        pools.entry("default".to_string()).or_insert_with(num_cpus::get);

        for (name, workers) in pools {
            let (tx, rx) = mpsc::channel::<WorkItem>(1024);
            let rx = Arc::new(Mutex::new(rx));

            for n in 0..workers.max(1) {
                let rx = rx.clone();
                let runtime = runtime.clone();
                let pool = name.clone();
                tokio::spawn(async move {
                    debug!(pool = %pool, worker = n, "worker started");
                    loop {
                        let item = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(item) = item else { break };

                        let outcome = runtime.execute(item.task, item.prev).await;
                        if item.done.send(outcome).is_err() {
                            error!(pool = %pool, task = %item.task, "submitter went away");
                        }
                    }
                    debug!(pool = %pool, worker = n, "worker stopped");
                });
            }

            senders.insert(name, tx);
        }

        Arc::new(Self { pools: senders })
    }

    /// Submit one task to a pool and await its outcome.
    pub async fn submit(
        &self,
        pool: &str,
        task: Uuid,
        prev: Option<serde_json::Value>,
    ) -> Result<crate::engine::types::TaskOutcome> {
        let sender = self
            .pools
            .get(pool)
            .or_else(|| self.pools.get("default"))
            .ok_or_else(|| anyhow::anyhow!("no worker pool available for '{}'", pool))?;

        let (done, joined) = oneshot::channel();
        sender
            .send(WorkItem { task, prev, done })
            .await
            .map_err(|_| anyhow::anyhow!("worker pool '{}' is shut down", pool))?;

        joined
            .await
            .map_err(|_| anyhow::anyhow!("worker dropped task {} without reporting", task))?
    }
}
