pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::error::WorkflowError;
use crate::engine::runtime::TaskHandle;
use crate::records::TaskRecord;

/// Trait all task implementations must implement.
///
/// Implementations are stateless; every invocation receives a fresh handle
/// carrying the task record, progress reporting and engine access. Bound
/// parameters are read from `handle.params()` with explicit validation —
/// declaring a `params_schema` gets them checked before `run` is invoked.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Fully-qualified dotted task name (e.g. "arkflow.tasks.calculate_checksum").
    fn name(&self) -> &str;

    /// Worker pool hint for deferred dispatch.
    fn queue(&self) -> &str {
        "default"
    }

    /// Hidden tasks are bookkeeping detail, filtered from user-facing listings.
    fn hidden(&self) -> bool {
        false
    }

    /// Optional JSON schema the bound params must satisfy.
    fn params_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Forward entry point.
    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value>;

    /// Reverse entry point, invoked for `undo_type = true` records. The
    /// default is a no-op so the undo record still exists for chain
    /// accounting even when a task has no meaningful reverse.
    async fn undo(&self, handle: &TaskHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }

    /// Human-readable message persisted on the record after a successful run.
    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        let _ = params;
        None
    }
}

/// Registry of available task implementations.
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A registry with all built-in tasks registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Look up a handler by its registered name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownTask(name.to_string()).into())
    }

    /// Validate a record before it is persisted: a non-composite task must
    /// reference a registered name.
    pub fn validate(&self, record: &TaskRecord) -> Result<()> {
        if !record.composite && !self.handlers.contains_key(&record.name) {
            return Err(WorkflowError::UnknownTask(record.name.clone()).into());
        }
        Ok(())
    }

    /// Registered names with their queue hints, visible tasks only,
    /// sorted by name.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .handlers
            .values()
            .filter(|h| !h.hidden())
            .map(|h| (h.name(), h.queue()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
