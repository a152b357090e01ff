use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution state of a task record.
///
/// `Prepared` marks undo/retry records that exist but have not been
/// dispatched yet. `Retry` is reserved for workers re-announcing a record
/// after a crash; the engine itself never sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Prepared,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskStatus {
    /// Terminal states never change on the record itself; recovery happens
    /// through undo/retry records.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Prepared => write!(f, "PREPARED"),
            TaskStatus::Started => write!(f, "STARTED"),
            TaskStatus::Retry => write!(f, "RETRY"),
            TaskStatus::Success => write!(f, "SUCCESS"),
            TaskStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "PREPARED" => Ok(TaskStatus::Prepared),
            "STARTED" => Ok(TaskStatus::Started),
            "RETRY" => Ok(TaskStatus::Retry),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            other => Err(anyhow::anyhow!("unknown task status: {}", other)),
        }
    }
}

/// Lifecycle mode a plan is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMode {
    Run,
    Undo,
    Retry,
    Resume,
}

/// Captured failure details persisted on a task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error kind, e.g. "ParameterError", "TransportError", "LeafFailure".
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Outcome of one executed leaf, as reported by a plan join.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: Uuid,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        self.status == TaskStatus::Failure
    }
}

/// Engine-wide runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execute all plans inline, ignoring queue hints.
    pub eager_mode: bool,
    /// In eager mode, re-raise the first leaf failure to the caller.
    pub propagate_exceptions: bool,
    /// Chunk size for the file transport tasks.
    pub default_block_size: u64,
    /// Hash family for checksum leaves.
    pub default_checksum_algorithm: String,
    /// Worker pool name → worker count for deferred dispatch.
    pub worker_pools: HashMap<String, usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut worker_pools = HashMap::new();
        worker_pools.insert("default".to_string(), num_cpus::get());
        worker_pools.insert("file_operation".to_string(), 2);
        worker_pools.insert("validation".to_string(), 2);

        Self {
            eager_mode: false,
            propagate_exceptions: false,
            default_block_size: 65536,
            default_checksum_algorithm: "SHA-256".to_string(),
            worker_pools,
        }
    }
}

impl EngineConfig {
    /// Configuration for inline execution, the mode tests run in.
    pub fn eager() -> Self {
        Self {
            eager_mode: true,
            ..Self::default()
        }
    }

    /// Apply `ARKFLOW_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("ARKFLOW_EAGER_MODE")
            && let Ok(b) = v.parse()
        {
            self.eager_mode = b;
        }
        if let Ok(v) = std::env::var("ARKFLOW_PROPAGATE_EXCEPTIONS")
            && let Ok(b) = v.parse()
        {
            self.propagate_exceptions = b;
        }
        if let Ok(v) = std::env::var("ARKFLOW_DEFAULT_BLOCK_SIZE")
            && let Ok(n) = v.parse()
        {
            self.default_block_size = n;
        }
        if let Ok(v) = std::env::var("ARKFLOW_DEFAULT_CHECKSUM_ALGORITHM") {
            self.default_checksum_algorithm = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_display() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Prepared,
            TaskStatus::Started,
            TaskStatus::Retry,
            TaskStatus::Success,
            TaskStatus::Failure,
        ] {
            let parsed: TaskStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Prepared.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
    }
}
