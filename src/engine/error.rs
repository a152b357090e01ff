use thiserror::Error;

/// Typed failure kinds surfaced by the engine.
///
/// Leaf implementations return plain `anyhow::Error`s; the runtime downcasts
/// to this type when classifying a failure into the persisted `einfo.kind`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Registry miss when validating or resolving a task record.
    #[error("task '{0}' is not registered")]
    UnknownTask(String),

    /// Missing or wrongly typed bound parameter.
    #[error("invalid parameters for '{task}': {message}")]
    Parameter { task: String, message: String },

    /// Remote HTTP non-2xx or local I/O failure in the chunked transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// An aggregate or store operation observed an invariant break.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl WorkflowError {
    /// The kind label persisted into `ErrorInfo.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::UnknownTask(_) => "UnknownTask",
            WorkflowError::Parameter { .. } => "ParameterError",
            WorkflowError::Transport(_) => "TransportError",
            WorkflowError::Integrity(_) => "IntegrityViolation",
        }
    }
}
