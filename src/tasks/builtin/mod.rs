mod checksum;
mod fsops;
mod transport;
mod xml;

use std::sync::Arc;

use anyhow::Result;

use crate::engine::error::WorkflowError;
use crate::tasks::TaskRegistry;

/// Register all built-in tasks into the registry.
pub fn register_all(registry: &mut TaskRegistry) {
    registry.register(Arc::new(checksum::CalculateChecksum));
    registry.register(Arc::new(checksum::ValidateIntegrity));
    registry.register(Arc::new(xml::GenerateXml));
    registry.register(Arc::new(fsops::DeleteFiles));
    registry.register(Arc::new(fsops::DownloadFile));
    registry.register(Arc::new(transport::CopyChunk));
    registry.register(Arc::new(transport::CopyFile));
}

/// Extract a required string parameter.
pub(crate) fn str_param(params: &serde_json::Value, task: &str, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            WorkflowError::Parameter {
                task: task.to_string(),
                message: format!("missing required string parameter '{}'", key),
            }
            .into()
        })
}

/// Extract an optional u64 parameter, falling back to `default`.
pub(crate) fn u64_param_or(params: &serde_json::Value, key: &str, default: u64) -> u64 {
    params.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

/// Extract an optional string parameter.
pub(crate) fn opt_str_param(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
