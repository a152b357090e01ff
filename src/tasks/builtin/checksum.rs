use anyhow::{Context as _, Result};
use async_trait::async_trait;
use md5::Md5;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::io::AsyncReadExt;

use crate::engine::error::WorkflowError;
use crate::engine::runtime::TaskHandle;
use crate::records::{Node, TaskRecord};
use crate::tasks::TaskHandler;
use crate::tasks::builtin::{str_param, u64_param_or};

/// Incremental digest over the supported hash families.
enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    Md5(Md5),
}

impl Hasher {
    fn from_name(task: &str, algorithm: &str) -> Result<Self> {
        match algorithm.to_uppercase().as_str() {
            "SHA-256" | "SHA256" => Ok(Hasher::Sha256(Sha256::new())),
            "SHA-384" | "SHA384" => Ok(Hasher::Sha384(Sha384::new())),
            "SHA-512" | "SHA512" => Ok(Hasher::Sha512(Sha512::new())),
            "MD5" => Ok(Hasher::Md5(Md5::new())),
            other => Err(WorkflowError::Parameter {
                task: task.to_string(),
                message: format!(
                    "unsupported algorithm '{}', use SHA-256, SHA-384, SHA-512 or MD5",
                    other
                ),
            }
            .into()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
            Hasher::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Computes the checksum of a file, one block at a time, reporting
/// progress as it goes. Returns the hexadecimal digest.
pub struct CalculateChecksum;

pub const CALCULATE_CHECKSUM: &str = "arkflow.tasks.calculate_checksum";

#[async_trait]
impl TaskHandler for CalculateChecksum {
    fn name(&self) -> &str {
        CALCULATE_CHECKSUM
    }

    fn queue(&self) -> &str {
        "file_operation"
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["filename"],
            "properties": {
                "filename": { "type": "string" },
                "algorithm": { "type": "string" },
                "block_size": { "type": "integer", "minimum": 1 }
            }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let params = handle.params();
        let filename = str_param(params, self.name(), "filename")?;
        let block_size = u64_param_or(params, "block_size", handle.config().default_block_size);
        let algorithm = params
            .get("algorithm")
            .and_then(|v| v.as_str())
            .unwrap_or(&handle.config().default_checksum_algorithm)
            .to_string();

        let mut hasher = Hasher::from_name(self.name(), &algorithm)?;

        let mut file = tokio::fs::File::open(&filename)
            .await
            .with_context(|| format!("failed to open '{}'", filename))?;
        let total = file.metadata().await?.len();

        let mut buf = vec![0u8; block_size.max(1) as usize];
        let mut read_so_far = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            read_so_far += n as u64;
            handle.set_progress(read_so_far, total.max(1)).await?;
        }

        Ok(serde_json::Value::String(hasher.finalize_hex()))
    }

    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        let filename = params.get("filename")?.as_str()?;
        let algorithm = params
            .get("algorithm")
            .and_then(|v| v.as_str())
            .unwrap_or("SHA-256");
        Some(format!("Created checksum for {} with {}", filename, algorithm))
    }
}

/// Validates a file against an expected checksum by spawning a nested
/// checksum task as a child record and comparing digests.
pub struct ValidateIntegrity;

pub const VALIDATE_INTEGRITY: &str = "arkflow.tasks.validate_integrity";

#[async_trait]
impl TaskHandler for ValidateIntegrity {
    fn name(&self) -> &str {
        VALIDATE_INTEGRITY
    }

    fn queue(&self) -> &str {
        "validation"
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["filename", "checksum"],
            "properties": {
                "filename": { "type": "string" },
                "checksum": { "type": "string" },
                "algorithm": { "type": "string" },
                "block_size": { "type": "integer", "minimum": 1 }
            }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let params = handle.params();
        let filename = str_param(params, self.name(), "filename")?;
        let expected = str_param(params, self.name(), "checksum")?;

        let mut child_params = serde_json::Map::new();
        child_params.insert("filename".into(), serde_json::Value::String(filename.clone()));
        if let Some(algorithm) = params.get("algorithm") {
            child_params.insert("algorithm".into(), algorithm.clone());
        }
        if let Some(block_size) = params.get("block_size") {
            child_params.insert("block_size".into(), block_size.clone());
        }

        let pos = handle.store().child_tasks(handle.record().id).await?.len() as i32;
        let child = TaskRecord::new(
            CALCULATE_CHECKSUM,
            serde_json::Value::Object(child_params),
        )
        .child_of(handle.record().id, pos);

        handle.registry().validate(&child)?;
        handle.store().create_task(&child).await?;

        let outcomes = handle.run_eagerly(&Node::Task(child.clone())).await?;
        let digest = outcomes
            .iter()
            .find(|o| o.task == child.id)
            .and_then(|o| o.result.as_ref())
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("checksum sub-task produced no digest"))?;

        if digest != expected {
            return Err(WorkflowError::Integrity(format!(
                "checksum for {} is not valid ({} != {})",
                filename, digest, expected
            ))
            .into());
        }

        Ok(serde_json::Value::String("Success".to_string()))
    }

    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        let filename = params.get("filename")?.as_str()?;
        let checksum = params.get("checksum")?.as_str()?;
        Some(format!("Validated integrity of {} against {}", filename, checksum))
    }
}
