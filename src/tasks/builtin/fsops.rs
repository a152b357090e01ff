use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::engine::error::WorkflowError;
use crate::engine::runtime::TaskHandle;
use crate::tasks::TaskHandler;
use crate::tasks::builtin::str_param;

/// Removes a directory tree or a single file.
pub struct DeleteFiles;

pub const DELETE_FILES: &str = "arkflow.tasks.delete_files";

#[async_trait]
impl TaskHandler for DeleteFiles {
    fn name(&self) -> &str {
        DELETE_FILES
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": { "path": { "type": "string" } }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let path = str_param(handle.params(), self.name(), "path")?;

        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat '{}'", path))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }

        Ok(serde_json::Value::Null)
    }

    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        Some(format!("Deleted {}", params.get("path")?.as_str()?))
    }
}

/// Streams a remote file to a local destination.
pub struct DownloadFile;

pub const DOWNLOAD_FILE: &str = "arkflow.tasks.download_file";

#[async_trait]
impl TaskHandler for DownloadFile {
    fn name(&self) -> &str {
        DOWNLOAD_FILE
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["src", "dst"],
            "properties": {
                "src": { "type": "string" },
                "dst": { "type": "string" }
            }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let params = handle.params();
        let src = str_param(params, self.name(), "src")?;
        let dst = str_param(params, self.name(), "dst")?;

        let response = reqwest::get(&src)
            .await
            .map_err(|e| WorkflowError::Transport(format!("GET {} failed: {}", src, e)))?;
        if !response.status().is_success() {
            return Err(WorkflowError::Transport(format!(
                "GET {} returned {}",
                src,
                response.status()
            ))
            .into());
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(&dst)
            .await
            .with_context(|| format!("failed to create '{}'", dst))?;

        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| WorkflowError::Transport(format!("read from {}: {}", src, e)))?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if total > 0 {
                handle.set_progress(received, total).await?;
            }
        }
        file.flush().await?;

        Ok(serde_json::json!({ "bytes": received }))
    }
}
