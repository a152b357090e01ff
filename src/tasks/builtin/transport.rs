use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::engine::error::WorkflowError;
use crate::engine::runtime::TaskHandle;
use crate::engine::types::TaskStatus;
use crate::records::TaskRecord;
use crate::tasks::TaskHandler;
use crate::tasks::builtin::{opt_str_param, str_param, u64_param_or};

/// A destination is remote when it parses as an http(s) URL; anything else
/// is treated as a local path.
fn is_remote(dst: &str) -> bool {
    reqwest::Url::parse(dst)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Copies one block of a file, locally or to a remote upload endpoint.
///
/// The leaf at `offset >= file_size` is the completion marker: locally it
/// writes nothing, remotely it posts the finalization request. Each chunk
/// returns `{"upload_id": …}` so a chain threads the id assigned by the
/// server on the first chunk into every later one.
pub struct CopyChunk;

pub const COPY_CHUNK: &str = "arkflow.tasks.copy_chunk";

impl CopyChunk {
    async fn read_block(src: &str, offset: u64, block_size: u64) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("failed to open '{}'", src))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; block_size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn local(src: &str, dst: &str, offset: u64, block_size: u64) -> Result<()> {
        let block = Self::read_block(src, offset, block_size).await?;
        if block.is_empty() {
            return Ok(());
        }

        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(dst)
            .await
            .with_context(|| format!("failed to open '{}'", dst))?;
        out.seek(std::io::SeekFrom::Start(offset)).await?;
        out.write_all(&block).await?;
        out.flush().await?;
        Ok(())
    }

    async fn remote(
        src: &str,
        dst: &str,
        offset: u64,
        block_size: u64,
        file_size: u64,
        upload_id: Option<String>,
    ) -> Result<Option<String>> {
        let client = reqwest::Client::new();

        // Past the end of the file there is nothing left to send; tell the
        // server the upload is complete.
        if offset >= file_size {
            let upload_id = upload_id.ok_or_else(|| {
                WorkflowError::Transport("cannot finalize upload without an upload id".to_string())
            })?;
            let url = format!("{}_complete/", dst);
            let response = client
                .post(&url)
                .json(&serde_json::json!({ "upload_id": upload_id }))
                .send()
                .await
                .map_err(|e| WorkflowError::Transport(format!("POST {} failed: {}", url, e)))?;
            if !response.status().is_success() {
                return Err(WorkflowError::Transport(format!(
                    "POST {} returned {}",
                    url,
                    response.status()
                ))
                .into());
            }
            debug!(dst = %dst, "upload finalized");
            return Ok(Some(upload_id));
        }

        let block = Self::read_block(src, offset, block_size).await?;
        let filename = basename(src);

        let content_range = format!(
            "bytes {}-{}/{}",
            offset,
            offset + block_size - 1,
            file_size
        );

        let mut form = reqwest::multipart::Form::new()
            .part(
                "chunk",
                reqwest::multipart::Part::bytes(block).file_name(filename.clone()),
            )
            .text("filename", filename);
        if let Some(ref id) = upload_id {
            form = form.text("upload_id", id.clone());
        }

        let response = client
            .post(dst)
            .header("Content-Range", content_range)
            .multipart(form)
            .send()
            .await
            .map_err(|e| WorkflowError::Transport(format!("POST {} failed: {}", dst, e)))?;

        if !response.status().is_success() {
            return Err(WorkflowError::Transport(format!(
                "POST {} returned {}",
                dst,
                response.status()
            ))
            .into());
        }

        // The server assigns the upload id on the first chunk.
        let assigned = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| {
                v.get("upload_id")
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            });

        Ok(assigned.or(upload_id))
    }
}

#[async_trait]
impl TaskHandler for CopyChunk {
    fn name(&self) -> &str {
        COPY_CHUNK
    }

    fn queue(&self) -> &str {
        "file_operation"
    }

    fn hidden(&self) -> bool {
        true
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["src", "dst", "offset"],
            "properties": {
                "src": { "type": "string" },
                "dst": { "type": "string" },
                "offset": { "type": "integer", "minimum": 0 },
                "block_size": { "type": "integer", "minimum": 1 },
                "file_size": { "type": "integer", "minimum": 0 },
                "upload_id": { "type": "string" }
            }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let params = handle.params();
        let src = str_param(params, self.name(), "src")?;
        let dst = str_param(params, self.name(), "dst")?;
        let offset = u64_param_or(params, "offset", 0);
        let block_size = u64_param_or(params, "block_size", handle.config().default_block_size);
        let file_size = u64_param_or(params, "file_size", 0);

        // Explicit param wins; otherwise pick up the id threaded through
        // the chain from the previous chunk's result.
        let upload_id = opt_str_param(params, "upload_id").or_else(|| {
            handle
                .prev_result()
                .and_then(|v| v.get("upload_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

        if is_remote(&dst) {
            let id = Self::remote(&src, &dst, offset, block_size, file_size, upload_id).await?;
            Ok(match id {
                Some(id) => serde_json::json!({ "upload_id": id }),
                None => serde_json::json!({}),
            })
        } else {
            Self::local(&src, &dst, offset, block_size).await?;
            Ok(serde_json::Value::Null)
        }
    }

    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        let src = params.get("src")?.as_str()?;
        let dst = params.get("dst")?.as_str()?;
        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0);
        Some(format!("Copied chunk at offset {} from {} to {}", offset, src, dst))
    }
}

/// Copies a file by planning one `copy_chunk` child per block and running
/// the children as an inline chain.
///
/// The chunks are real task records under this task, so each block's
/// outcome survives restarts. When this task is re-run through a retry
/// record it inherits the previously planned chunks and replans only those
/// not yet in `SUCCESS`, seeding the chain with the last completed chunk's
/// result so the upload id carries over.
pub struct CopyFile;

pub const COPY_FILE: &str = "arkflow.tasks.copy_file";

#[async_trait]
impl TaskHandler for CopyFile {
    fn name(&self) -> &str {
        COPY_FILE
    }

    fn queue(&self) -> &str {
        "file_operation"
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["src", "dst"],
            "properties": {
                "src": { "type": "string" },
                "dst": { "type": "string" },
                "block_size": { "type": "integer", "minimum": 1 }
            }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let params = handle.params();
        let src = str_param(params, self.name(), "src")?;
        let dst = str_param(params, self.name(), "dst")?;
        let block_size = u64_param_or(params, "block_size", handle.config().default_block_size);
        if block_size == 0 {
            return Err(WorkflowError::Parameter {
                task: self.name().to_string(),
                message: "block_size must be at least 1".to_string(),
            }
            .into());
        }

        let record = handle.record();
        let store = handle.store();

        let existing = store.live_child_tasks(record.id).await?;
        let (chain, seed) = if existing.is_empty() {
            let file_size = tokio::fs::metadata(&src)
                .await
                .with_context(|| format!("failed to stat '{}'", src))?
                .len();

            // A local destination is truncated once before the chain starts.
            if !is_remote(&dst) {
                tokio::fs::File::create(&dst)
                    .await
                    .with_context(|| format!("failed to create '{}'", dst))?;
            }

            // One data chunk per block, plus (for remote destinations) a
            // final leaf past the end of the file that posts the
            // completion request.
            let data_chunks = file_size.div_ceil(block_size);
            let total_chunks = if is_remote(&dst) {
                data_chunks + 1
            } else {
                data_chunks
            };

            let mut chunk_ids = Vec::new();
            for idx in 0..total_chunks {
                let chunk = TaskRecord::new(
                    COPY_CHUNK,
                    serde_json::json!({
                        "src": src,
                        "dst": dst,
                        "offset": idx * block_size,
                        "block_size": block_size,
                        "file_size": file_size,
                    }),
                )
                .child_of(record.id, idx as i32);

                handle.registry().validate(&chunk)?;
                store.create_task(&chunk).await?;
                chunk_ids.push(chunk.id);
            }
            (chunk_ids, None)
        } else {
            // Inherited sub-plan: replan only the unfinished chunks and
            // seed the chain with the last completed chunk's result.
            let attempt = Uuid::new_v4();
            let mut chunk_ids = Vec::new();
            let mut seed = None;
            for child in existing {
                match child.status {
                    TaskStatus::Success => seed = child.result.clone(),
                    TaskStatus::Failure => {
                        let replacement = store.create_retry_task(child.id, attempt).await?;
                        chunk_ids.push(replacement.id);
                    }
                    _ => chunk_ids.push(child.id),
                }
            }
            (chunk_ids, seed)
        };

        let total = chain.len() as u64;
        let outcomes = handle.run_chain_eagerly(&chain, seed).await?;

        if let Some(failed) = outcomes.iter().find(|o| o.is_failure()) {
            let message = failed
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "chunk failed".to_string());
            return Err(WorkflowError::Transport(message).into());
        }
        handle.set_progress(total, total.max(1)).await?;

        Ok(serde_json::json!({ "chunks": total }))
    }

    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        let src = params.get("src")?.as_str()?;
        let dst = params.get("dst")?.as_str()?;
        Some(format!("Copied {} to {}", src, dst))
    }
}
