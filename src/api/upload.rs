use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::AppState;

/// Failure modes of the upload endpoints, mapped onto the wire protocol:
/// a chunk without its framing is a bad request, an unparsable
/// `Content-Range` is unsatisfiable, finalizing an upload the server never
/// saw is not-found, and anything touching the part file is a server error.
pub enum UploadError {
    BadRequest(String),
    RangeNotSatisfiable(String),
    UnknownUpload(String),
    Io(std::io::Error),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            UploadError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            UploadError::RangeNotSatisfiable(msg) => (StatusCode::RANGE_NOT_SATISFIABLE, msg),
            UploadError::UnknownUpload(id) => {
                (StatusCode::NOT_FOUND, format!("unknown upload: {}", id))
            }
            UploadError::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upload storage failed: {}", err),
            ),
        };

        (status, Json(serde_json::json!({ "error": error }))).into_response()
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err)
    }
}

/// Parse a `Content-Range: bytes <start>-<end>/<total>` header (inclusive end).
fn parse_content_range(headers: &HeaderMap) -> Result<(u64, u64, u64), UploadError> {
    let raw = headers
        .get("Content-Range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| UploadError::BadRequest("missing Content-Range header".to_string()))?;

    let malformed = || UploadError::RangeNotSatisfiable(format!("malformed Content-Range: {}", raw));

    let (range, total) = raw
        .strip_prefix("bytes ")
        .and_then(|rest| rest.split_once('/'))
        .ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;

    let parse = |v: &str| v.parse::<u64>().map_err(|_| malformed());
    Ok((parse(start)?, parse(end)?, parse(total)?))
}

/// Receive one chunk of an upload and write it at its offset into the
/// upload's part file. The first chunk of an upload allocates the
/// `upload_id` echoed back to the client.
pub async fn receive_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, UploadError> {
    let (offset, _end, _total) = parse_content_range(&headers)?;

    let mut chunk: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut upload_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("chunk") => {
                chunk = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| UploadError::BadRequest(format!("unreadable chunk: {}", e)))?
                        .to_vec(),
                );
            }
            Some("filename") => {
                filename = Some(field.text().await.map_err(|e| {
                    UploadError::BadRequest(format!("unreadable filename: {}", e))
                })?);
            }
            Some("upload_id") => {
                upload_id = Some(field.text().await.map_err(|e| {
                    UploadError::BadRequest(format!("unreadable upload_id: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let chunk = chunk.ok_or_else(|| UploadError::BadRequest("missing 'chunk' part".to_string()))?;
    let filename =
        filename.ok_or_else(|| UploadError::BadRequest("missing 'filename' part".to_string()))?;
    let upload_id = upload_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    tokio::fs::create_dir_all(&state.dir).await?;

    let part_path = state.dir.join(format!("{}.part", upload_id));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&part_path)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(&chunk).await?;
    file.flush().await?;

    state
        .uploads
        .lock()
        .unwrap()
        .insert(upload_id.clone(), filename);

    debug!(upload = %upload_id, offset, bytes = chunk.len(), "chunk received");

    Ok(Json(serde_json::json!({ "upload_id": upload_id })))
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub upload_id: String,
}

/// Finalize an upload: move the part file to its uploaded filename.
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>, UploadError> {
    let filename = state
        .uploads
        .lock()
        .unwrap()
        .remove(&request.upload_id)
        .ok_or_else(|| UploadError::UnknownUpload(request.upload_id.clone()))?;

    let part_path = state.dir.join(format!("{}.part", request.upload_id));
    let final_path = state.dir.join(&filename);
    tokio::fs::rename(&part_path, &final_path).await?;

    info!(upload = %request.upload_id, file = %final_path.display(), "upload complete");

    Ok(Json(serde_json::json!({
        "upload_id": request.upload_id,
        "filename": filename,
    })))
}
