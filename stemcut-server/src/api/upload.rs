//! Upload and enqueue endpoints

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stemcut_common::config::parse_flag;
use stemcut_common::events::ServiceEvent;
use stemcut_common::title::{base_track_name, detect_track_type, sanitize_upload_name};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::db::history;
use crate::error::{ApiError, ApiResult};
use crate::queue::{QueueJob, GLOBAL_SESSION};
use crate::tracking::PendingWarning;
use crate::AppState;

/// Largest accepted upload request
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub session_id: String,
    pub saved: Vec<String>,
    pub queued: Vec<String>,
    pub already_processed: Vec<String>,
    pub queue_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_warning: Option<PendingWarning>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub filename: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub force_reprocess: bool,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub filename: String,
    pub queued: bool,
    pub message: String,
    pub queue_size: usize,
}

/// What happened to one enqueue request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { queue_size: usize },
    AlreadyProcessed { track_name: String },
}

/// Reject new work while the pending count is critical
pub async fn ensure_capacity(state: &AppState) -> ApiResult<PendingWarning> {
    let warning = state.tracker.warning().await;
    if warning.is_critical() {
        warn!(count = warning.count, "Pending downloads critical, rejecting new work");
        return Err(ApiError::TooManyPending(warning));
    }
    if let (true, Some(message)) = (warning.warning, warning.message.clone()) {
        state.event_bus.emit(ServiceEvent::PendingWarning {
            level: "warning".to_string(),
            count: warning.count,
            message,
        });
    }
    Ok(warning)
}

/// Processed folder name an upload would produce, if that folder already exists
pub fn processed_track_for(processed_dir: &Path, filename: &str) -> Option<String> {
    let base = base_track_name(None, filename, detect_track_type(filename));
    processed_dir.join(&base).is_dir().then_some(base)
}

/// Queue an uploaded file unless its track was already processed
pub async fn enqueue_upload(
    state: &AppState,
    filename: &str,
    session_id: &str,
    force_reprocess: bool,
) -> ApiResult<EnqueueOutcome> {
    if !force_reprocess {
        if let Some(track_name) = processed_track_for(&state.settings.processed_dir(), filename) {
            state
                .sessions
                .log(session_id, format!("Skipped {}: already processed as '{}'", filename, track_name))
                .await;
            return Ok(EnqueueOutcome::AlreadyProcessed { track_name });
        }
    }

    let mut job = QueueJob::new(filename, session_id);
    job.force_reprocess = force_reprocess;
    let queue_size = state
        .queue
        .enqueue(job)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.sessions.with_status(session_id, |s| s.total_files += 1).await;
    if let Err(e) = history::update_status(&state.db, filename, "queued", None, None).await {
        warn!(file = %filename, "Failed to update history: {}", e);
    }
    Ok(EnqueueOutcome::Queued { queue_size })
}

/// Stream one multipart file part to `path`; returns the byte count
async fn save_field(field: &mut Field<'_>, path: &Path) -> ApiResult<usize> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut bytes = 0usize;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Upload interrupted: {}", e)))?
    {
        bytes += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(bytes)
}

/// POST /upload_chunk
///
/// Multipart form: one or more file parts plus optional `session_id`,
/// `auto_enqueue` (default true) and `force_reprocess` text fields.
pub async fn upload_chunk(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<UploadResponse>> {
    let warning = ensure_capacity(&state).await?;
    let _permit = state
        .upload_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let uploads_dir = state.settings.uploads_dir();
    tokio::fs::create_dir_all(&uploads_dir).await?;

    let mut session_id = GLOBAL_SESSION.to_string();
    let mut auto_enqueue = true;
    let mut force_reprocess = false;
    let mut saved = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        let Some(raw_filename) = field.file_name().map(str::to_string) else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("Invalid form field {}: {}", name, e)))?;
            match name.as_str() {
                "session_id" if !value.trim().is_empty() => session_id = value.trim().to_string(),
                "auto_enqueue" => auto_enqueue = parse_flag(&value).unwrap_or(true),
                "force_reprocess" => force_reprocess = parse_flag(&value).unwrap_or(false),
                _ => {}
            }
            continue;
        };

        let Some(filename) = sanitize_upload_name(&raw_filename) else {
            warn!(raw = %raw_filename, "Rejected upload with unusable filename");
            continue;
        };

        let path = uploads_dir.join(&filename);
        let bytes = match save_field(&mut field, &path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %filename, "Upload interrupted, removing partial file: {}", e);
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!(file = %filename, "Failed to remove partial upload: {}", rm);
                }
                return Err(e);
            }
        };

        info!(file = %filename, bytes, "Upload saved");
        saved.push(filename);
    }

    if saved.is_empty() {
        return Err(ApiError::BadRequest("No files in upload".to_string()));
    }

    let mut queued = Vec::new();
    let mut already_processed = Vec::new();
    for filename in &saved {
        if let Err(e) = history::insert(&state.db, filename, &session_id, "uploaded", "Unknown").await {
            warn!(file = %filename, "Failed to record upload: {}", e);
        }
        if !auto_enqueue {
            continue;
        }
        match enqueue_upload(&state, filename, &session_id, force_reprocess).await? {
            EnqueueOutcome::Queued { .. } => queued.push(filename.clone()),
            EnqueueOutcome::AlreadyProcessed { .. } => already_processed.push(filename.clone()),
        }
    }

    state
        .sessions
        .log(
            &session_id,
            format!("Received {} file(s), {} queued", saved.len(), queued.len()),
        )
        .await;

    Ok(Json(UploadResponse {
        success: true,
        session_id,
        saved,
        queued,
        already_processed,
        queue_size: state.queue.size(),
        pending_warning: warning.warning.then_some(warning),
    }))
}

/// POST /enqueue_file
pub async fn enqueue_file(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<Json<EnqueueResponse>> {
    let filename = sanitize_upload_name(&request.filename)
        .ok_or_else(|| ApiError::BadRequest("filename is required".to_string()))?;
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| GLOBAL_SESSION.to_string());

    ensure_capacity(&state).await?;

    let path = state.settings.uploads_dir().join(&filename);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::NotFound(format!("Upload not found: {}", filename)));
    }

    let response = match enqueue_upload(&state, &filename, &session_id, request.force_reprocess).await? {
        EnqueueOutcome::Queued { queue_size } => EnqueueResponse {
            success: true,
            message: format!("{} queued", filename),
            filename,
            queued: true,
            queue_size,
        },
        EnqueueOutcome::AlreadyProcessed { track_name } => EnqueueResponse {
            success: true,
            message: format!("Already processed as '{}', use force_reprocess to redo", track_name),
            filename,
            queued: false,
            queue_size: state.queue.size(),
        },
    };
    Ok(Json(response))
}

pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/upload_chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/enqueue_file", post(enqueue_file))
}
