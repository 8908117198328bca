//! Job status, logs, failed-file management and diagnostics

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cleanup::{disk_space, disk_usage_percent, fail_stuck_items};
use crate::db::catalog::redact;
use crate::db::SchemaInfo;
use crate::queue::{FailedFile, JobStatus, QueueItemView, QueueJob, GLOBAL_SESSION};
use crate::tracking::PendingWarning;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

impl SessionQuery {
    fn session(&self) -> &str {
        self.session_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(GLOBAL_SESSION)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionBody {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: JobStatus,
    pub queue_size: usize,
    pub num_workers: usize,
    pub active_workers: usize,
    pub queue_items: Vec<QueueItemView>,
    pub pending_downloads: usize,
    pub pending_warning: PendingWarning,
}

/// GET /status?session_id=
pub async fn get_status(State(state): State<AppState>, Query(query): Query<SessionQuery>) -> Json<StatusResponse> {
    fail_stuck_items(&state).await;

    let status = state.sessions.status(query.session()).await;
    Json(StatusResponse {
        status,
        queue_size: state.queue.size(),
        num_workers: state.settings.num_workers,
        active_workers: state.queue.active_workers(),
        queue_items: state.queue.items().await,
        pending_downloads: state.tracker.pending_count().await,
        pending_warning: state.tracker.warning().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub since: usize,
}

/// GET /api/live_logs?since=N
pub async fn live_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let (logs, total) = state.sessions.logs_since(query.since).await;
    Json(json!({
        "logs": logs,
        "total": total,
        "since": query.since,
        "queue_size": state.queue.size(),
        "active_workers": state.queue.active_workers(),
    }))
}

#[derive(Debug, Serialize)]
pub struct FailedFilesResponse {
    pub failed_files: Vec<FailedFile>,
    pub count: usize,
    pub session_id: String,
}

/// GET /failed_files?session_id=
pub async fn failed_files(State(state): State<AppState>, Query(query): Query<SessionQuery>) -> Json<FailedFilesResponse> {
    let session_id = query.session().to_string();
    let failed_files = state.sessions.status(&session_id).await.failed_files;
    Json(FailedFilesResponse {
        count: failed_files.len(),
        failed_files,
        session_id,
    })
}

/// POST /retry_failed
///
/// Re-queues every failed file of the session whose upload still exists.
pub async fn retry_failed(State(state): State<AppState>, body: Option<Json<SessionBody>>) -> Json<Value> {
    let query = SessionQuery {
        session_id: body.and_then(|Json(b)| b.session_id),
    };
    let session_id = query.session();
    let failed = state.sessions.take_failed(session_id).await;

    let mut retried = Vec::new();
    for file in failed {
        let path = state.settings.uploads_dir().join(&file.filename);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(file = %file.filename, "Cannot retry, upload is gone");
            continue;
        }
        let attempt = state.sessions.bump_retry(session_id, &file.filename).await;
        let mut job = QueueJob::new(&file.filename, session_id);
        job.is_retry = true;
        if state.queue.enqueue(job).await.is_ok() {
            state
                .sessions
                .log(session_id, format!("Retrying {} (retry #{})", file.filename, attempt))
                .await;
            retried.push(file.filename);
        }
    }

    Json(json!({
        "message": format!("{} file(s) re-queued", retried.len()),
        "retried": retried.len(),
        "filenames": retried,
        "queue_size": state.queue.size(),
    }))
}

/// POST /clear_failed
pub async fn clear_failed(State(state): State<AppState>, body: Option<Json<SessionBody>>) -> Json<Value> {
    let query = SessionQuery {
        session_id: body.and_then(|Json(b)| b.session_id),
    };
    let failed = state.sessions.take_failed(query.session()).await;
    for file in &failed {
        state.queue.remove_item(&file.filename).await;
    }
    Json(json!({
        "message": format!("{} failed file(s) cleared", failed.len()),
        "cleared": failed.len(),
    }))
}

/// POST /reset_stuck_items
///
/// Items processing longer than `MAX_PROCESSING_TIME` go back in the queue.
pub async fn reset_stuck_items(State(state): State<AppState>) -> Json<Value> {
    let stuck = state
        .queue
        .stuck_items(state.settings.max_processing_time_secs, chrono::Utc::now())
        .await;

    let mut reset = Vec::new();
    for (filename, item) in stuck {
        let mut job = QueueJob::new(&filename, &item.session_id);
        job.is_retry = true;
        if state.queue.enqueue(job).await.is_ok() {
            state
                .sessions
                .log(&item.session_id, format!("Reset stuck item {}", filename))
                .await;
            reset.push(filename);
        }
    }

    Json(json!({
        "message": format!("{} stuck item(s) re-queued", reset.len()),
        "reset": reset.len(),
        "filenames": reset,
        "queue_size": state.queue.size(),
    }))
}

/// GET /queue_debug
pub async fn queue_debug(State(state): State<AppState>) -> Json<Value> {
    let grouped = state.queue.items_by_status().await;
    let total: usize = grouped.values().map(Vec::len).sum();

    let items_by_status: BTreeMap<&str, Vec<Value>> = grouped
        .into_iter()
        .map(|(status, items)| {
            let items = items
                .into_iter()
                .map(|(filename, item)| {
                    json!({
                        "filename": filename,
                        "worker": item.worker,
                        "progress": item.progress,
                        "step": item.step,
                        "session_id": item.session_id,
                        "added_at": item.added_at,
                        "processing_started_at": item.processing_started_at,
                        "is_retry": item.is_retry,
                    })
                })
                .collect();
            (status, items)
        })
        .collect();

    Json(json!({
        "total_items": total,
        "queue_size": state.queue.size(),
        "num_workers": state.settings.num_workers,
        "active_workers": state.queue.active_workers(),
        "items_by_status": items_by_status,
        "max_processing_time_seconds": state.settings.max_processing_time_secs,
    }))
}

/// GET /batch_status
pub async fn batch_status(State(state): State<AppState>) -> Json<Value> {
    let settings = &state.settings;
    let usage = disk_usage_percent(&settings.root_folder).await;
    let stored = tokio::fs::read_dir(settings.processed_dir()).await.ok();
    let mut total_tracks_stored = 0usize;
    if let Some(mut dir) = stored {
        while let Ok(Some(_)) = dir.next_entry().await {
            total_tracks_stored += 1;
        }
    }

    Json(json!({
        "enabled": true,
        "milestone_size": settings.batch_size,
        "processed_count": state.processed_count.load(Ordering::SeqCst),
        "queue_size": state.queue.size(),
        "pending_downloads": state.tracker.pending_count().await,
        "sequential_tracks": state.tracker.sequential_count().await,
        "continuous_processing": true,
        "disk": {
            "usage_percent": usage,
            "threshold_percent": settings.disk_threshold_percent,
            "cleanup_enabled": settings.disk_cleanup_enabled,
            "tracks_to_delete": settings.tracks_to_delete,
            "total_tracks_stored": total_tracks_stored,
            "cleanup_in_progress": state.disk.in_progress(),
        },
    }))
}

/// POST /batch_reset
///
/// Resets the processed-track milestone counter without touching files.
pub async fn batch_reset(State(state): State<AppState>) -> Json<Value> {
    let old_count = state.processed_count.swap(0, Ordering::SeqCst);
    state
        .sessions
        .log(GLOBAL_SESSION, format!("Batch counter reset: {} -> 0", old_count))
        .await;
    Json(json!({
        "success": true,
        "old_count": old_count,
        "new_count": 0,
    }))
}

/// POST /clear_results
///
/// Empties the result list and log of a session; files stay on disk.
pub async fn clear_results(State(state): State<AppState>, body: Option<Json<SessionBody>>) -> Json<Value> {
    let query = SessionQuery {
        session_id: body.and_then(|Json(b)| b.session_id),
    };
    let session_id = query.session();
    state.sessions.clear_results(session_id).await;
    state.sessions.log(session_id, "Results cleared").await;
    Json(json!({
        "message": "Results cleared",
        "session_id": session_id,
    }))
}

// ============================================================================
// /system_stats
// ============================================================================

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;

/// Round to one decimal place
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryInfo {
    pub total_kib: u64,
    pub available_kib: u64,
}

/// `MemTotal` and `MemAvailable` from `/proc/meminfo`
pub fn parse_meminfo(content: &str) -> Option<MemoryInfo> {
    let field = |key: &str| -> Option<u64> {
        content
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|value| value.parse().ok())
    };
    let total_kib = field("MemTotal")?;
    let available_kib = field("MemAvailable").or_else(|| field("MemFree"))?;
    (total_kib > 0).then_some(MemoryInfo { total_kib, available_kib })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub memory_total_mib: f64,
    pub memory_used_mib: f64,
    pub utilization_percent: u32,
}

/// First GPU row of `nvidia-smi --query-gpu=name,memory.total,memory.used,utilization.gpu
/// --format=csv,noheader,nounits`
pub fn parse_nvidia_smi(output: &str) -> Option<GpuInfo> {
    let row = output.lines().next()?;
    let parts: Vec<&str> = row.split(',').map(str::trim).collect();
    if parts.len() < 4 || parts[0].is_empty() {
        return None;
    }
    Some(GpuInfo {
        name: parts[0].to_string(),
        memory_total_mib: parts[1].parse().ok()?,
        memory_used_mib: parts[2].parse().ok()?,
        utilization_percent: parts[3].parse().unwrap_or(0),
    })
}

async fn query_gpu() -> Option<GpuInfo> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new("nvidia-smi")
            .arg("--query-gpu=name,memory.total,memory.used,utilization.gpu")
            .arg("--format=csv,noheader,nounits")
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// GET /system_stats
pub async fn system_stats(State(state): State<AppState>) -> Json<Value> {
    let settings = &state.settings;
    let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    let memory = match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(content) => parse_meminfo(&content),
        Err(e) => {
            debug!("Cannot read /proc/meminfo: {}", e);
            None
        }
    };
    let memory = match memory {
        Some(mem) => json!({
            "total_gb": round1(mem.total_kib as f64 / KIB_PER_GIB),
            "used_percent": round1(mem.total_kib.saturating_sub(mem.available_kib) as f64 / mem.total_kib as f64 * 100.0),
            "available_gb": round1(mem.available_kib as f64 / KIB_PER_GIB),
        }),
        None => json!({"total_gb": 0, "used_percent": 0, "available_gb": 0}),
    };

    let disk = match disk_space(&settings.root_folder).await {
        Some(space) => json!({
            "total_gb": round1(space.total_kib as f64 / KIB_PER_GIB),
            "used_percent": space.used_percent,
            "free_gb": round1(space.available_kib as f64 / KIB_PER_GIB),
        }),
        None => json!({"total_gb": 0, "used_percent": 0, "free_gb": 0}),
    };

    let gpu = match query_gpu().await {
        Some(gpu) => {
            let used_percent = if gpu.memory_total_mib > 0.0 {
                round1(gpu.memory_used_mib / gpu.memory_total_mib * 100.0)
            } else {
                0.0
            };
            json!({
                "name": gpu.name,
                "available": true,
                "memory_gb": round1(gpu.memory_total_mib / 1024.0),
                "memory_used_gb": (gpu.memory_used_mib / 1024.0 * 100.0).round() / 100.0,
                "memory_used_percent": used_percent,
                "utilization_percent": gpu.utilization_percent,
            })
        }
        None => json!({"name": "CPU Mode", "available": false, "memory_gb": 0, "memory_used_percent": 0}),
    };

    Json(json!({
        "cpu": { "count": cpu_count },
        "memory": memory,
        "gpu": gpu,
        "processing": {
            "device": settings.demucs_device.as_deref().unwrap_or("auto"),
            "num_workers": settings.num_workers,
            "queue_size": state.queue.size(),
            "active_workers": state.queue.active_workers(),
        },
        "disk": disk,
    }))
}


#[derive(Debug, Serialize)]
pub struct DatabaseStatusResponse {
    pub database_mode_enabled: bool,
    /// External endpoint; null while reports go to the catalog
    pub api_endpoint: Option<String>,
    pub database_connected: bool,
    pub database_url_set: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub schema: SchemaInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// GET /database_status
pub async fn database_status(State(state): State<AppState>) -> Json<DatabaseStatusResponse> {
    let settings = &state.settings;
    let mut response = DatabaseStatusResponse {
        database_mode_enabled: state.database_mode_active(),
        api_endpoint: None,
        database_connected: false,
        database_url_set: settings.database_url.is_some(),
        database_url: settings.database_url.as_deref().map(redact),
        schema: SchemaInfo::default(),
        database_error: None,
        note: None,
    };

    match &state.catalog {
        Some(catalog) => {
            response.database_connected = catalog.ping().await;
            match catalog.schema_info().await {
                Ok(schema) => response.schema = schema,
                Err(e) => response.database_error = Some(e.to_string()),
            }
        }
        None => {
            response.api_endpoint = Some(settings.api_endpoint.clone());
            response.note = Some(match (&state.catalog_error, settings.use_database_mode) {
                (Some(error), _) => {
                    response.database_error = Some(error.clone());
                    "Database mode requested but unavailable - falling back to external API".to_string()
                }
                (None, true) => "Database mode requested but DATABASE_URL is not set - using external API".to_string(),
                (None, false) => "Database mode disabled - using external API".to_string(),
            });
        }
    }

    Json(response)
}

pub fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/api/live_logs", get(live_logs))
        .route("/failed_files", get(failed_files))
        .route("/retry_failed", post(retry_failed))
        .route("/clear_failed", post(clear_failed))
        .route("/reset_stuck_items", post(reset_stuck_items))
        .route("/queue_debug", get(queue_debug))
        .route("/batch_status", get(batch_status))
        .route("/batch_reset", post(batch_reset))
        .route("/clear_results", post(clear_results))
        .route("/system_stats", get(system_stats))
        .route("/database_status", get(database_status))
}
