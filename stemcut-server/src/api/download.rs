//! Download endpoints and the pending-download lifecycle
//!
//! Processed files stay on disk until the consumer confirms the download
//! (`/confirm_download`), fetches every file of the track in sequential mode,
//! or the delayed deletion expires.

use axum::{
    body::{Body, Bytes},
    extract::{Query, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use stemcut_common::time::format_local;
use stemcut_common::title::AudioFormat;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use super::auth::{authorize, body_api_key, check_request, form_field, is_form, query_api_key};
use crate::cleanup::delete_now;
use crate::error::{ApiError, ApiResult};
use crate::queue::GLOBAL_SESSION;
use crate::tracking::{PendingWarning, ScheduleOutcome};
use crate::AppState;

/// Files listed per track by `/already_processed`
const LISTED_FILES: usize = 10;

// ============================================================================
// /download_file
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: Option<String>,
}

/// A processed file located on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDownload {
    pub path: PathBuf,
    /// First path component: the processed track folder
    pub track_name: String,
    pub filename: String,
}

/// Resolve a `path` parameter below `processed_dir`
///
/// Rejects `..` with 403. Falls back to a case-insensitive match of every
/// component when the exact path does not exist.
pub async fn resolve_download_path(processed_dir: &Path, requested: &str) -> ApiResult<ResolvedDownload> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(ApiError::BadRequest("path parameter is required".to_string()));
    }
    if requested.contains("..") {
        warn!(path = %requested, "Rejected path traversal attempt");
        return Err(ApiError::Forbidden("Access denied".to_string()));
    }

    let normalized = requested.replace('\\', "/");
    let components: Vec<&str> = normalized.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    if components.is_empty() {
        return Err(ApiError::BadRequest("path parameter is required".to_string()));
    }

    let exact: PathBuf = components.iter().fold(processed_dir.to_path_buf(), |p, c| p.join(c));
    let resolved = if is_file(&exact).await {
        Some(exact)
    } else {
        find_case_insensitive(processed_dir, &components).await
    };
    let Some(path) = resolved else {
        return Err(ApiError::NotFound(format!("File not found: {}", requested)));
    };

    let relative: Vec<String> = path
        .strip_prefix(processed_dir)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    let track_name = relative.first().cloned().unwrap_or_default();
    let filename = relative.last().cloned().unwrap_or_default();

    Ok(ResolvedDownload {
        path,
        track_name,
        filename,
    })
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

async fn find_case_insensitive(base: &Path, components: &[&str]) -> Option<PathBuf> {
    let mut current = base.to_path_buf();
    for component in components {
        let wanted = component.to_lowercase();
        let mut dir = tokio::fs::read_dir(&current).await.ok()?;
        let mut found = None;
        while let Ok(Some(entry)) = dir.next_entry().await {
            if entry.file_name().to_string_lossy().to_lowercase() == wanted {
                found = Some(entry.path());
                break;
            }
        }
        current = found?;
    }
    debug!(path = %current.display(), "Resolved download case-insensitively");
    is_file(&current).await.then_some(current)
}

fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".mp3") {
        AudioFormat::Mp3.mime()
    } else if lower.ends_with(".wav") {
        AudioFormat::Wav.mime()
    } else {
        "application/octet-stream"
    }
}

/// GET /download_file?path=<track>/<file>
pub async fn download_file(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> ApiResult<Response> {
    let requested = query.path.unwrap_or_default();
    let resolved = resolve_download_path(&state.settings.processed_dir(), &requested).await?;
    let file = tokio::fs::File::open(&resolved.path).await?;
    let size = file.metadata().await.map(|m| m.len()).ok();
    let track_name = resolved.track_name.as_str();

    if state.settings.delayed_delete_enabled {
        if let ScheduleOutcome::Scheduled { delete_after } = state.tracker.schedule_deletion(track_name, Utc::now()).await {
            state
                .sessions
                .log(
                    GLOBAL_SESSION,
                    format!("Download started for '{}', deletion at {}", track_name, format_local(delete_after)),
                )
                .await;
        }
    }

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&resolved.filename)));
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    let disposition = format!("attachment; filename*=UTF-8''{}", urlencoding::encode(&resolved.filename));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if state.settings.sequential_mode {
        if let Some(mark) = state.tracker.mark_file_downloaded(track_name, &resolved.filename).await {
            headers.insert("x-files-remaining", HeaderValue::from(mark.remaining));
            headers.insert(
                "x-all-downloaded",
                HeaderValue::from_static(if mark.all_downloaded { "true" } else { "false" }),
            );
            if let Ok(value) = HeaderValue::from_str(&urlencoding::encode(track_name)) {
                headers.insert("x-track-name", value);
            }

            if mark.all_downloaded {
                // The open handle keeps streaming after the unlink
                delete_now(&state, track_name, "all files downloaded").await;
                info!(track = %track_name, "All files downloaded, track deleted");
            } else {
                debug!(track = %track_name, remaining = mark.remaining, "File downloaded");
            }
        }
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

// ============================================================================
// /track_download_status
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    pub track_name: Option<String>,
}

/// GET /track_download_status?track_name=
///
/// Without a name, summarizes every sequentially tracked track.
pub async fn track_download_status(
    State(state): State<AppState>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<Json<Value>> {
    let Some(track_name) = query.track_name.filter(|t| !t.trim().is_empty()) else {
        let tracks: BTreeMap<String, Value> = state
            .tracker
            .all_download_statuses()
            .await
            .into_iter()
            .map(|(name, status)| {
                let summary = json!({
                    "downloaded_count": status.downloaded_count(),
                    "total_count": status.files.len(),
                    "all_downloaded": status.all_downloaded,
                    "pending_files": status.pending_files(),
                });
                (name, summary)
            })
            .collect();
        return Ok(Json(json!({
            "sequential_mode": state.settings.sequential_mode,
            "tracks": tracks,
        })));
    };

    let status = state
        .tracker
        .download_status(&track_name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Track not tracked: {}", track_name)))?;

    let files: BTreeMap<&String, &str> = status
        .files
        .iter()
        .map(|(name, done)| (name, if *done { "downloaded" } else { "pending" }))
        .collect();

    Ok(Json(json!({
        "track_name": track_name,
        "downloaded_count": status.downloaded_count(),
        "total_count": status.files.len(),
        "all_downloaded": status.all_downloaded,
        "files": files,
        "pending_files": status.pending_files(),
    })))
}

// ============================================================================
// /confirm_download
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ConfirmFields {
    track_name: Option<String>,
    #[serde(rename = "trackName")]
    track_name_camel: Option<String>,
}

impl ConfirmFields {
    fn into_name(self) -> Option<String> {
        self.track_name.or(self.track_name_camel)
    }
}

/// Track name from the query string, then the JSON or form body, then a raw
/// body parsed as JSON
pub fn confirm_track_name(query: Option<&str>, headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let from_query = query.and_then(|q| form_field(q, "track_name").or_else(|| form_field(q, "trackName")));

    let from_body = || {
        if body.is_empty() {
            return None;
        }
        if is_form(headers) {
            let text = std::str::from_utf8(body).ok()?;
            return form_field(text, "track_name").or_else(|| form_field(text, "trackName"));
        }
        serde_json::from_slice::<ConfirmFields>(body).ok()?.into_name()
    };

    let raw = from_query.filter(|n| !n.trim().is_empty()).or_else(from_body)?;
    let decoded = urlencoding::decode(&raw).map(|d| d.into_owned()).unwrap_or(raw);
    let name = decoded.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// GET or POST /confirm_download
///
/// Confirms that the consumer has the track. A track with per-file download
/// tracking is deleted right away; otherwise its files are deleted after
/// `DELETION_DELAY_MINUTES` (delayed mode) or right away.
pub async fn confirm_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> ApiResult<Response> {
    let query_key = query_api_key(query.as_deref());
    let body_key = body_api_key(&headers, &body);
    authorize(&state.settings.api_key, &headers, query_key.as_deref(), body_key.as_deref())?;

    let Some(track_name) = confirm_track_name(query.as_deref(), &headers, &body) else {
        let body = json!({
            "success": false,
            "error": "track_name is required",
            "hint": "Send track_name as a query parameter, JSON body {\"track_name\": \"...\"}, or form field",
        });
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    };

    // Per-file tracking means the consumer is done with the track: delete now
    if state.settings.sequential_mode && state.tracker.mark_all_downloaded(&track_name).await {
        delete_now(&state, &track_name, "download confirmed").await;
        state
            .sessions
            .log(GLOBAL_SESSION, format!("Download confirmed (sequential): '{}'", track_name))
            .await;
        let body = json!({
            "success": true,
            "message": format!("Track '{}' confirmed and cleaned up (sequential mode)", track_name),
            "pending_count": state.tracker.pending_count().await,
        });
        return Ok(Json(body).into_response());
    }

    if !state.tracker.is_known(&track_name).await {
        let similar = state.tracker.similar(&track_name).await;
        warn!(track = %track_name, similar = similar.len(), "Confirm for unknown track");
        let body = json!({
            "success": false,
            "error": format!("Track '{}' not found in pending downloads", track_name),
            "track_name": track_name,
            "similar_tracks": similar,
            "hint": "Track name must match exactly (case-sensitive)",
            "pending_count": state.tracker.pending_count().await,
        });
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    }

    let body = if state.settings.delayed_delete_enabled {
        let delay = state.settings.deletion_delay_minutes;
        let delete_after = match state.tracker.schedule_deletion(&track_name, Utc::now()).await {
            ScheduleOutcome::Scheduled { delete_after } | ScheduleOutcome::AlreadyScheduled { delete_after } => {
                delete_after
            }
            // Deleted between the lookup and here
            ScheduleOutcome::NotFound => {
                return Err(ApiError::NotFound(format!("Track '{}' no longer pending", track_name)));
            }
        };
        state
            .sessions
            .log(
                GLOBAL_SESSION,
                format!("Download confirmed: '{}', deletion in {} min", track_name, delay),
            )
            .await;
        json!({
            "success": true,
            "message": format!("Track '{}' scheduled for deletion in {} minutes", track_name, delay),
            "pending_count": state.tracker.pending_count().await,
            "deletion_delay_minutes": delay,
            "delete_after": format_local(delete_after),
        })
    } else {
        delete_now(&state, &track_name, "download confirmed").await;
        json!({
            "success": true,
            "message": format!("Track '{}' deleted", track_name),
            "pending_count": state.tracker.pending_count().await,
        })
    };

    Ok(Json(body).into_response())
}

// ============================================================================
// Pending and scheduled listings
// ============================================================================

/// Pending entry visible without an API key
#[derive(Debug, Serialize)]
pub struct PublicPendingEntry {
    pub track_name: String,
    pub age_hours: f64,
}

#[derive(Debug, Serialize)]
pub struct PendingDownloadsResponse {
    pub pending_count: usize,
    pub max_pending: usize,
    pub warning_threshold: usize,
    pub warning: PendingWarning,
    pub scheduled_count: usize,
    pub tracks: Value,
}

/// GET /pending_downloads
///
/// Callers with a valid key (or any caller when auth is disabled) see full
/// entries; others only names and ages.
pub async fn pending_downloads(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> ApiResult<Json<PendingDownloadsResponse>> {
    let query_key = query_api_key(query.as_deref());
    let authenticated = check_request(&state.settings.api_key, &headers, query_key.as_deref(), None).is_allowed();

    let entries = state.tracker.pending_list(Utc::now()).await;
    let tracks = if authenticated {
        serde_json::to_value(&entries)
    } else {
        let public: Vec<PublicPendingEntry> = entries
            .into_iter()
            .map(|e| PublicPendingEntry {
                track_name: e.track_name,
                age_hours: e.age_hours,
            })
            .collect();
        serde_json::to_value(public)
    }
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let limits = state.tracker.limits();
    Ok(Json(PendingDownloadsResponse {
        pending_count: state.tracker.pending_count().await,
        max_pending: limits.max_pending,
        warning_threshold: limits.warning_threshold,
        warning: state.tracker.warning().await,
        scheduled_count: state.tracker.scheduled_count().await,
        tracks,
    }))
}

/// GET /scheduled_deletions
pub async fn scheduled_deletions(State(state): State<AppState>) -> Json<Value> {
    let scheduled = state.tracker.scheduled_list(Utc::now()).await;
    Json(json!({
        "count": scheduled.len(),
        "deletion_delay_minutes": state.settings.deletion_delay_minutes,
        "delayed_delete_enabled": state.settings.delayed_delete_enabled,
        "scheduled": scheduled,
    }))
}

// ============================================================================
// /download_all_zip
// ============================================================================

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mp3") || ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Audio files below `processed_dir` as (archive name, path), sorted by name
fn collect_audio_files(processed_dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut dirs = vec![processed_dir.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                dirs.push(path);
                continue;
            }
            if !is_audio_file(&path) {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(processed_dir) {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((name, path));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Deflated archive of every processed MP3 and WAV, laid out as
/// `<track>/<file>`; `None` when nothing is processed yet
pub fn build_processed_zip(processed_dir: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    let files = collect_audio_files(processed_dir)?;
    if files.is_empty() {
        return Ok(None);
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, path) in &files {
        writer.start_file(name.as_str(), options)?;
        let mut source = std::fs::File::open(path)?;
        std::io::copy(&mut source, &mut writer)?;
    }
    let archive = writer.finish()?.into_inner();
    debug!(files = files.len(), bytes = archive.len(), "Built processed archive");
    Ok(Some(archive))
}

/// GET /download_all_zip
///
/// Packs whatever is processed right now. Does not confirm or schedule
/// deletion of the packed tracks.
pub async fn download_all_zip(State(state): State<AppState>) -> ApiResult<Response> {
    let processed_dir = state.settings.processed_dir();
    let archive = tokio::task::spawn_blocking(move || build_processed_zip(&processed_dir))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    let Some(archive) = archive else {
        return Err(ApiError::BadRequest("No processed files available yet".to_string()));
    };

    let filename = format!("stemcut_pack_{}.zip", Local::now().format("%Y%m%d_%H%M%S"));
    info!(bytes = archive.len(), file = %filename, "Serving processed archive");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
        ],
        archive,
    )
        .into_response())
}

// ============================================================================
// Folder listings
// ============================================================================

/// Subfolders of `dir` with their sorted file names
async fn folder_listing(dir: &Path) -> BTreeMap<String, Vec<String>> {
    let mut listing = BTreeMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return listing;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let mut files = Vec::new();
        if let Ok(mut inner) = tokio::fs::read_dir(entry.path()).await {
            while let Ok(Some(file)) = inner.next_entry().await {
                files.push(file.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();
        listing.insert(entry.file_name().to_string_lossy().into_owned(), files);
    }
    listing
}

/// GET /already_processed
pub async fn already_processed(State(state): State<AppState>) -> Json<Value> {
    let listing = folder_listing(&state.settings.processed_dir()).await;
    let tracks: Vec<Value> = listing
        .into_iter()
        .map(|(track_name, files)| {
            json!({
                "track_name": track_name,
                "files_count": files.len(),
                "files": files.into_iter().take(LISTED_FILES).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({ "count": tracks.len(), "tracks": tracks }))
}

/// GET /list_files
pub async fn list_files(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(folder_listing(&state.settings.processed_dir()).await)
}

pub fn download_routes() -> Router<AppState> {
    Router::new()
        .route("/download_file", get(download_file))
        .route("/download_all_zip", get(download_all_zip))
        .route("/track_download_status", get(track_download_status))
        .route("/confirm_download", get(confirm_download).post(confirm_download))
        .route("/pending_downloads", get(pending_downloads))
        .route("/scheduled_deletions", get(scheduled_deletions))
        .route("/already_processed", get(already_processed))
        .route("/list_files", get(list_files))
}
