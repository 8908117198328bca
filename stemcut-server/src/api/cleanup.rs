//! Cleanup endpoints

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use stemcut_common::config::parse_flag;
use tracing::{info, warn};

use crate::cleanup::{delete_oldest_tracks, full_reset, MAX_OLDEST_COUNT};
use crate::db::history;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const DEFAULT_OLDEST_COUNT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub clear_history: Option<String>,
}

/// POST /cleanup
///
/// Deletes every upload, Demucs output and processed track and forgets all
/// pending, scheduled and queue state. `clear_history=true` also empties the
/// upload history.
pub async fn cleanup(State(state): State<AppState>, Query(query): Query<CleanupQuery>) -> ApiResult<Json<Value>> {
    warn!("Full cleanup requested");
    let report = full_reset(&state).await;

    let clear_history = query.clear_history.as_deref().and_then(parse_flag).unwrap_or(false);
    let history_cleared = if clear_history {
        Some(history::clear(&state.db).await?)
    } else {
        None
    };

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Cleanup complete: {} item(s) deleted, {:.1} MB freed",
            report.items_deleted,
            report.bytes_freed as f64 / (1024.0 * 1024.0)
        ),
        "items_deleted": report.items_deleted,
        "bytes_freed": report.bytes_freed,
        "tracks_forgotten": report.tracks_forgotten,
        "history_cleared": history_cleared,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct OldestQuery {
    pub count: Option<usize>,
}

/// POST /cleanup_oldest?count=N
pub async fn cleanup_oldest(State(state): State<AppState>, Query(query): Query<OldestQuery>) -> ApiResult<Json<Value>> {
    let requested = query.count.unwrap_or(DEFAULT_OLDEST_COUNT);
    if requested == 0 {
        return Err(ApiError::BadRequest("count must be at least 1".to_string()));
    }
    let count = requested.min(MAX_OLDEST_COUNT);

    let deleted = delete_oldest_tracks(&state, count).await;
    info!(requested, deleted, "Oldest-track cleanup");

    Ok(Json(json!({
        "success": true,
        "message": format!("{} oldest track(s) deleted", deleted),
        "requested": count,
        "deleted": deleted,
        "cleanup_in_progress": state.disk.in_progress(),
    })))
}

/// GET /debug_cleanup
pub async fn debug_cleanup(State(state): State<AppState>) -> Json<Value> {
    let settings = &state.settings;
    let now = Utc::now();
    let mode = if settings.delayed_delete_enabled { "delayed" } else { "immediate" };
    let description = if settings.delayed_delete_enabled {
        format!(
            "Files are deleted {} minutes after the first download or confirmation",
            settings.deletion_delay_minutes
        )
    } else {
        "Files are deleted as soon as the download is confirmed".to_string()
    };

    Json(json!({
        "mode": mode,
        "description": description,
        "settings": {
            "delayed_delete_enabled": settings.delayed_delete_enabled,
            "deletion_delay_minutes": settings.deletion_delay_minutes,
            "sequential_mode": settings.sequential_mode,
            "max_file_age_hours": settings.max_file_age_hours,
            "cleanup_interval_minutes": settings.cleanup_interval_minutes,
            "disk_threshold_percent": settings.disk_threshold_percent,
            "disk_cleanup_enabled": settings.disk_cleanup_enabled,
        },
        "pending": {
            "count": state.tracker.pending_count().await,
            "tracks": state.tracker.pending_list(now).await,
        },
        "scheduled": {
            "count": state.tracker.scheduled_count().await,
            "tracks": state.tracker.scheduled_list(now).await,
        },
    }))
}

/// Routes readable without a key
pub fn cleanup_routes() -> Router<AppState> {
    Router::new().route("/debug_cleanup", get(debug_cleanup))
}
