//! Upload history endpoints

use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::db::history::{self, UploadRecord, DEFAULT_LIMIT};
use crate::error::ApiResult;
use crate::queue::GLOBAL_SESSION;
use crate::AppState;

/// Rows exported by `/history/csv`
const CSV_EXPORT_LIMIT: i64 = 100_000;

const CSV_HEADER: &str = "filename,status,date,type,session_id,error";

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    pub total: i64,
    pub records: Vec<UploadRecord>,
}

/// GET /history?limit=N
///
/// Most recent uploads first.
pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 10_000);
    let records = history::list(&state.db, limit).await?;
    let total = history::count(&state.db).await?;

    Ok(Json(HistoryResponse {
        count: records.len(),
        total,
        records,
    }))
}

/// Quote a CSV field when it holds a separator, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render history rows as CSV with a header line
pub fn history_csv(records: &[UploadRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push_str("\r\n");
    for record in records {
        let date = record.uploaded_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
        let row = [
            record.filename.as_str(),
            record.status.as_str(),
            date.as_str(),
            record.track_type.as_str(),
            record.session_id.as_str(),
            record.error.as_deref().unwrap_or(""),
        ]
        .map(csv_field)
        .join(",");
        out.push_str(&row);
        out.push_str("\r\n");
    }
    out
}

/// GET /history/csv
pub async fn download_history_csv(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let records = history::list(&state.db, CSV_EXPORT_LIMIT).await?;
    let filename = format!("upload_history_{}.csv", Local::now().format("%Y%m%d_%H%M%S"));
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
        ],
        history_csv(&records),
    ))
}

/// POST /history/clear
pub async fn clear_history(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let deleted = history::clear(&state.db).await?;
    info!(deleted, "Upload history cleared");
    state.sessions.log(GLOBAL_SESSION, "Upload history cleared").await;
    Ok(Json(json!({
        "message": "History cleared",
        "deleted": deleted,
    })))
}

pub fn history_routes() -> Router<AppState> {
    Router::new()
        .route("/history", get(get_history))
        .route("/history/csv", get(download_history_csv))
        .route("/history/clear", post(clear_history))
}
