//! HTTP API and worker integration tests
//!
//! Routes run through `tower::ServiceExt::oneshot` against a router built
//! on a temporary root folder and an in-memory SQLite database. Processing
//! uses a fake processor, so no demucs or ffmpeg is needed.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stemcut_common::config::Settings;
use stemcut_server::db::{self, history};
use stemcut_server::pipeline::{JobContext, PipelineError, ProcessOutcome, TrackProcessor};
use stemcut_server::queue::{EditLink, ItemStatus, QueueJob, TrackResult, GLOBAL_SESSION};
use stemcut_server::reporting::{TrackMetadata, TrackReporter};
use stemcut_server::tracking::{DownloadTracker, PendingTrack, TrackerLimits};
use stemcut_server::{build_router, cleanup, worker, AppState};
use tempfile::TempDir;
use tower::ServiceExt;

// ============================================================================
// Fakes
// ============================================================================

struct NullReporter;

#[async_trait]
impl TrackReporter for NullReporter {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn report(&self, _metadata: &TrackMetadata) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes one Main edit per upload and registers it as pending
struct FakeProcessor {
    settings: Settings,
    tracker: Arc<DownloadTracker>,
}

#[async_trait]
impl TrackProcessor for FakeProcessor {
    async fn process(&self, ctx: &JobContext) -> Result<ProcessOutcome, PipelineError> {
        let track_name = ctx
            .filename()
            .trim_end_matches(".mp3")
            .to_string();
        let dir = self.settings.processed_dir().join(&track_name);
        tokio::fs::create_dir_all(&dir).await?;
        let file = format!("{} - Main.mp3", track_name);
        tokio::fs::write(dir.join(&file), b"fake mp3").await?;
        ctx.progress(100, "Done").await;

        self.tracker
            .register(PendingTrack {
                track_name: track_name.clone(),
                files_total: 1,
                files: vec![file.clone()],
                original_path: Some(self.settings.uploads_dir().join(ctx.filename())),
                processed_dir: dir,
                htdemucs_dir: None,
                created_at: Utc::now(),
            })
            .await;

        Ok(ProcessOutcome {
            track_name: track_name.clone(),
            result: TrackResult {
                original: track_name.clone(),
                edits: vec![EditLink {
                    name: format!("{} - Main", track_name),
                    mp3: format!("/download_file?path={}/{}", track_name, file),
                    wav: None,
                }],
            },
            history_type: "Full Analysis".to_string(),
        })
    }
}

struct FailingProcessor;

#[async_trait]
impl TrackProcessor for FailingProcessor {
    async fn process(&self, ctx: &JobContext) -> Result<ProcessOutcome, PipelineError> {
        Err(PipelineError::MissingUpload(ctx.filename().into()))
    }
}

// ============================================================================
// Setup helpers
// ============================================================================

fn test_settings(root: &TempDir) -> Settings {
    let mut settings = Settings::with_root(root.path());
    settings.max_retry_attempts = 1;
    settings.retry_delay_secs = 0;
    settings.ensure_folders().unwrap();
    settings
}

async fn test_state_with(root: &TempDir, configure: impl FnOnce(&mut Settings)) -> AppState {
    let mut settings = test_settings(root);
    configure(&mut settings);

    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::init_local_tables(&pool).await.unwrap();

    let tracker = Arc::new(DownloadTracker::new(TrackerLimits::from(&settings)));
    let processor = Arc::new(FakeProcessor {
        settings: settings.clone(),
        tracker: tracker.clone(),
    });
    AppState::with_processor(settings, pool, tracker, Arc::new(NullReporter), processor)
}

async fn test_state(root: &TempDir) -> AppState {
    test_state_with(root, |_| {}).await
}

/// Create `processed/<name>/` with the given files and register it
async fn register_track(state: &AppState, name: &str, files: &[&str]) -> PendingTrack {
    let dir = state.settings.processed_dir().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    for file in files {
        std::fs::write(dir.join(file), b"audio").unwrap();
    }
    let track = PendingTrack {
        track_name: name.to_string(),
        files_total: files.len(),
        files: files.iter().map(|f| f.to_string()).collect(),
        original_path: None,
        processed_dir: dir,
        htdemucs_dir: None,
        created_at: Utc::now(),
    };
    state.tracker.register(track.clone()).await;
    track
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let (status, _, body) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "stemcut");
    assert_eq!(body["queue_size"], 0);
}

// ============================================================================
// /confirm_download
// ============================================================================

#[tokio::test]
async fn test_confirm_without_name_is_bad_request() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let (status, _, body) = send(&state, post_json("/confirm_download", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["hint"].as_str().unwrap().contains("track_name"));
}

#[tokio::test]
async fn test_confirm_unknown_track_lists_similar() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    register_track(&state, "Hot Spot", &["Hot Spot - Main.mp3"]).await;
    register_track(&state, "Hot Spot Remix", &["Hot Spot Remix - Main.mp3"]).await;
    register_track(&state, "Other", &["Other - Main.mp3"]).await;

    let (status, _, body) = send(&state, post_json("/confirm_download", json!({"track_name": "hot spot"}))).await;
    // "hot spot" is contained in both names but matches neither exactly
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["pending_count"], 3);
    let similar: Vec<&str> = body["similar_tracks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(similar, vec!["Hot Spot", "Hot Spot Remix"]);
}

#[tokio::test]
async fn test_confirm_immediate_deletes_files() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| {
        s.delayed_delete_enabled = false;
        s.sequential_mode = false;
    })
    .await;
    let track = register_track(&state, "Tt Freak", &["Tt Freak - Main.mp3"]).await;

    let (status, _, body) = send(&state, get("/confirm_download?track_name=Tt%20Freak")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["pending_count"], 0);
    assert!(body.get("deletion_delay_minutes").is_none());
    assert!(!track.processed_dir.exists());
    assert!(!state.tracker.is_known("Tt Freak").await);
}

#[tokio::test]
async fn test_confirm_delayed_schedules_deletion() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| s.sequential_mode = false).await;
    let track = register_track(&state, "Tt Freak", &["Tt Freak - Main.mp3"]).await;
    register_track(&state, "Keep", &["Keep - Main.mp3"]).await;

    let request = Request::builder()
        .method("POST")
        .uri("/confirm_download")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("track_name=Tt+Freak"))
        .unwrap();
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending_count"], 1);
    assert_eq!(body["deletion_delay_minutes"], 300);
    assert!(track.processed_dir.exists(), "files stay until the delay expires");

    // Confirming again is accepted while scheduled
    let (status, _, _) = send(&state, post_json("/confirm_download", json!({"trackName": "Tt Freak"}))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = send(&state, get("/scheduled_deletions")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["scheduled"][0]["track_name"], "Tt Freak");
}

#[tokio::test]
async fn test_confirm_partly_downloaded_track_deletes_now() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    let track = register_track(&state, "Song", &["Song - Main.mp3", "Song - Main.wav"]).await;

    // First file fetched: the track is now scheduled and half downloaded
    let response = build_router(state.clone())
        .oneshot(get("/download_file?path=Song/Song%20-%20Main.mp3"))
        .await
        .unwrap();
    assert_eq!(response.headers()["x-files-remaining"], "1");
    assert_eq!(state.tracker.scheduled_count().await, 1);

    let (status, _, body) = send(&state, post_json("/confirm_download", json!({"track_name": "Song"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().unwrap().contains("sequential"));
    assert!(body.get("deletion_delay_minutes").is_none());
    assert!(!track.processed_dir.exists(), "no 300 minute wait once tracked per file");
    assert!(!state.tracker.is_known("Song").await);
    assert_eq!(state.tracker.scheduled_count().await, 0);
    assert_eq!(state.tracker.sequential_count().await, 0);
}

#[tokio::test]
async fn test_confirm_not_found_hint_and_sequential_similar() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    register_track(&state, "Hot Spot", &["Hot Spot - Main.mp3", "Hot Spot - Main.wav"]).await;

    // Downloading one file moves the track out of pending; only the per-file record remains
    build_router(state.clone())
        .oneshot(get("/download_file?path=Hot%20Spot/Hot%20Spot%20-%20Main.mp3"))
        .await
        .unwrap();
    assert_eq!(state.tracker.pending_count().await, 0);

    let (status, _, body) = send(&state, post_json("/confirm_download", json!({"track_name": "HOT SPOT"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["similar_tracks"], json!(["Hot Spot"]));
    assert!(body["hint"].as_str().unwrap().contains("case-sensitive"));
}

#[tokio::test]
async fn test_confirm_requires_key_when_configured() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| s.api_key = "secret".to_string()).await;
    register_track(&state, "Song", &["Song - Main.mp3"]).await;

    let (status, _, body) = send(&state, post_json("/confirm_download", json!({"track_name": "Song"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _, _) = send(
        &state,
        post_json("/confirm_download", json!({"track_name": "Song", "api_key": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/confirm_download")
        .header("authorization", "Bearer secret")
        .header("content-type", "application/json")
        .body(Body::from(json!({"track_name": "Song"}).to_string()))
        .unwrap();
    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// /pending_downloads
// ============================================================================

#[tokio::test]
async fn test_pending_downloads_hides_details_without_key() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| {
        s.api_key = "secret".to_string();
        s.max_pending_tracks = 3;
        s.pending_warning_threshold = 2;
    })
    .await;
    register_track(&state, "First", &["First - Main.mp3"]).await;
    register_track(&state, "Second", &["Second - Main.mp3"]).await;

    let (status, _, body) = send(&state, get("/pending_downloads")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending_count"], 2);
    assert_eq!(body["max_pending"], 3);
    assert_eq!(body["warning_threshold"], 2);
    assert_eq!(body["warning"]["warning"], true);
    assert_eq!(body["warning"]["level"], "warning");
    assert_eq!(body["tracks"][0]["track_name"], "First", "oldest first");
    assert!(body["tracks"][0].get("processed_dir").is_none());
    assert!(body["tracks"][0].get("files_total").is_none());

    let (_, _, body) = send(&state, get("/pending_downloads?api_key=secret")).await;
    assert_eq!(body["tracks"][0]["files_total"], 1);
    assert!(body["tracks"][0]["processed_dir"].as_str().unwrap().ends_with("First"));
}

// ============================================================================
// /database_status
// ============================================================================

#[tokio::test]
async fn test_database_status_in_api_mode() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| s.api_endpoint = "https://api.example.org/tracks".to_string()).await;

    let (status, _, body) = send(&state, get("/database_status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database_mode_enabled"], false);
    assert_eq!(body["database_connected"], false);
    assert_eq!(body["database_url_set"], false);
    assert_eq!(body["api_endpoint"], "https://api.example.org/tracks");
    assert_eq!(body["note"], "Database mode disabled - using external API");
    assert_eq!(body["schema"]["track_table_exists"], false);
}

// ============================================================================
// /download_file
// ============================================================================

#[tokio::test]
async fn test_download_rejects_traversal() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let (status, _, body) = send(&state, get("/download_file?path=../stemcut.db")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_sequential_download_deletes_after_last_file() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    let track = register_track(&state, "Song", &["Song - Main.mp3", "Song - Main.wav"]).await;

    let response = build_router(state.clone())
        .oneshot(get("/download_file?path=Song/Song%20-%20Main.mp3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-files-remaining"], "1");
    assert_eq!(response.headers()["x-all-downloaded"], "false");
    assert_eq!(response.headers()["content-type"], "audio/mpeg");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"audio");

    // First download moved the track to the scheduled set
    assert_eq!(state.tracker.pending_count().await, 0);
    assert_eq!(state.tracker.scheduled_count().await, 1);

    let (status, _, _) = send(&state, get("/track_download_status?track_name=Song")).await;
    assert_eq!(status, StatusCode::OK);

    let response = build_router(state.clone())
        .oneshot(get("/download_file?path=song/song%20-%20main.wav"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-all-downloaded"], "true");
    assert_eq!(response.headers()["x-files-remaining"], "0");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"audio");

    assert!(!track.processed_dir.exists());
    assert!(!state.tracker.is_known("Song").await);
    let (status, _, _) = send(&state, get("/track_download_status?track_name=Song")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Uploads and threshold blocking
// ============================================================================

#[tokio::test]
async fn test_enqueue_blocked_at_critical_level() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| {
        s.max_pending_tracks = 1;
        s.pending_warning_threshold = 1;
    })
    .await;
    std::fs::write(state.settings.uploads_dir().join("New.mp3"), b"audio").unwrap();
    register_track(&state, "Old", &["Old - Main.mp3"]).await;

    let (status, _, body) = send(&state, post_json("/enqueue_file", json!({"filename": "New.mp3"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "TOO_MANY_PENDING");
    assert_eq!(body["pending_warning"]["level"], "critical");
    assert_eq!(body["pending_warning"]["max"], 1);
    assert_eq!(state.queue.size(), 0);

    // The pending limit is checked before the upload lookup
    let (status, _, _) = send(&state, post_json("/enqueue_file", json!({"filename": "Missing.mp3"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_interrupted_upload_leaves_no_partial_file() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    // Body ends inside the file part, without a closing boundary
    let boundary = "stemcutboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"Cut.mp3\"\r\n\
         Content-Type: audio/mpeg\r\n\r\npartial audio bytes",
        b = boundary
    );
    let request = Request::builder()
        .method("POST")
        .uri("/upload_chunk")
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap();

    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!state.settings.uploads_dir().join("Cut.mp3").exists());
    assert_eq!(history::count(&state.db).await.unwrap(), 0);
    assert_eq!(state.queue.size(), 0);
}

#[tokio::test]
async fn test_enqueue_missing_upload_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let (status, _, _) = send(&state, post_json("/enqueue_file", json!({"filename": "Nope.mp3"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_chunk_saves_and_queues() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let boundary = "stemcutboundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"session_id\"\r\n\r\nsess-1\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"../My_Song.mp3\"\r\n\
         Content-Type: audio/mpeg\r\n\r\nID3data\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::builder()
        .method("POST")
        .uri("/upload_chunk")
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap();

    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "sess-1");
    assert_eq!(body["saved"], json!(["My_Song.mp3"]));
    assert_eq!(body["queued"], json!(["My_Song.mp3"]));
    assert_eq!(body["queue_size"], 1);

    let saved = std::fs::read(state.settings.uploads_dir().join("My_Song.mp3")).unwrap();
    assert_eq!(saved, b"ID3data");

    let records = history::list(&state.db, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "queued");
    assert_eq!(records[0].session_id, "sess-1");
}

// ============================================================================
// Protected routes
// ============================================================================

#[tokio::test]
async fn test_cleanup_requires_key() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| s.api_key = "secret".to_string()).await;
    let track = register_track(&state, "Song", &["Song - Main.mp3"]).await;

    let request = Request::builder().method("POST").uri("/cleanup").body(Body::empty()).unwrap();
    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(track.processed_dir.exists());

    let request = Request::builder()
        .method("POST")
        .uri("/cleanup")
        .header("x-api-key", "secret")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tracks_forgotten"], 1);
    assert!(!track.processed_dir.exists());
    assert_eq!(state.tracker.pending_count().await, 0);
}

// ============================================================================
// Workers
// ============================================================================

#[tokio::test]
async fn test_worker_success_registers_pending_track() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    std::fs::write(state.settings.uploads_dir().join("Song.mp3"), b"audio").unwrap();
    history::insert(&state.db, "Song.mp3", "s1", "uploaded", "Unknown").await.unwrap();

    state.queue.enqueue(QueueJob::new("Song.mp3", "s1")).await.unwrap();
    let job = state.queue.next().await.unwrap();
    assert!(worker::handle_job(&state, 1, job).await);

    assert!(state.tracker.is_known("Song").await);
    assert_eq!(state.tracker.pending_count().await, 1);
    assert!(state.queue.item("Song.mp3").await.is_none(), "completed items leave the queue");
    assert_eq!(state.processed_count.load(Ordering::SeqCst), 1);

    let status = state.sessions.status("s1").await;
    assert_eq!(status.results.len(), 1);
    assert_eq!(status.results[0].edits[0].name, "Song - Main");
    assert!(status.failed_files.is_empty());

    let records = history::list(&state.db, 10).await.unwrap();
    assert_eq!(records[0].status, "completed");
    assert_eq!(records[0].track_type, "Full Analysis");
}

#[tokio::test]
async fn test_worker_failure_is_recorded() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(&root);
    settings.max_retry_attempts = 3;
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::init_local_tables(&pool).await.unwrap();
    let tracker = Arc::new(DownloadTracker::new(TrackerLimits::from(&settings)));
    let state = AppState::with_processor(settings, pool, tracker, Arc::new(NullReporter), Arc::new(FailingProcessor));

    std::fs::write(state.settings.uploads_dir().join("Bad.mp3"), b"audio").unwrap();
    history::insert(&state.db, "Bad.mp3", GLOBAL_SESSION, "uploaded", "Unknown").await.unwrap();
    state.queue.enqueue(QueueJob::new("Bad.mp3", GLOBAL_SESSION)).await.unwrap();
    let job = state.queue.next().await.unwrap();

    // Missing uploads are not retried, so this returns without waiting
    assert!(!worker::handle_job(&state, 1, job).await);

    let item = state.queue.item("Bad.mp3").await.unwrap();
    assert_eq!(item.status, ItemStatus::Failed);

    let (_, _, body) = send(&state, get("/failed_files")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["failed_files"][0]["filename"], "Bad.mp3");

    let records = history::list(&state.db, 10).await.unwrap();
    assert_eq!(records[0].status, "failed");
    assert!(records[0].error.as_deref().unwrap().contains("1 attempt"));

    let (_, _, body) = send(&state, post_json("/retry_failed", json!({}))).await;
    assert_eq!(body["retried"], 1);
    assert_eq!(state.queue.size(), 1);
}

// ============================================================================
// Cleanup services
// ============================================================================

/// Backdate the modification time of a file or folder
fn set_age(path: &Path, age: Duration) {
    let handle = std::fs::File::open(path).unwrap();
    handle.set_modified(SystemTime::now() - age).unwrap();
}

#[tokio::test]
async fn test_sweep_deletes_expired_scheduled_track() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state_with(&root, |s| {
        s.sequential_mode = false;
        s.deletion_delay_minutes = 0;
    })
    .await;
    let track = register_track(&state, "Song", &["Song - Main.mp3"]).await;
    let keep = register_track(&state, "Keep", &["Keep - Main.mp3"]).await;

    let (status, _, _) = send(&state, get("/confirm_download?track_name=Song")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(track.processed_dir.exists());
    assert_eq!(state.tracker.scheduled_count().await, 1);

    assert_eq!(cleanup::sweep_expired(&state).await, 1);
    assert!(!track.processed_dir.exists());
    assert!(!state.tracker.is_known("Song").await);
    assert_eq!(state.tracker.scheduled_count().await, 0);

    // Pending tracks are untouched by the sweep
    assert!(keep.processed_dir.exists());
    assert_eq!(state.tracker.pending_count().await, 1);
    assert_eq!(cleanup::sweep_expired(&state).await, 0);
}

#[tokio::test]
async fn test_cleanup_oldest_removes_oldest_tracks_first() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    let oldest = register_track(&state, "Oldest", &["Oldest - Main.mp3"]).await;
    let older = register_track(&state, "Older", &["Older - Main.mp3"]).await;
    let newest = register_track(&state, "Newest", &["Newest - Main.mp3"]).await;
    let stems = state.settings.htdemucs_dir().join("Oldest");
    std::fs::create_dir_all(&stems).unwrap();

    set_age(&oldest.processed_dir, Duration::from_secs(3 * 3600));
    set_age(&older.processed_dir, Duration::from_secs(2 * 3600));
    set_age(&newest.processed_dir, Duration::from_secs(3600));

    let request = Request::builder()
        .method("POST")
        .uri("/cleanup_oldest?count=2")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);
    assert_eq!(body["cleanup_in_progress"], false);

    assert!(!oldest.processed_dir.exists());
    assert!(!older.processed_dir.exists());
    assert!(!stems.exists());
    assert!(newest.processed_dir.exists());
    assert!(!state.tracker.is_known("Oldest").await);
    assert!(state.tracker.is_known("Newest").await);

    let request = Request::builder()
        .method("POST")
        .uri("/cleanup_oldest?count=0")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cleanup_old_files_by_age() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let stale = register_track(&state, "Stale", &["Stale - Main.mp3"]).await;
    let fresh = register_track(&state, "Fresh", &["Fresh - Main.mp3"]).await;
    set_age(&stale.processed_dir, Duration::from_secs(5 * 3600));

    let uploads = state.settings.uploads_dir();
    std::fs::write(uploads.join("stale.mp3"), b"audio").unwrap();
    std::fs::write(uploads.join("fresh.mp3"), b"audio").unwrap();
    set_age(&uploads.join("stale.mp3"), Duration::from_secs(5 * 3600));

    let removed = cleanup::cleanup_old_files(&state, Duration::from_secs(3600)).await;
    assert_eq!(removed, 2);

    assert!(!stale.processed_dir.exists());
    assert!(!uploads.join("stale.mp3").exists());
    assert!(!state.tracker.is_known("Stale").await);

    assert!(fresh.processed_dir.exists());
    assert!(uploads.join("fresh.mp3").exists());
    assert!(state.tracker.is_known("Fresh").await);
}

// ============================================================================
// Archive, history export and operator routes
// ============================================================================

async fn send_raw(state: &AppState, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes.to_vec())
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_download_all_zip() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let (status, _, _) = send(&state, get("/download_all_zip")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    register_track(&state, "Song", &["Song - Main.mp3", "Song - Acap.wav"]).await;
    register_track(&state, "Other", &["Other - Main.mp3"]).await;

    let (status, headers, bytes) = send_raw(&state, get("/download_all_zip")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/zip");
    assert!(headers["content-disposition"].to_str().unwrap().contains(".zip"));

    let zip = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut names: Vec<&str> = zip.file_names().collect();
    names.sort();
    assert_eq!(names, vec!["Other/Other - Main.mp3", "Song/Song - Acap.wav", "Song/Song - Main.mp3"]);

    // Packing is not a download confirmation
    assert_eq!(state.tracker.pending_count().await, 2);
    assert_eq!(state.tracker.scheduled_count().await, 0);
}

#[tokio::test]
async fn test_history_csv_and_clear() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    history::insert(&state.db, "Song, Live.mp3", "s1", "completed", "Main").await.unwrap();
    history::insert(&state.db, "Other.mp3", "s1", "uploaded", "Unknown").await.unwrap();

    let (status, headers, bytes) = send_raw(&state, get("/history/csv")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/csv"));
    assert!(headers["content-disposition"].to_str().unwrap().contains("upload_history_"));

    let csv = String::from_utf8(bytes).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "filename,status,date,type,session_id,error");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("Other.mp3,uploaded,"));
    assert!(lines[2].starts_with("\"Song, Live.mp3\",completed,"));

    let (status, _, body) = send(&state, post_empty("/history/clear")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);
    assert_eq!(history::count(&state.db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_batch_reset_zeroes_counter() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    state.processed_count.store(7, Ordering::SeqCst);

    let (status, _, body) = send(&state, post_empty("/batch_reset")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["old_count"], 7);
    assert_eq!(body["new_count"], 0);

    let (_, _, body) = send(&state, get("/batch_status")).await;
    assert_eq!(body["processed_count"], 0);
}

#[tokio::test]
async fn test_clear_results_keeps_files() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;
    let track = register_track(&state, "Song", &["Song - Main.mp3"]).await;
    state
        .sessions
        .push_result(
            "s1",
            TrackResult {
                original: "Song".to_string(),
                edits: Vec::new(),
            },
        )
        .await;
    state.sessions.log("s1", "old line").await;

    let (status, _, body) = send(&state, post_json("/clear_results", json!({"session_id": "s1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "s1");

    let session = state.sessions.status("s1").await;
    assert!(session.results.is_empty());
    assert_eq!(session.logs.len(), 1);
    assert!(session.logs[0].ends_with("Results cleared"));
    assert!(track.processed_dir.join("Song - Main.mp3").exists());
    assert!(state.tracker.is_known("Song").await);
}

#[tokio::test]
async fn test_system_stats_shape() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(&root).await;

    let (status, _, body) = send(&state, get("/system_stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cpu"]["count"].as_u64().unwrap() >= 1);
    assert!(body["memory"]["total_gb"].is_number());
    assert!(body["disk"]["used_percent"].is_number());
    assert!(body["gpu"]["available"].is_boolean());
    assert_eq!(body["processing"]["num_workers"], state.settings.num_workers);
    assert_eq!(body["processing"]["queue_size"], 0);
}
