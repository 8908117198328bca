//! Worker pool draining the processing queue
//!
//! Each worker takes one job at a time and runs it through the active
//! [`TrackProcessor`](crate::pipeline::TrackProcessor) with retries. Failed
//! files stay visible in the queue and in the session's failed list until
//! retried or cleared.

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use stemcut_common::events::ServiceEvent;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::history;
use crate::pipeline::JobContext;
use crate::queue::{ItemStatus, ItemUpdate, JobState, QueueJob};
use crate::AppState;

/// Checks for an upload that may still be in flight
const FILE_WAIT_ATTEMPTS: u32 = 5;

/// Spawn `NUM_WORKERS` workers
pub fn spawn_workers(state: &AppState) -> Vec<JoinHandle<()>> {
    let count = state.settings.num_workers;
    info!(workers = count, "Starting processing workers");
    (1..=count)
        .map(|worker_id| {
            let state = state.clone();
            tokio::spawn(async move { run_worker(worker_id, state).await })
        })
        .collect()
}

async fn run_worker(worker_id: usize, state: AppState) {
    while let Some(job) = state.queue.next().await {
        state.queue.worker_started();
        let session_id = job.session_id.clone();
        handle_job(&state, worker_id, job).await;
        state.queue.worker_stopped();
        settle_if_idle(&state, &session_id).await;
    }
    info!(worker_id, "Queue closed, worker exiting");
}

/// Process one job to completion; returns whether it succeeded
pub async fn handle_job(state: &AppState, worker_id: usize, job: QueueJob) -> bool {
    let filename = job.filename.clone();
    let session_id = job.session_id.clone();
    let path = state.settings.uploads_dir().join(&filename);

    if !wait_for_file(&path).await {
        let message = format!("File not found after {} checks: {}", FILE_WAIT_ATTEMPTS, filename);
        record_failure(state, &job, &path, &message, "File not found").await;
        return false;
    }

    state
        .queue
        .update(
            &filename,
            ItemUpdate {
                status: Some(ItemStatus::Processing),
                worker: Some(worker_id),
                progress: Some(0),
                step: Some("Starting...".to_string()),
            },
        )
        .await;
    state
        .sessions
        .with_status(&session_id, |s| {
            s.state = JobState::Processing;
            s.current_filename = filename.clone();
            s.current_file_idx += 1;
            s.progress = 0;
        })
        .await;
    if let Err(e) = history::update_status(&state.db, &filename, "processing", None, None).await {
        warn!(file = %filename, "Failed to update history: {}", e);
    }

    info!(worker_id, file = %filename, retry = job.is_retry, "Worker processing");

    let max_attempts = state.settings.max_retry_attempts;
    let mut last_error = String::new();
    let mut attempts = 0;

    while attempts < max_attempts {
        attempts += 1;
        let ctx = JobContext::new(
            job.clone(),
            worker_id,
            attempts,
            max_attempts,
            state.queue.clone(),
            state.sessions.clone(),
        );
        state
            .sessions
            .with_status(&session_id, |s| {
                s.retry_count.insert(filename.clone(), attempts);
            })
            .await;

        match state.processor.process(&ctx).await {
            Ok(outcome) => {
                state.sessions.remove_failed(&session_id, &filename).await;
                if let Err(e) = history::update_status(
                    &state.db,
                    &filename,
                    "completed",
                    Some(&outcome.history_type),
                    None,
                )
                .await
                {
                    warn!(file = %filename, "Failed to update history: {}", e);
                }
                state.queue.remove_item(&filename).await;

                let files: Vec<String> = outcome
                    .result
                    .edits
                    .iter()
                    .map(|edit| edit.name.clone())
                    .collect();
                state.event_bus.emit(ServiceEvent::TrackCompleted {
                    track_name: outcome.track_name.clone(),
                    files,
                    timestamp: Utc::now(),
                });
                state.sessions.push_result(&session_id, outcome.result).await;

                let suffix = if attempts > 1 {
                    format!(" (after {} attempts)", attempts)
                } else {
                    String::new()
                };
                state
                    .sessions
                    .log(&session_id, format!("Done: {}{}", outcome.track_name, suffix))
                    .await;
                count_processed(state).await;
                return true;
            }
            Err(e) => {
                last_error = e.to_string();
                state
                    .sessions
                    .log(&session_id, format!("Error on {}{}: {}", filename, ctx.retry_label(), e))
                    .await;
                if !e.is_retryable() {
                    break;
                }
                if attempts < max_attempts {
                    let delay = state.settings.retry_delay_secs;
                    state
                        .sessions
                        .log(&session_id, format!("Waiting {}s before next attempt", delay))
                        .await;
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    let message = format!("Failed after {} attempt(s). Last error: {}", attempts, last_error);
    let step: String = last_error.chars().take(50).collect();
    record_failure(state, &job, &path, &message, &format!("Failed: {}", step)).await;
    false
}

async fn record_failure(state: &AppState, job: &QueueJob, path: &Path, message: &str, step: &str) {
    error!(file = %job.filename, session = %job.session_id, "{}", message);

    state
        .sessions
        .add_failed(
            &job.session_id,
            &job.filename,
            Some(path.display().to_string()),
            message,
        )
        .await;
    state
        .queue
        .update(
            &job.filename,
            ItemUpdate {
                status: Some(ItemStatus::Failed),
                progress: Some(0),
                step: Some(step.to_string()),
                ..Default::default()
            },
        )
        .await;
    if let Err(e) = history::update_status(&state.db, &job.filename, "failed", None, Some(message)).await {
        warn!(file = %job.filename, "Failed to update history: {}", e);
    }
    state.event_bus.emit(ServiceEvent::TrackFailed {
        filename: job.filename.clone(),
        error: message.to_string(),
        timestamp: Utc::now(),
    });
}

/// Give an upload a few seconds to land before declaring it missing
async fn wait_for_file(path: &Path) -> bool {
    for attempt in 0..=FILE_WAIT_ATTEMPTS {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if attempt < FILE_WAIT_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    false
}

/// Bump the processed counter and log every `BATCH_SIZE` tracks
async fn count_processed(state: &AppState) {
    let count = state.processed_count.fetch_add(1, Ordering::SeqCst) + 1;
    if count % state.settings.batch_size == 0 {
        info!(count, "Processing milestone");
        state
            .sessions
            .log(crate::queue::GLOBAL_SESSION, format!("Milestone: {} tracks processed", count))
            .await;
    }
}

/// Reset the session to idle once nothing is queued or running
async fn settle_if_idle(state: &AppState, session_id: &str) {
    if state.queue.size() > 0 || state.queue.active_workers() > 0 {
        return;
    }
    let failed = state
        .sessions
        .with_status(session_id, |s| {
            s.state = JobState::Idle;
            s.current_filename.clear();
            s.current_step = if s.failed_files.is_empty() {
                "Ready for new files".to_string()
            } else {
                format!("{} failed file(s), retry to process again", s.failed_files.len())
            };
            s.failed_files.len()
        })
        .await;

    let summary = if failed > 0 {
        format!("Queue finished with {} failure(s)", failed)
    } else {
        "Queue finished, all files processed".to_string()
    };
    state.sessions.log(session_id, summary).await;
}
