//! Processing queue
//!
//! Jobs travel through an unbounded tokio channel drained by the worker pool.
//! Alongside the channel a tracker keeps one [`QueueItem`] per filename for
//! the status endpoints.

pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use stemcut_common::events::{EventBus, ServiceEvent};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

pub use session::{EditLink, FailedFile, JobState, JobStatus, LogBuffer, SessionRegistry, TrackResult};

/// Session used when a client does not name one
pub const GLOBAL_SESSION: &str = "global";

/// One file to process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub filename: String,
    pub session_id: String,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub force_reprocess: bool,
}

impl QueueJob {
    pub fn new(filename: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            session_id: session_id.into(),
            is_retry: false,
            force_reprocess: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Failed,
    Processing,
    Waiting,
    Completed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Failed => "failed",
            ItemStatus::Processing => "processing",
            ItemStatus::Waiting => "waiting",
            ItemStatus::Completed => "completed",
        }
    }
}

/// Tracker entry for one queued file
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub status: ItemStatus,
    pub worker: Option<usize>,
    pub progress: u8,
    pub session_id: String,
    pub step: String,
    pub added_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub is_retry: bool,
}

/// Queue item as listed by `/status`
#[derive(Debug, Clone, Serialize)]
pub struct QueueItemView {
    pub filename: String,
    pub status: ItemStatus,
    pub worker: Option<usize>,
    pub progress: u8,
    pub step: String,
}

/// Partial update of a queue item; `None` leaves the field unchanged
#[derive(Debug, Default, Clone)]
pub struct ItemUpdate {
    pub status: Option<ItemStatus>,
    pub worker: Option<usize>,
    pub progress: Option<u8>,
    pub step: Option<String>,
}

impl ItemUpdate {
    pub fn progress(progress: u8, step: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            step: Some(step.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("processing queue is closed")]
    Closed,
}

/// Job channel plus item tracker
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueueJob>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueJob>>,
    size: AtomicUsize,
    active_workers: AtomicUsize,
    items: RwLock<HashMap<String, QueueItem>>,
    events: EventBus,
}

impl JobQueue {
    pub fn new(events: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            size: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            items: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Queue a job and add (or reset) its tracker entry; returns the queue size
    pub async fn enqueue(&self, job: QueueJob) -> Result<usize, QueueError> {
        {
            let mut items = self.items.write().await;
            items.insert(
                job.filename.clone(),
                QueueItem {
                    status: ItemStatus::Waiting,
                    worker: None,
                    progress: 0,
                    session_id: job.session_id.clone(),
                    step: "Waiting...".to_string(),
                    added_at: Utc::now(),
                    processing_started_at: None,
                    is_retry: job.is_retry,
                },
            );
        }

        self.size.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.size.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(self.size())
    }

    /// Wait for the next job; `None` once the queue is closed
    pub async fn next(&self) -> Option<QueueJob> {
        let job = self.rx.lock().await.recv().await?;
        self.size.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    /// Jobs waiting in the channel
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Apply an update to a tracked item and broadcast it
    pub async fn update(&self, filename: &str, update: ItemUpdate) {
        let mut items = self.items.write().await;
        let Some(item) = items.get_mut(filename) else {
            debug!(file = %filename, "Update for untracked queue item");
            return;
        };

        if let Some(status) = update.status {
            if status == ItemStatus::Processing {
                item.processing_started_at = Some(Utc::now());
            }
            item.status = status;
        }
        if update.worker.is_some() {
            item.worker = update.worker;
        }
        if let Some(progress) = update.progress {
            item.progress = progress.min(100);
        }
        if let Some(step) = update.step {
            item.step = step;
        }

        self.events.emit(ServiceEvent::QueueItemUpdated {
            filename: filename.to_string(),
            status: item.status.as_str().to_string(),
            progress: item.progress,
            step: item.step.clone(),
            worker: item.worker,
        });
    }

    pub async fn remove_item(&self, filename: &str) -> Option<QueueItem> {
        self.items.write().await.remove(filename)
    }

    pub async fn item(&self, filename: &str) -> Option<QueueItem> {
        self.items.read().await.get(filename).cloned()
    }

    /// Items sorted failed, processing, waiting, completed, then by name
    pub async fn items(&self) -> Vec<QueueItemView> {
        let items = self.items.read().await;
        let mut views: Vec<QueueItemView> = items
            .iter()
            .map(|(filename, item)| QueueItemView {
                filename: filename.clone(),
                status: item.status,
                worker: item.worker,
                progress: item.progress,
                step: item.step.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.status.cmp(&b.status).then_with(|| a.filename.cmp(&b.filename)));
        views
    }

    /// Raw items grouped by status name
    pub async fn items_by_status(&self) -> BTreeMap<&'static str, Vec<(String, QueueItem)>> {
        let items = self.items.read().await;
        let mut grouped: BTreeMap<&'static str, Vec<(String, QueueItem)>> = BTreeMap::new();
        for (filename, item) in items.iter() {
            grouped
                .entry(item.status.as_str())
                .or_default()
                .push((filename.clone(), item.clone()));
        }
        grouped
    }

    /// Items stuck in processing for longer than `max_secs`
    pub async fn stuck_items(&self, max_secs: u64, now: DateTime<Utc>) -> Vec<(String, QueueItem)> {
        let items = self.items.read().await;
        items
            .iter()
            .filter(|(_, item)| {
                item.status == ItemStatus::Processing
                    && item
                        .processing_started_at
                        .map(|started| (now - started).num_seconds() > max_secs as i64)
                        .unwrap_or(false)
            })
            .map(|(name, item)| (name.clone(), item.clone()))
            .collect()
    }

    /// Mark stuck processing items failed; returns their filenames and sessions
    pub async fn fail_stuck_items(&self, max_secs: u64, now: DateTime<Utc>) -> Vec<(String, String)> {
        let stuck = self.stuck_items(max_secs, now).await;
        let mut items = self.items.write().await;
        stuck
            .into_iter()
            .filter_map(|(filename, _)| {
                let item = items.get_mut(&filename)?;
                warn!(file = %filename, "Processing timed out, marking failed");
                item.status = ItemStatus::Failed;
                item.step = "Timeout: processing took too long".to_string();
                item.worker = None;
                Some((filename, item.session_id.clone()))
            })
            .collect()
    }

    /// Drop all tracker entries
    pub async fn clear_items(&self) {
        self.items.write().await.clear();
    }
}
