//! Pending-download bookkeeping
//!
//! A processed track stays on disk as *pending* until its consumer confirms
//! the download. Confirmation either deletes it at once or moves it to the
//! *scheduled* set, from which the sweep deletes it after the configured delay.
//! In sequential mode each output file is also tracked individually so that a
//! track can be removed as soon as every file was fetched.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use stemcut_common::config::Settings;
use stemcut_common::time::{age_hours, format_local};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Maximum number of names returned by [`DownloadTracker::similar`]
pub const SIMILAR_LIMIT: usize = 5;

/// A processed track awaiting download confirmation
#[derive(Debug, Clone, Serialize)]
pub struct PendingTrack {
    pub track_name: String,
    pub files_total: usize,
    pub files: Vec<String>,
    pub original_path: Option<PathBuf>,
    pub processed_dir: PathBuf,
    pub htdemucs_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// A confirmed track waiting for its deletion time
#[derive(Debug, Clone)]
pub struct ScheduledDeletion {
    pub track_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub delete_after: DateTime<Utc>,
    pub info: PendingTrack,
}

/// Per-file download state of one track
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub files: BTreeMap<String, bool>,
    pub all_downloaded: bool,
    pub created_at: DateTime<Utc>,
}

impl DownloadStatus {
    pub fn downloaded_count(&self) -> usize {
        self.files.values().filter(|done| **done).count()
    }

    pub fn pending_files(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Entry of the pending list as exposed over HTTP
#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub track_name: String,
    pub files_total: usize,
    pub created_at: String,
    pub age_hours: f64,
    pub processed_dir: String,
}

/// Entry of the scheduled list as exposed over HTTP
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEntry {
    pub track_name: String,
    pub scheduled_at: String,
    pub delete_after: String,
    pub seconds_remaining: i64,
    pub minutes_remaining: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Warning,
    Critical,
}

/// Pending-count warning
#[derive(Debug, Clone, Serialize)]
pub struct PendingWarning {
    pub warning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<WarningLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
}

impl PendingWarning {
    pub fn is_critical(&self) -> bool {
        self.level == Some(WarningLevel::Critical)
    }
}

/// Result of [`DownloadTracker::schedule_deletion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { delete_after: DateTime<Utc> },
    AlreadyScheduled { delete_after: DateTime<Utc> },
    NotFound,
}

impl ScheduleOutcome {
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, ScheduleOutcome::NotFound)
    }
}

/// Outcome of marking one file downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMark {
    pub all_downloaded: bool,
    pub remaining: usize,
}

/// Limits the tracker enforces
#[derive(Debug, Clone)]
pub struct TrackerLimits {
    pub max_pending: usize,
    pub warning_threshold: usize,
    pub deletion_delay: Duration,
    pub sequential: bool,
}

impl From<&Settings> for TrackerLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            max_pending: settings.max_pending_tracks,
            warning_threshold: settings.pending_warning_threshold,
            deletion_delay: Duration::minutes(settings.deletion_delay_minutes),
            sequential: settings.sequential_mode,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    pending: HashMap<String, PendingTrack>,
    scheduled: HashMap<String, ScheduledDeletion>,
    downloads: HashMap<String, DownloadStatus>,
}

/// In-memory store of pending, scheduled and per-file download state
#[derive(Debug)]
pub struct DownloadTracker {
    limits: TrackerLimits,
    inner: RwLock<TrackerInner>,
}

impl DownloadTracker {
    pub fn new(limits: TrackerLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(TrackerInner::default()),
        }
    }

    pub fn limits(&self) -> &TrackerLimits {
        &self.limits
    }

    /// Register a processed track; replaces any previous entry of the same name
    pub async fn register(&self, track: PendingTrack) {
        let mut inner = self.inner.write().await;
        let name = track.track_name.clone();

        inner.scheduled.remove(&name);
        if self.limits.sequential && !track.files.is_empty() {
            let status = DownloadStatus {
                files: track.files.iter().map(|f| (f.clone(), false)).collect(),
                all_downloaded: false,
                created_at: track.created_at,
            };
            inner.downloads.insert(name.clone(), status);
        }
        inner.pending.insert(name.clone(), track);

        info!(track = %name, pending = inner.pending.len(), "Registered pending download");
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    /// Whether the name is pending or scheduled
    pub async fn is_known(&self, track_name: &str) -> bool {
        let inner = self.inner.read().await;
        inner.pending.contains_key(track_name) || inner.scheduled.contains_key(track_name)
    }

    /// Pending tracks, oldest first
    pub async fn pending_list(&self, now: DateTime<Utc>) -> Vec<PendingEntry> {
        let inner = self.inner.read().await;
        let mut tracks: Vec<&PendingTrack> = inner.pending.values().collect();
        tracks.sort_by_key(|t| t.created_at);

        tracks
            .into_iter()
            .map(|t| PendingEntry {
                track_name: t.track_name.clone(),
                files_total: t.files_total,
                created_at: format_local(t.created_at),
                age_hours: age_hours(t.created_at, now),
                processed_dir: t.processed_dir.display().to_string(),
            })
            .collect()
    }

    /// Warning level for the current pending count
    pub async fn warning(&self) -> PendingWarning {
        let count = self.pending_count().await;
        warning_for(count, &self.limits)
    }

    /// Move a pending track to the scheduled set
    pub async fn schedule_deletion(&self, track_name: &str, now: DateTime<Utc>) -> ScheduleOutcome {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.scheduled.get(track_name) {
            return ScheduleOutcome::AlreadyScheduled {
                delete_after: existing.delete_after,
            };
        }

        let Some(info) = inner.pending.remove(track_name) else {
            debug!(track = %track_name, "Track not found in pending downloads");
            return ScheduleOutcome::NotFound;
        };

        let delete_after = now + self.limits.deletion_delay;
        inner.scheduled.insert(
            track_name.to_string(),
            ScheduledDeletion {
                track_name: track_name.to_string(),
                scheduled_at: now,
                delete_after,
                info,
            },
        );

        info!(
            track = %track_name,
            delete_after = %format_local(delete_after),
            "Scheduled for deletion"
        );
        ScheduleOutcome::Scheduled { delete_after }
    }

    /// Forget a track entirely; returns the file locations to delete
    pub async fn take(&self, track_name: &str) -> Option<PendingTrack> {
        let mut inner = self.inner.write().await;
        inner.downloads.remove(track_name);
        let pending = inner.pending.remove(track_name);
        let scheduled = inner.scheduled.remove(track_name).map(|s| s.info);
        pending.or(scheduled)
    }

    /// Remove and return every scheduled entry whose delay has passed
    pub async fn take_expired(&self, now: DateTime<Utc>) -> Vec<ScheduledDeletion> {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .scheduled
            .values()
            .filter(|s| s.delete_after <= now)
            .map(|s| s.track_name.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|name| {
                inner.downloads.remove(&name);
                inner.scheduled.remove(&name)
            })
            .collect()
    }

    /// Scheduled deletions, soonest first
    pub async fn scheduled_list(&self, now: DateTime<Utc>) -> Vec<ScheduledEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&ScheduledDeletion> = inner.scheduled.values().collect();
        entries.sort_by_key(|s| s.delete_after);

        entries
            .into_iter()
            .map(|s| {
                let remaining = (s.delete_after - now).num_seconds().max(0);
                ScheduledEntry {
                    track_name: s.track_name.clone(),
                    scheduled_at: format_local(s.scheduled_at),
                    delete_after: format_local(s.delete_after),
                    seconds_remaining: remaining,
                    minutes_remaining: (remaining as f64 / 60.0 * 10.0).round() / 10.0,
                }
            })
            .collect()
    }

    pub async fn scheduled_count(&self) -> usize {
        self.inner.read().await.scheduled.len()
    }

    /// Whether the track has per-file download tracking
    pub async fn is_sequentially_tracked(&self, track_name: &str) -> bool {
        self.inner.read().await.downloads.contains_key(track_name)
    }

    pub async fn sequential_count(&self) -> usize {
        self.inner.read().await.downloads.len()
    }

    /// Mark one file downloaded
    ///
    /// The file matches a tracked name when either contains the other or their
    /// basenames are equal. Returns `None` if the track or file is unknown.
    pub async fn mark_file_downloaded(&self, track_name: &str, filename: &str) -> Option<FileMark> {
        let mut inner = self.inner.write().await;
        let status = inner.downloads.get_mut(track_name)?;

        let wanted = basename(filename);
        let matched = status
            .files
            .keys()
            .find(|f| filename.contains(f.as_str()) || f.contains(filename) || basename(f) == wanted)
            .cloned();

        let Some(key) = matched else {
            warn!(track = %track_name, file = %filename, "File not tracked for this track");
            return None;
        };

        status.files.insert(key, true);
        status.all_downloaded = status.files.values().all(|done| *done);
        let remaining = status.files.len() - status.downloaded_count();

        Some(FileMark {
            all_downloaded: status.all_downloaded,
            remaining,
        })
    }

    /// Mark every file of a track downloaded; returns false if untracked
    pub async fn mark_all_downloaded(&self, track_name: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.downloads.get_mut(track_name) {
            Some(status) => {
                status.files.values_mut().for_each(|done| *done = true);
                status.all_downloaded = true;
                true
            }
            None => false,
        }
    }

    pub async fn download_status(&self, track_name: &str) -> Option<DownloadStatus> {
        self.inner.read().await.downloads.get(track_name).cloned()
    }

    pub async fn all_download_statuses(&self) -> BTreeMap<String, DownloadStatus> {
        let inner = self.inner.read().await;
        inner
            .downloads
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Up to [`SIMILAR_LIMIT`] pending or sequentially tracked names related to
    /// `query` (case-insensitive containment)
    pub async fn similar(&self, query: &str) -> Vec<String> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().await;
        let names: BTreeSet<&String> = inner
            .pending
            .keys()
            .chain(inner.downloads.keys())
            .filter(|name| {
                let lower = name.to_lowercase();
                lower.contains(&needle) || needle.contains(&lower)
            })
            .collect();
        names.into_iter().take(SIMILAR_LIMIT).cloned().collect()
    }

    /// Names of pending or scheduled tracks created before `cutoff`
    pub async fn created_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .pending
            .values()
            .chain(inner.scheduled.values().map(|s| &s.info))
            .filter(|t| t.created_at < cutoff)
            .map(|t| t.track_name.clone())
            .collect()
    }

    /// Drop all state
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.pending.len() + inner.scheduled.len();
        inner.pending.clear();
        inner.scheduled.clear();
        inner.downloads.clear();
        count
    }
}

/// Warning object for a pending count
pub fn warning_for(count: usize, limits: &TrackerLimits) -> PendingWarning {
    if count >= limits.max_pending {
        PendingWarning {
            warning: true,
            level: Some(WarningLevel::Critical),
            message: Some(format!(
                "CRITICAL: {} tracks pending download (max: {}). Download existing tracks before adding new ones.",
                count, limits.max_pending
            )),
            count,
            max: Some(limits.max_pending),
            threshold: None,
        }
    } else if count >= limits.warning_threshold {
        PendingWarning {
            warning: true,
            level: Some(WarningLevel::Warning),
            message: Some(format!(
                "{} tracks pending download. Consider downloading existing tracks.",
                count
            )),
            count,
            max: None,
            threshold: Some(limits.warning_threshold),
        }
    } else {
        PendingWarning {
            warning: false,
            level: None,
            message: None,
            count,
            max: None,
            threshold: None,
        }
    }
}

/// Delete the processed folder, original upload and Demucs output of a track
///
/// Missing paths are ignored. Returns the number of paths removed.
pub async fn remove_track_files(track: &PendingTrack) -> usize {
    let mut removed = 0;

    if remove_path(&track.processed_dir).await {
        removed += 1;
    }
    if let Some(original) = &track.original_path {
        if remove_path(original).await {
            removed += 1;
        }
    }
    if let Some(htdemucs) = &track.htdemucs_dir {
        if remove_path(htdemucs).await {
            removed += 1;
        }
    }

    debug!(track = %track.track_name, removed, "Removed track files");
    removed
}

/// Remove a file or directory tree; false when it did not exist or removal failed
pub async fn remove_path(path: &Path) -> bool {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return false,
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), "Failed to remove: {}", e);
            false
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
