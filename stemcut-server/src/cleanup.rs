//! Cleanup services
//!
//! - Scheduled-deletion sweep (every 30 s), which also fails stuck queue items
//! - Periodic age-based cleanup of processed, Demucs and upload files
//! - Disk monitor deleting the oldest tracks above the usage threshold
//! - Full reset and oldest-N deletion for the admin endpoints

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use stemcut_common::events::ServiceEvent;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::GLOBAL_SESSION;
use crate::tracking::{remove_path, remove_track_files, PendingTrack};
use crate::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Back-off when the disk is full but nothing is left to delete
const DISK_COOLDOWN: Duration = Duration::from_secs(600);

/// Upper bound accepted by `/cleanup_oldest`
pub const MAX_OLDEST_COUNT: usize = 100_000;

/// Disk cleanup state shared with `/batch_status`
#[derive(Debug, Default)]
pub struct DiskState {
    in_progress: AtomicBool,
}

impl DiskState {
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

/// Outcome of a full reset
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    pub items_deleted: usize,
    pub bytes_freed: u64,
    pub tracks_forgotten: usize,
}

/// Spawn the sweep, periodic cleanup and disk monitor loops
pub fn spawn_background_services(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let sweep_state = state.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_expired(&sweep_state).await;
            fail_stuck_items(&sweep_state).await;
        }
    }));

    let periodic_state = state.clone();
    handles.push(tokio::spawn(async move {
        let period = Duration::from_secs(periodic_state.settings.cleanup_interval_minutes.max(1) * 60);
        let max_age = Duration::from_secs(periodic_state.settings.max_file_age_hours * 3600);
        let mut interval = tokio::time::interval(period);
        // First tick fires immediately; cleanup waits one full period
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = cleanup_old_files(&periodic_state, max_age).await;
            if removed > 0 {
                info!(removed, "Periodic cleanup");
            }
        }
    }));

    if state.settings.disk_cleanup_enabled {
        let disk_state = state.clone();
        handles.push(tokio::spawn(async move { disk_monitor(disk_state).await }));
    }

    info!(services = handles.len(), "Background cleanup services started");
    handles
}

/// Delete every scheduled track whose delay has passed
pub async fn sweep_expired(state: &AppState) -> usize {
    let expired = state.tracker.take_expired(Utc::now()).await;
    let count = expired.len();
    for entry in expired {
        delete_track_files(state, &entry.info, "scheduled deletion").await;
    }
    if count > 0 {
        info!(count, "Scheduled deletions executed");
    }
    count
}

/// Mark items processing longer than `MAX_PROCESSING_TIME` as failed
pub async fn fail_stuck_items(state: &AppState) -> usize {
    let stuck = state
        .queue
        .fail_stuck_items(state.settings.max_processing_time_secs, Utc::now())
        .await;
    for (filename, session_id) in &stuck {
        let path = state.settings.uploads_dir().join(filename);
        state
            .sessions
            .add_failed(
                session_id,
                filename,
                Some(path.display().to_string()),
                "Timeout: processing took too long",
            )
            .await;
    }
    stuck.len()
}

/// Forget a track and delete its files now
pub async fn delete_now(state: &AppState, track_name: &str, reason: &str) -> Option<PendingTrack> {
    let track = state.tracker.take(track_name).await?;
    delete_track_files(state, &track, reason).await;
    Some(track)
}

async fn delete_track_files(state: &AppState, track: &PendingTrack, reason: &str) {
    let removed = remove_track_files(track).await;
    state
        .sessions
        .log(
            GLOBAL_SESSION,
            format!("Deleted '{}' ({}, {} path(s))", track.track_name, reason, removed),
        )
        .await;
    state.event_bus.emit(ServiceEvent::TrackDeleted {
        track_name: track.track_name.clone(),
        reason: reason.to_string(),
        timestamp: Utc::now(),
    });
}

/// Delete entries older than `max_age` under processed/, output/htdemucs/ and uploads/
pub async fn cleanup_old_files(state: &AppState, max_age: Duration) -> usize {
    let settings = &state.settings;
    let mut removed = 0;

    let processed = remove_older_than(&settings.processed_dir(), max_age).await;
    for name in &processed {
        state.tracker.take(name).await;
    }
    removed += processed.len();
    removed += remove_older_than(&settings.htdemucs_dir(), max_age).await.len();
    removed += remove_older_than(&settings.uploads_dir(), max_age).await.len();

    // Tracker entries whose folders were removed by hand or by age
    let cutoff = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
    for name in state.tracker.created_before(cutoff).await {
        if let Some(track) = state.tracker.take(&name).await {
            remove_track_files(&track).await;
            removed += 1;
        }
    }

    if removed > 0 {
        state
            .sessions
            .log(GLOBAL_SESSION, format!("Periodic cleanup: {} old item(s) deleted", removed))
            .await;
    }
    removed
}

async fn remove_older_than(dir: &Path, max_age: Duration) -> Vec<String> {
    let now = SystemTime::now();
    let mut removed = Vec::new();
    for (name, path, modified) in list_entries(dir).await {
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age && remove_path(&path).await {
            removed.push(name);
        }
    }
    removed
}

/// Entries of a directory with their modification times
async fn list_entries(dir: &Path) -> Vec<(String, PathBuf, SystemTime)> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) => {
            debug!(dir = %dir.display(), "Cannot list directory: {}", e);
            return entries;
        }
    };
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((entry.file_name().to_string_lossy().into_owned(), entry.path(), modified));
    }
    entries
}

/// Processed track folders, oldest first
pub async fn oldest_tracks(processed_dir: &Path, limit: usize) -> Vec<(String, PathBuf)> {
    let mut tracks: Vec<(String, PathBuf, SystemTime)> = Vec::new();
    for (name, path, modified) in list_entries(processed_dir).await {
        if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            tracks.push((name, path, modified));
        }
    }
    tracks.sort_by_key(|(_, _, modified)| *modified);
    tracks
        .into_iter()
        .take(limit)
        .map(|(name, path, _)| (name, path))
        .collect()
}

/// Delete the `count` oldest processed tracks with their Demucs output
///
/// Returns 0 without deleting when another disk cleanup is running.
pub async fn delete_oldest_tracks(state: &AppState, count: usize) -> usize {
    if state.disk.in_progress.swap(true, Ordering::SeqCst) {
        warn!("Disk cleanup already in progress, skipping");
        return 0;
    }

    let tracks = oldest_tracks(&state.settings.processed_dir(), count).await;
    let htdemucs = state.settings.htdemucs_dir();
    let mut deleted = 0;
    for (name, path) in &tracks {
        if remove_path(path).await {
            deleted += 1;
        }
        remove_path(&htdemucs.join(name)).await;
        state.tracker.take(name).await;
        if deleted > 0 && deleted % 1000 == 0 {
            info!(deleted, total = tracks.len(), "Disk cleanup progress");
        }
    }

    state.disk.in_progress.store(false, Ordering::SeqCst);
    if deleted > 0 {
        state
            .sessions
            .log(GLOBAL_SESSION, format!("Disk cleanup: {} oldest track(s) deleted", deleted))
            .await;
    }
    deleted
}

/// Empty uploads/, output/ and processed/; returns (items, bytes)
pub async fn cleanup_all_folders(state: &AppState) -> (usize, u64) {
    let settings = &state.settings;
    let mut items = 0;
    let mut bytes = 0;
    for dir in [settings.uploads_dir(), settings.output_dir(), settings.processed_dir()] {
        for (_, path, _) in list_entries(&dir).await {
            let size = path_size(&path).await;
            if remove_path(&path).await {
                items += 1;
                bytes += size;
            }
        }
    }
    if let Err(e) = settings.ensure_folders() {
        error!("Failed to recreate folders after cleanup: {}", e);
    }
    (items, bytes)
}

/// Delete all files and forget all tracker and queue state
pub async fn full_reset(state: &AppState) -> ResetReport {
    let (items_deleted, bytes_freed) = cleanup_all_folders(state).await;
    let tracks_forgotten = state.tracker.clear().await;
    state.queue.clear_items().await;
    state.sessions.reset_all().await;

    let report = ResetReport {
        items_deleted,
        bytes_freed,
        tracks_forgotten,
    };
    state
        .sessions
        .log(
            GLOBAL_SESSION,
            format!(
                "Full cleanup: {} item(s) deleted, {:.1} MB freed",
                report.items_deleted,
                report.bytes_freed as f64 / (1024.0 * 1024.0)
            ),
        )
        .await;
    report
}

/// Total size of a file or directory tree
async fn path_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(meta) = tokio::fs::symlink_metadata(&current).await else {
            continue;
        };
        if meta.is_dir() {
            if let Ok(mut read_dir) = tokio::fs::read_dir(&current).await {
                while let Ok(Some(entry)) = read_dir.next_entry().await {
                    stack.push(entry.path());
                }
            }
        } else {
            total += meta.len();
        }
    }
    total
}

async fn disk_monitor(state: AppState) {
    let threshold = state.settings.disk_threshold_percent;
    let root = state.settings.root_folder.clone();
    let mut cooldown_until: Option<tokio::time::Instant> = None;
    let mut interval = tokio::time::interval(DISK_CHECK_INTERVAL);

    loop {
        interval.tick().await;
        let Some(usage) = disk_usage_percent(&root).await else {
            continue;
        };
        if usage < threshold {
            cooldown_until = None;
            continue;
        }
        if cooldown_until.is_some_and(|until| tokio::time::Instant::now() < until) {
            continue;
        }

        warn!(usage, threshold, "Disk usage above threshold, deleting oldest tracks");
        state
            .sessions
            .log(
                GLOBAL_SESSION,
                format!("Disk usage {:.1}% >= {:.1}%, starting cleanup", usage, threshold),
            )
            .await;

        let deleted = delete_oldest_tracks(&state, state.settings.tracks_to_delete).await;
        if deleted > 0 {
            continue;
        }

        let (items, bytes) = cleanup_all_folders(&state).await;
        if items > 0 {
            state
                .sessions
                .log(
                    GLOBAL_SESSION,
                    format!(
                        "Deep cleanup: {} leftover item(s) removed, {:.2} GB freed",
                        items,
                        bytes as f64 / (1024.0 * 1024.0 * 1024.0)
                    ),
                )
                .await;
        } else {
            cooldown_until = Some(tokio::time::Instant::now() + DISK_COOLDOWN);
            state
                .sessions
                .log(
                    GLOBAL_SESSION,
                    format!(
                        "Disk at {:.1}% but nothing left to clean, pausing checks for 10 min",
                        usage
                    ),
                )
                .await;
        }
    }
}

/// Size and usage of one filesystem, in KiB
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiskSpace {
    pub total_kib: u64,
    pub used_kib: u64,
    pub available_kib: u64,
    pub used_percent: f64,
}

/// Space on the filesystem holding `path`, from `df -Pk`
pub async fn disk_space(path: &Path) -> Option<DiskSpace> {
    let output = Command::new("df").arg("-Pk").arg(path).output().await.ok()?;
    if !output.status.success() {
        debug!(path = %path.display(), "df failed");
        return None;
    }
    parse_df_space(&String::from_utf8_lossy(&output.stdout))
}

/// Usage of the filesystem holding `path`
pub async fn disk_usage_percent(path: &Path) -> Option<f64> {
    disk_space(path).await.map(|space| space.used_percent)
}

/// First filesystem row of POSIX `df -Pk` output
pub fn parse_df_space(output: &str) -> Option<DiskSpace> {
    let row = output.lines().nth(1)?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    // Filesystem, blocks, used, available, capacity, mount point
    if fields.len() < 6 {
        return None;
    }
    let used_kib: u64 = fields[2].parse().ok()?;
    let available_kib: u64 = fields[3].parse().ok()?;
    let total = used_kib + available_kib;
    if total == 0 {
        return None;
    }
    Some(DiskSpace {
        total_kib: fields[1].parse().unwrap_or(total),
        used_kib,
        available_kib,
        used_percent: (used_kib as f64 / total as f64 * 1000.0).round() / 10.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df_usage() {
        let used_percent = |output: &str| parse_df_space(output).map(|space| space.used_percent);
        let output = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/sda1        102400000  81920000  20480000      80% /";
        assert_eq!(used_percent(output), Some(80.0));

        let odd = "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/x 3 1 2 34% /data";
        assert_eq!(used_percent(odd), Some(33.3));

        assert_eq!(used_percent("Filesystem"), None);
        assert_eq!(used_percent("header\n/dev/x 0 0 0 0% /"), None);
    }

    #[test]
    fn test_parse_df_space() {
        let output = "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 1000 600 300 67% /";
        let space = parse_df_space(output).unwrap();
        assert_eq!(space.total_kib, 1000);
        assert_eq!(space.used_kib, 600);
        assert_eq!(space.available_kib, 300);
        assert_eq!(space.used_percent, 66.7);
    }

    #[tokio::test]
    async fn test_oldest_tracks_sorted_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["first", "second", "third"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let tracks = oldest_tracks(dir.path(), 2).await;
        let names: Vec<&str> = tracks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_path_size_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("nested/b.bin"), vec![0u8; 5]).unwrap();
        assert_eq!(path_size(dir.path()).await, 15);
    }
}
