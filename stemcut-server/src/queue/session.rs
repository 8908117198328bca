//! Per-session job status and the rolling log buffer

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use stemcut_common::events::{EventBus, ServiceEvent};
use stemcut_common::time::clock;
use tokio::sync::RwLock;
use tracing::info;

use super::GLOBAL_SESSION;

/// Lines kept per session and in the global buffer
pub const LOG_CAPACITY: usize = 1000;

/// Results kept per session
const RESULTS_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Processing,
    Completed,
    Error,
}

/// Download links of one edit
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EditLink {
    pub name: String,
    pub mp3: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wav: Option<String>,
}

/// All edits produced from one upload
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackResult {
    pub original: String,
    pub edits: Vec<EditLink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub filename: String,
    pub filepath: Option<String>,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Status of one client session
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub session_id: String,
    pub state: JobState,
    pub progress: u8,
    pub total_files: usize,
    pub current_file_idx: usize,
    pub current_filename: String,
    pub current_step: String,
    pub results: Vec<TrackResult>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub failed_files: Vec<FailedFile>,
    pub retry_count: HashMap<String, u32>,
}

impl JobStatus {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: JobState::Idle,
            progress: 0,
            total_files: 0,
            current_file_idx: 0,
            current_filename: String::new(),
            current_step: String::new(),
            results: Vec::new(),
            error: None,
            logs: Vec::new(),
            failed_files: Vec::new(),
            retry_count: HashMap::new(),
        }
    }

    fn push_log(&mut self, line: String) {
        self.logs.push(line);
        if self.logs.len() > LOG_CAPACITY {
            let excess = self.logs.len() - LOG_CAPACITY;
            self.logs.drain(..excess);
        }
    }
}

/// Global log lines with absolute sequence numbers, so pollers can ask for
/// everything since the last index they saw
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    first_seq: usize,
}

impl LogBuffer {
    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        if self.lines.len() > LOG_CAPACITY {
            self.lines.pop_front();
            self.first_seq += 1;
        }
    }

    /// Sequence number the next line will get
    pub fn total(&self) -> usize {
        self.first_seq + self.lines.len()
    }

    /// Lines with sequence >= `since` still in the buffer
    pub fn since(&self, since: usize) -> Vec<String> {
        let skip = since.saturating_sub(self.first_seq);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// All session statuses plus the global log
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, JobStatus>>,
    logs: RwLock<LogBuffer>,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            logs: RwLock::new(LogBuffer::default()),
            events,
        }
    }

    /// Snapshot of a session, created on first access
    pub async fn status(&self, session_id: &str) -> JobStatus {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| JobStatus::new(session_id))
            .clone()
    }

    /// Mutate a session in place
    pub async fn with_status<R>(&self, session_id: &str, f: impl FnOnce(&mut JobStatus) -> R) -> R {
        let mut sessions = self.sessions.write().await;
        let status = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| JobStatus::new(session_id));
        f(status)
    }

    /// Append an operator-facing log line to the session and the global buffer
    pub async fn log(&self, session_id: &str, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();
        let line = format!("[{}] {}", clock(now), message);
        info!(session = %session_id, "{}", message);

        if session_id != GLOBAL_SESSION {
            self.with_status(session_id, |s| s.push_log(line.clone())).await;
        }
        self.with_status(GLOBAL_SESSION, |s| s.push_log(line.clone())).await;
        self.logs.write().await.push(line);

        self.events.emit(ServiceEvent::LogLine {
            session_id: Some(session_id.to_string()),
            message,
            timestamp: now,
        });
    }

    /// Global log lines since `since`, plus the current total
    pub async fn logs_since(&self, since: usize) -> (Vec<String>, usize) {
        let logs = self.logs.read().await;
        (logs.since(since), logs.total())
    }

    /// Record a failure; an existing entry for the same file is refreshed
    pub async fn add_failed(&self, session_id: &str, filename: &str, filepath: Option<String>, error: &str) {
        self.with_status(session_id, |s| {
            let retry_count = s.retry_count.get(filename).copied().unwrap_or(0);
            match s.failed_files.iter_mut().find(|f| f.filename == filename) {
                Some(existing) => {
                    existing.error = error.to_string();
                    existing.retry_count = retry_count;
                    existing.failed_at = Utc::now();
                }
                None => s.failed_files.push(FailedFile {
                    filename: filename.to_string(),
                    filepath,
                    error: error.to_string(),
                    retry_count,
                    failed_at: Utc::now(),
                }),
            }
        })
        .await;
        self.log(session_id, format!("Failed: {} - {}", filename, error)).await;
    }

    pub async fn remove_failed(&self, session_id: &str, filename: &str) {
        self.with_status(session_id, |s| s.failed_files.retain(|f| f.filename != filename))
            .await;
    }

    /// Take every failed file of a session, clearing the list
    pub async fn take_failed(&self, session_id: &str) -> Vec<FailedFile> {
        self.with_status(session_id, |s| std::mem::take(&mut s.failed_files))
            .await
    }

    pub async fn push_result(&self, session_id: &str, result: TrackResult) {
        self.with_status(session_id, |s| {
            s.results.push(result);
            if s.results.len() > RESULTS_CAPACITY {
                let excess = s.results.len() - RESULTS_CAPACITY;
                s.results.drain(..excess);
            }
        })
        .await;
    }

    /// Increment and return the attempt counter of a file
    pub async fn bump_retry(&self, session_id: &str, filename: &str) -> u32 {
        self.with_status(session_id, |s| {
            let count = s.retry_count.entry(filename.to_string()).or_insert(0);
            *count += 1;
            *count
        })
        .await
    }

    /// Drop the results and log lines of one session, keeping files on disk
    pub async fn clear_results(&self, session_id: &str) {
        self.with_status(session_id, |s| {
            s.results.clear();
            s.logs.clear();
        })
        .await;
    }

    /// Reset every session's results and failures (full cleanup)
    pub async fn reset_all(&self) {
        let mut sessions = self.sessions.write().await;
        for status in sessions.values_mut() {
            status.results.clear();
            status.failed_files.clear();
            status.retry_count.clear();
            status.state = JobState::Idle;
            status.progress = 0;
            status.current_step.clear();
            status.current_filename.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_sequence_survives_eviction() {
        let mut buffer = LogBuffer::default();
        for i in 0..(LOG_CAPACITY + 5) {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.total(), LOG_CAPACITY + 5);

        let tail = buffer.since(LOG_CAPACITY + 3);
        assert_eq!(tail, vec![format!("line {}", LOG_CAPACITY + 3), format!("line {}", LOG_CAPACITY + 4)]);

        // Evicted indexes return what is still buffered
        assert_eq!(buffer.since(0).len(), LOG_CAPACITY);
        assert!(buffer.since(buffer.total()).is_empty());
    }

    #[tokio::test]
    async fn test_log_reaches_session_and_global() {
        let registry = SessionRegistry::new(EventBus::new(16));
        registry.log("abc", "hello").await;

        let status = registry.status("abc").await;
        assert_eq!(status.logs.len(), 1);
        assert!(status.logs[0].ends_with("hello"));

        let (lines, total) = registry.logs_since(0).await;
        assert_eq!(total, 1);
        assert_eq!(lines.len(), 1);
        assert_eq!(registry.status(GLOBAL_SESSION).await.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_files_deduplicated() {
        let registry = SessionRegistry::new(EventBus::new(16));
        registry.bump_retry("s", "a.mp3").await;
        registry.add_failed("s", "a.mp3", None, "first").await;
        registry.bump_retry("s", "a.mp3").await;
        registry.add_failed("s", "a.mp3", None, "second").await;

        let status = registry.status("s").await;
        assert_eq!(status.failed_files.len(), 1);
        assert_eq!(status.failed_files[0].error, "second");
        assert_eq!(status.failed_files[0].retry_count, 2);

        let taken = registry.take_failed("s").await;
        assert_eq!(taken.len(), 1);
        assert!(registry.status("s").await.failed_files.is_empty());
    }
}
