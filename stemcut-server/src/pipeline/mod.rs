//! Track processing pipeline
//!
//! An upload either declares its version in the title (`Song (Instrumental)`)
//! and is exported as is, or goes through Demucs and yields the Main,
//! Acapella and Instrumental edits. Every exported file is tagged, reported,
//! and the track is registered as pending download.

pub mod demucs;
pub mod ffmpeg;
pub mod tags;

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stemcut_common::config::Settings;
use stemcut_common::title::{
    base_track_name, clean_type_from_title, detect_track_type, edit_filename, extract_bpm_from_filename,
    AudioFormat, TrackType,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::queue::{EditLink, ItemUpdate, JobQueue, QueueJob, SessionRegistry, TrackResult};
use crate::reporting::{prepare_metadata, DeezerClient, ExportedFile, TrackReporter};
use crate::reporting::deezer::DeezerMatch;
use crate::tracking::{DownloadTracker, PendingTrack};
use demucs::{DemucsError, DemucsRunner};
use ffmpeg::{Ffmpeg, FfmpegError};
use tags::{EditTags, SourceTags};

/// Share of an item's progress taken by separation
const SEPARATION_WEIGHT: u32 = 70;

/// History label of a track that went through separation
pub const FULL_ANALYSIS: &str = "Full Analysis";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("uploaded file not found: {}", .0.display())]
    MissingUpload(PathBuf),

    #[error("separation failed: {0}")]
    Demucs(#[from] DemucsError),

    #[error("export failed: {0}")]
    Ffmpeg(#[from] FfmpegError),

    #[error("tagging failed: {0}")]
    Tags(#[from] id3::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Whether another attempt can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineError::MissingUpload(_))
    }
}

/// What one successful run produced
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub track_name: String,
    pub result: TrackResult,
    /// Declared type, or [`FULL_ANALYSIS`]
    pub history_type: String,
}

/// Per-attempt context handed to a processor: the job plus progress reporting
pub struct JobContext {
    pub job: QueueJob,
    pub worker_id: usize,
    pub attempt: u32,
    pub max_attempts: u32,
    queue: Arc<JobQueue>,
    sessions: Arc<SessionRegistry>,
}

impl JobContext {
    pub fn new(
        job: QueueJob,
        worker_id: usize,
        attempt: u32,
        max_attempts: u32,
        queue: Arc<JobQueue>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            job,
            worker_id,
            attempt,
            max_attempts,
            queue,
            sessions,
        }
    }

    pub fn filename(&self) -> &str {
        &self.job.filename
    }

    /// `" (attempt 2/3)"` on retries, empty on a first attempt
    pub fn retry_label(&self) -> String {
        if self.attempt > 1 || self.job.is_retry {
            format!(" (attempt {}/{})", self.attempt, self.max_attempts)
        } else {
            String::new()
        }
    }

    /// Update the queue item and the session status
    pub async fn progress(&self, progress: u8, step: impl Into<String>) {
        let step = step.into();
        self.queue
            .update(&self.job.filename, ItemUpdate::progress(progress, step.clone()))
            .await;
        self.sessions
            .with_status(&self.job.session_id, |s| {
                s.progress = progress;
                s.current_step = step;
            })
            .await;
    }

    pub async fn log(&self, message: impl Into<String>) {
        self.sessions.log(&self.job.session_id, message).await;
    }
}

/// Turns one uploaded file into exported edits
#[async_trait]
pub trait TrackProcessor: Send + Sync {
    async fn process(&self, ctx: &JobContext) -> Result<ProcessOutcome, PipelineError>;
}

/// Production processor: Demucs, ffmpeg, ID3 and reporting
pub struct Pipeline {
    settings: Arc<Settings>,
    demucs: DemucsRunner,
    ffmpeg: Ffmpeg,
    tracker: Arc<DownloadTracker>,
    reporter: Arc<dyn TrackReporter>,
    deezer: Option<DeezerClient>,
}

impl Pipeline {
    pub fn new(settings: Arc<Settings>, tracker: Arc<DownloadTracker>, reporter: Arc<dyn TrackReporter>) -> Self {
        let deezer = if settings.deezer_enabled {
            match DeezerClient::new() {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("Deezer enrichment disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            demucs: DemucsRunner::from_settings(&settings),
            ffmpeg: Ffmpeg::new(settings.ffmpeg_bin.clone()),
            settings,
            tracker,
            reporter,
            deezer,
        }
    }

    async fn read_tags(path: &Path) -> SourceTags {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || SourceTags::read(&path))
            .await
            .unwrap_or_default()
    }

    async fn enrich(&self, ctx: &JobContext, source: &SourceTags) -> Option<DeezerMatch> {
        let deezer = self.deezer.as_ref()?;
        let artist = source.artist.as_deref()?;
        let title = clean_type_from_title(source.title.as_deref().unwrap_or(ctx.filename()));

        match deezer.lookup(artist, &title).await {
            Ok(found) => found,
            Err(e) => {
                ctx.log(format!("Deezer lookup failed for {}: {}", title, e)).await;
                None
            }
        }
    }

    /// Run Demucs and pick the edit sources
    async fn separate(&self, ctx: &JobContext, input: &Path) -> Result<(Vec<(TrackType, PathBuf)>, PathBuf), PipelineError> {
        let device = self.demucs.device().await;
        let label = ctx.retry_label();
        ctx.log(format!("Separating {} on {}{}", ctx.filename(), device.as_str(), label)).await;
        ctx.progress(0, format!("Separating ({}){}", device.as_str(), label)).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let separation = self.demucs.separate(input, move |percent| {
            let _ = tx.send(percent);
        });
        let forward = async {
            let mut last = None;
            while let Some(percent) = rx.recv().await {
                if last == Some(percent) {
                    continue;
                }
                last = Some(percent);
                let weighted = (u32::from(percent) * SEPARATION_WEIGHT / 100) as u8;
                ctx.progress(weighted, format!("Separating {}%{}", percent, label)).await;
            }
        };
        let (stems, ()) = tokio::join!(separation, forward);
        let stems = stems?;

        let mut sources = vec![(TrackType::Main, input.to_path_buf())];
        if self.ffmpeg.has_vocals(&stems.vocals).await {
            sources.push((TrackType::Acapella, stems.vocals.clone()));
        } else {
            ctx.log("No vocals detected, skipping Acapella").await;
        }
        sources.push((TrackType::Instrumental, stems.no_vocals.clone()));

        Ok((sources, stems.dir))
    }

    /// Export one edit as MP3 and WAV, tag and report both
    #[allow(clippy::too_many_arguments)]
    async fn export_edit(
        &self,
        ctx: &JobContext,
        source_audio: &Path,
        out_dir: &Path,
        base: &str,
        track_type: TrackType,
        source: &SourceTags,
        bpm: Option<u32>,
        enrichment: Option<&DeezerMatch>,
    ) -> Result<(EditLink, Vec<String>), PipelineError> {
        let title = format!("{} - {}", base, track_type);
        let mut urls = Vec::with_capacity(2);
        let mut files = Vec::with_capacity(2);

        for format in [AudioFormat::Mp3, AudioFormat::Wav] {
            let filename = edit_filename(base, track_type.as_str(), format);
            let path = out_dir.join(&filename);
            self.ffmpeg.export(source_audio, &path, format).await?;

            let tag_title = title.clone();
            let artist = self.settings.tag_artist.clone();
            let tag_source = source.clone();
            let tag_path = path.clone();
            tokio::task::spawn_blocking(move || {
                EditTags {
                    title: &tag_title,
                    artist: &artist,
                    bpm,
                    source: &tag_source,
                }
                .write(&tag_path, format)
            })
            .await??;

            let exported = ExportedFile {
                track_type,
                format,
                base_name: base.to_string(),
                relative_url: download_url(base, &filename),
            };
            let metadata = prepare_metadata(&exported, source, bpm, &self.settings.base_url(), enrichment);
            ctx.log(format!("URL {}: {}", format.label(), metadata.url)).await;
            if let Err(e) = self.reporter.report(&metadata).await {
                ctx.log(format!(
                    "Report failed ({}): {} ({}) - {}",
                    self.reporter.name(),
                    metadata.title,
                    format.label(),
                    e
                ))
                .await;
            }

            urls.push(exported.relative_url);
            files.push(filename);
        }

        let wav = urls.pop();
        let mp3 = urls.pop().unwrap_or_default();
        Ok((EditLink { name: title, mp3, wav }, files))
    }
}

#[async_trait]
impl TrackProcessor for Pipeline {
    async fn process(&self, ctx: &JobContext) -> Result<ProcessOutcome, PipelineError> {
        let filename = ctx.filename();
        let input = self.settings.uploads_dir().join(filename);
        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return Err(PipelineError::MissingUpload(input));
        }

        let source = Self::read_tags(&input).await;
        let declared = detect_track_type(source.title.as_deref().unwrap_or(filename));
        let base = base_track_name(source.title.as_deref(), filename, declared);
        let bpm = source.bpm.or_else(|| extract_bpm_from_filename(filename));
        if bpm.is_none() {
            debug!(file = %filename, "No BPM in tags or filename");
        }

        let (sources, htdemucs_dir) = match declared {
            Some(track_type) => {
                ctx.log(format!("Type '{}' found in title, skipping separation", track_type)).await;
                ctx.progress(10, format!("Exporting {}", track_type)).await;
                (vec![(track_type, input.clone())], None)
            }
            None => {
                let (sources, dir) = self.separate(ctx, &input).await?;
                (sources, Some(dir))
            }
        };

        let enrichment = self.enrich(ctx, &source).await;
        let out_dir = self.settings.processed_dir().join(&base);
        tokio::fs::create_dir_all(&out_dir).await?;

        ctx.progress(80, format!("Creating edits{}", ctx.retry_label())).await;
        let mut edits = Vec::with_capacity(sources.len());
        let mut files = Vec::with_capacity(sources.len() * 2);
        for (track_type, audio) in &sources {
            let (edit, edit_files) = self
                .export_edit(ctx, audio, &out_dir, &base, *track_type, &source, bpm, enrichment.as_ref())
                .await?;
            edits.push(edit);
            files.extend(edit_files);
        }

        self.tracker
            .register(PendingTrack {
                track_name: base.clone(),
                files_total: files.len(),
                files,
                original_path: Some(input),
                processed_dir: out_dir,
                htdemucs_dir,
                created_at: Utc::now(),
            })
            .await;

        ctx.progress(100, "Done").await;
        Ok(ProcessOutcome {
            track_name: base.clone(),
            result: TrackResult { original: base, edits },
            history_type: declared
                .map(|t| t.to_string())
                .unwrap_or_else(|| FULL_ANALYSIS.to_string()),
        })
    }
}

/// Relative download link of a processed file; the `/` separator stays unencoded
pub fn download_url(track_name: &str, filename: &str) -> String {
    format!(
        "/download_file?path={}/{}",
        urlencoding::encode(track_name),
        urlencoding::encode(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemcut_common::events::EventBus;

    #[test]
    fn test_download_url_keeps_separator() {
        assert_eq!(
            download_url("Hot Spot", "Hot Spot - Main.mp3"),
            "/download_file?path=Hot%20Spot/Hot%20Spot%20-%20Main.mp3"
        );
        assert_eq!(download_url("A&B", "x.wav"), "/download_file?path=A%26B/x.wav");
    }

    #[test]
    fn test_missing_upload_is_not_retryable() {
        assert!(!PipelineError::MissingUpload(PathBuf::from("/x")).is_retryable());
        assert!(PipelineError::Demucs(DemucsError::Timeout(600)).is_retryable());
    }

    #[tokio::test]
    async fn test_context_progress_updates_queue_and_session() {
        let bus = EventBus::new(16);
        let queue = Arc::new(JobQueue::new(bus.clone()));
        let sessions = Arc::new(SessionRegistry::new(bus));
        let job = QueueJob::new("a.mp3", "s1");
        queue.enqueue(job.clone()).await.unwrap();

        let ctx = JobContext::new(job, 1, 2, 3, queue.clone(), sessions.clone());
        assert_eq!(ctx.retry_label(), " (attempt 2/3)");
        ctx.progress(35, "Separating 50%").await;

        assert_eq!(queue.item("a.mp3").await.unwrap().progress, 35);
        let status = sessions.status("s1").await;
        assert_eq!(status.progress, 35);
        assert_eq!(status.current_step, "Separating 50%");
    }

    #[tokio::test]
    async fn test_process_missing_upload() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings::with_root(dir.path()));
        settings.ensure_folders().unwrap();

        struct NullReporter;
        #[async_trait]
        impl TrackReporter for NullReporter {
            fn name(&self) -> &'static str {
                "null"
            }
            async fn report(&self, _: &crate::reporting::TrackMetadata) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let tracker = Arc::new(DownloadTracker::new((&*settings).into()));
        let pipeline = Pipeline::new(settings, tracker, Arc::new(NullReporter));
        let bus = EventBus::new(16);
        let ctx = JobContext::new(
            QueueJob::new("missing.mp3", "s"),
            1,
            1,
            3,
            Arc::new(JobQueue::new(bus.clone())),
            Arc::new(SessionRegistry::new(bus)),
        );

        match pipeline.process(&ctx).await {
            Err(PipelineError::MissingUpload(path)) => assert!(path.ends_with("uploads/missing.mp3")),
            other => panic!("unexpected result {:?}", other.map(|o| o.track_name)),
        }
    }
}
