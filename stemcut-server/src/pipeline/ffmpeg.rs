//! ffmpeg runner: edit export and vocal presence detection

use std::path::Path;
use std::process::Stdio;
use stemcut_common::title::AudioFormat;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Mean volume (dBFS) under which a vocals stem counts as silent
pub const VOCALS_THRESHOLD_DB: f64 = -35.0;

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("failed to start ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ffmpeg exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("no mean_volume in ffmpeg output")]
    NoVolume,
}

pub struct Ffmpeg {
    bin: String,
}

impl Ffmpeg {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Encode `input` to `output`: MP3 at 320 kbit/s or 16-bit PCM WAV
    ///
    /// Source tags are dropped; the caller writes its own.
    pub async fn export(&self, input: &Path, output: &Path, format: AudioFormat) -> Result<(), FfmpegError> {
        let codec: &[&str] = match format {
            AudioFormat::Mp3 => &["-codec:a", "libmp3lame", "-b:a", "320k"],
            AudioFormat::Wav => &["-codec:a", "pcm_s16le"],
        };

        let out = Command::new(&self.bin)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-vn", "-map_metadata", "-1"])
            .args(codec)
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !out.status.success() {
            return Err(FfmpegError::Failed {
                code: out.status.code(),
                stderr: tail(&String::from_utf8_lossy(&out.stderr)),
            });
        }
        debug!(output = %output.display(), format = format.label(), "Exported");
        Ok(())
    }

    /// Mean volume of a file in dBFS (`volumedetect` filter)
    pub async fn mean_volume(&self, input: &Path) -> Result<f64, FfmpegError> {
        let out = Command::new(&self.bin)
            .args(["-hide_banner", "-nostats", "-i"])
            .arg(input)
            .args(["-af", "volumedetect", "-vn", "-f", "null", "-"])
            .stdin(Stdio::null())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() {
            return Err(FfmpegError::Failed {
                code: out.status.code(),
                stderr: tail(&stderr),
            });
        }
        parse_mean_volume(&stderr).ok_or(FfmpegError::NoVolume)
    }

    /// Whether a vocals stem carries audible vocals
    ///
    /// Analysis failures count as vocals present so no Acapella is lost.
    pub async fn has_vocals(&self, vocals: &Path) -> bool {
        match self.mean_volume(vocals).await {
            Ok(db) => {
                debug!(mean_volume = db, threshold = VOCALS_THRESHOLD_DB, "Vocal analysis");
                db >= VOCALS_THRESHOLD_DB
            }
            Err(e) => {
                warn!(file = %vocals.display(), "Vocal analysis failed: {}", e);
                true
            }
        }
    }
}

/// `mean_volume: -23.4 dB` from volumedetect output
pub fn parse_mean_volume(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("mean_volume:")?;
        rest.trim().trim_end_matches("dB").trim().parse().ok()
    })
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(10);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mean_volume() {
        let output = "\
[Parsed_volumedetect_0 @ 0x55] n_samples: 1234
[Parsed_volumedetect_0 @ 0x55] mean_volume: -27.3 dB
[Parsed_volumedetect_0 @ 0x55] max_volume: -3.0 dB";
        assert_eq!(parse_mean_volume(output), Some(-27.3));
        assert_eq!(parse_mean_volume("mean_volume: -inf dB"), Some(f64::NEG_INFINITY));
        assert_eq!(parse_mean_volume("nothing here"), None);
    }

    #[test]
    fn test_silent_stem_is_below_threshold() {
        let silent = parse_mean_volume("mean_volume: -52.0 dB").unwrap();
        let sung = parse_mean_volume("mean_volume: -18.5 dB").unwrap();
        assert!(silent < VOCALS_THRESHOLD_DB);
        assert!(sung >= VOCALS_THRESHOLD_DB);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: String = (0..15).map(|i| format!("line {i}\n")).collect();
        let t = tail(&text);
        assert!(t.starts_with("line 5"));
        assert!(t.ends_with("line 14"));
    }
}
