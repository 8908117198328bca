//! Demucs separation runner
//!
//! Runs the `demucs` CLI in two-stem mode and streams its output, turning the
//! tqdm `NN%|` lines into progress callbacks. A run that prints nothing for
//! the configured timeout is killed. A failing CUDA run is retried once on CPU.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use stemcut_common::config::Settings;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// Model name; also the name of the output subfolder
pub const MODEL: &str = "htdemucs";

/// Lines of output kept for error messages
const TAIL_LINES: usize = 20;

/// Polls for the stem files after a successful run
const STEM_WAIT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cuda" | "gpu" => Some(Device::Cuda),
            "cpu" => Some(Device::Cpu),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DemucsError {
    #[error("failed to start demucs: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("demucs produced no output for {0}s and was killed")]
    Timeout(u64),

    #[error("demucs exited with code {code:?}: {tail}")]
    Failed { code: Option<i32>, tail: String },

    #[error("separated stems not found in {}", .0.display())]
    MissingStems(PathBuf),
}

/// Vocals and accompaniment of one separated track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stems {
    pub dir: PathBuf,
    pub vocals: PathBuf,
    pub no_vocals: PathBuf,
}

impl Stems {
    /// Expected stem locations for an input file under `output_dir`
    pub fn locate(output_dir: &Path, input: &Path) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = output_dir.join(MODEL).join(stem);
        Self {
            vocals: dir.join("vocals.mp3"),
            no_vocals: dir.join("no_vocals.mp3"),
            dir,
        }
    }

    async fn exist(&self) -> bool {
        tokio::fs::try_exists(&self.vocals).await.unwrap_or(false)
            && tokio::fs::try_exists(&self.no_vocals).await.unwrap_or(false)
    }
}

pub struct DemucsRunner {
    bin: String,
    output_dir: PathBuf,
    timeout: Duration,
    num_workers: usize,
    forced: Option<Device>,
    detected: OnceCell<Device>,
}

impl DemucsRunner {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bin: settings.demucs_bin.clone(),
            output_dir: settings.output_dir(),
            timeout: Duration::from_secs(settings.demucs_timeout_secs),
            num_workers: settings.num_workers.max(1),
            forced: settings.demucs_device.as_deref().and_then(Device::parse),
            detected: OnceCell::new(),
        }
    }

    /// Forced device, else CUDA when `nvidia-smi` lists a GPU
    pub async fn device(&self) -> Device {
        if let Some(device) = self.forced {
            return device;
        }
        *self
            .detected
            .get_or_init(|| async {
                let gpu = Command::new("nvidia-smi")
                    .arg("-L")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|status| status.success())
                    .unwrap_or(false);
                let device = if gpu { Device::Cuda } else { Device::Cpu };
                info!(device = device.as_str(), "Demucs device detected");
                device
            })
            .await
    }

    /// Parallel jobs per worker; CPU runs get half as many
    pub fn jobs(&self, device: Device) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let divisor = match device {
            Device::Cuda => self.num_workers,
            Device::Cpu => self.num_workers * 2,
        };
        (cpus / divisor.max(1)).max(1)
    }

    pub fn args(&self, input: &Path, device: Device) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--two-stems=vocals",
            "-n",
            MODEL,
            "--mp3",
            "--mp3-bitrate",
            "320",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push("-j".into());
        args.push(self.jobs(device).to_string().into());
        for arg in ["--segment", "7", "--overlap", "0.1", "--device", device.as_str(), "-o"] {
            args.push(arg.into());
        }
        args.push(self.output_dir.clone().into_os_string());
        args.push(input.as_os_str().to_owned());
        args
    }

    /// Separate `input` into vocals and accompaniment
    ///
    /// `on_progress` receives the raw separation percentage (0-100).
    pub async fn separate<F>(&self, input: &Path, mut on_progress: F) -> Result<Stems, DemucsError>
    where
        F: FnMut(u8) + Send,
    {
        let device = self.device().await;
        let result = match self.run(input, device, &mut on_progress).await {
            Err(e) if device == Device::Cuda => {
                warn!(file = %input.display(), "Demucs failed on CUDA, retrying on CPU: {}", e);
                self.run(input, Device::Cpu, &mut on_progress).await
            }
            other => other,
        };
        result?;

        let stems = Stems::locate(&self.output_dir, input);
        for attempt in 0..STEM_WAIT_ATTEMPTS {
            if stems.exist().await {
                return Ok(stems);
            }
            if attempt + 1 < STEM_WAIT_ATTEMPTS {
                debug!(dir = %stems.dir.display(), "Waiting for separated stems");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        Err(DemucsError::MissingStems(stems.dir))
    }

    async fn run<F>(&self, input: &Path, device: Device, on_progress: &mut F) -> Result<(), DemucsError>
    where
        F: FnMut(u8) + Send,
    {
        let args = self.args(input, device);
        info!(bin = %self.bin, device = device.as_str(), jobs = self.jobs(device), "Starting Demucs");
        debug!(?args, "Demucs command");

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // tqdm rewrites its bar with \r, so both streams are split on \r and \n
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut tail: Vec<String> = Vec::new();
        loop {
            match tokio::time::timeout(self.timeout, rx.recv()).await {
                Ok(Some(line)) => {
                    if let Some(percent) = parse_progress(&line) {
                        on_progress(percent);
                    } else {
                        debug!("demucs: {}", line);
                    }
                    tail.push(line);
                    if tail.len() > TAIL_LINES {
                        tail.remove(0);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(timeout_secs = self.timeout.as_secs(), "Demucs stalled, killing process");
                    let _ = child.kill().await;
                    return Err(DemucsError::Timeout(self.timeout.as_secs()));
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(DemucsError::Failed {
                code: status.code(),
                tail: tail.join("\n"),
            })
        }
    }
}

async fn forward_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).trim().to_string();
                    pending.clear();
                    if !line.is_empty() && tx.send(line).is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).trim().to_string());
    }
}

/// Percentage of a tqdm progress line (`" 42%|████      | 12/30"`)
pub fn parse_progress(line: &str) -> Option<u8> {
    let (head, _) = line.split_once("%|")?;
    let digits: String = head
        .trim_end()
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let percent: u32 = digits.parse().ok()?;
    Some(percent.min(100) as u8)
}
