//! Settings resolution and folder layout
//!
//! Every setting is resolved in priority order:
//! 1. Command-line argument (port and root folder only)
//! 2. Environment variable
//! 3. TOML config file (key is the lowercase environment name)
//! 4. Compiled default

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8888;

/// Upper bound for minute-valued delays and intervals (one year)
pub const MAX_DELAY_MINUTES: i64 = 525_600;

/// Upper bound for `MAX_FILE_AGE_HOURS` (ten years)
pub const MAX_FILE_AGE_HOURS: u64 = 87_600;

/// Command-line overrides, highest priority
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub root_folder: Option<PathBuf>,
}

/// Fully resolved service settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub root_folder: PathBuf,
    /// Externally reachable base URL used when reporting download links
    pub public_url: Option<String>,
    /// Shared key for the external API and for protected routes (empty disables auth)
    pub api_key: String,
    pub api_endpoint: String,
    pub max_pending_tracks: usize,
    pub pending_warning_threshold: usize,
    pub database_url: Option<String>,
    pub use_database_mode: bool,
    pub num_workers: usize,
    /// Forced Demucs device (`cuda`/`cpu`); `None` tries CUDA first
    pub demucs_device: Option<String>,
    pub demucs_bin: String,
    pub ffmpeg_bin: String,
    pub demucs_timeout_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub deletion_delay_minutes: i64,
    pub delayed_delete_enabled: bool,
    pub sequential_mode: bool,
    pub max_file_age_hours: u64,
    pub cleanup_interval_minutes: u64,
    pub disk_threshold_percent: f64,
    pub tracks_to_delete: usize,
    pub disk_cleanup_enabled: bool,
    pub batch_size: usize,
    pub max_processing_time_secs: u64,
    pub max_concurrent_uploads: usize,
    pub deezer_enabled: bool,
    pub tag_artist: String,
}

impl Settings {
    /// Resolve settings from the process environment and the config file
    pub fn load(cli: &CliOverrides) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let file = match locate_config_file() {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        Self::from_sources(cli, &env, file.as_ref())
    }

    /// Resolve settings from explicit sources
    pub fn from_sources(
        cli: &CliOverrides,
        env: &HashMap<String, String>,
        file: Option<&toml::Table>,
    ) -> Result<Self> {
        let src = Sources { env, file };

        let port = match cli.port {
            Some(port) => port,
            None => src.parse("PORT", DEFAULT_PORT)?,
        };

        let root_folder = match &cli.root_folder {
            Some(path) => path.clone(),
            None => src
                .get("STEMCUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(default_root_folder),
        };

        let settings = Self {
            host: src.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            root_folder,
            public_url: src
                .get("PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            api_key: src.get("API_KEY").unwrap_or_default(),
            api_endpoint: src.get("API_ENDPOINT").unwrap_or_default(),
            max_pending_tracks: src.parse("MAX_PENDING_TRACKS", 1500)?,
            pending_warning_threshold: src.parse("PENDING_WARNING_THRESHOLD", 1000)?,
            database_url: src.get("DATABASE_URL").filter(|url| !url.is_empty()),
            use_database_mode: src.flag("USE_DATABASE_MODE", false)?,
            num_workers: src.parse::<usize>("NUM_WORKERS", 2)?.max(1),
            demucs_device: src
                .get("DEMUCS_FORCE_DEVICE")
                .map(|d| d.to_lowercase())
                .filter(|d| !d.is_empty() && d != "auto"),
            demucs_bin: src.get("DEMUCS_BIN").unwrap_or_else(|| "demucs".to_string()),
            ffmpeg_bin: src.get("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            demucs_timeout_secs: src.parse("DEMUCS_TIMEOUT_SECONDS", 600)?,
            max_retry_attempts: src.parse::<u32>("MAX_RETRY_ATTEMPTS", 3)?.max(1),
            retry_delay_secs: src.parse("RETRY_DELAY_SECONDS", 5)?,
            deletion_delay_minutes: src.parse_in_range(
                "DELETION_DELAY_MINUTES",
                300,
                0..=MAX_DELAY_MINUTES,
            )?,
            delayed_delete_enabled: src.flag("DELAYED_DELETE_ENABLED", true)?,
            sequential_mode: src.flag("SEQUENTIAL_MODE", true)?,
            max_file_age_hours: src.parse_in_range(
                "MAX_FILE_AGE_HOURS",
                10,
                0..=MAX_FILE_AGE_HOURS,
            )?,
            cleanup_interval_minutes: src.parse_in_range(
                "CLEANUP_INTERVAL_MINUTES",
                500,
                1..=MAX_DELAY_MINUTES as u64,
            )?,
            disk_threshold_percent: src.parse("DISK_THRESHOLD_PERCENT", 80.0)?,
            tracks_to_delete: src.parse("TRACKS_TO_DELETE", 25000)?,
            disk_cleanup_enabled: src.flag("DISK_CLEANUP_ENABLED", true)?,
            batch_size: src.parse::<usize>("BATCH_SIZE", 200)?.max(1),
            max_processing_time_secs: src.parse("MAX_PROCESSING_TIME", 1800)?,
            max_concurrent_uploads: src.parse::<usize>("MAX_CONCURRENT_UPLOADS", 50)?.max(1),
            deezer_enabled: src.flag("DEEZER_ENABLED", true)?,
            tag_artist: src.get("TAG_ARTIST").unwrap_or_else(|| "stemcut".to_string()),
        };

        if settings.pending_warning_threshold > settings.max_pending_tracks {
            warn!(
                threshold = settings.pending_warning_threshold,
                max = settings.max_pending_tracks,
                "PENDING_WARNING_THRESHOLD is above MAX_PENDING_TRACKS; warning level will never be reached"
            );
        }

        Ok(settings)
    }

    /// Settings rooted at `root`, all defaults otherwise (used by tests)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let cli = CliOverrides {
            port: None,
            root_folder: Some(root.into()),
        };
        // Defaults always parse
        match Self::from_sources(&cli, &HashMap::new(), None) {
            Ok(settings) => settings,
            Err(e) => unreachable!("default settings failed to parse: {e}"),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root_folder.join("uploads")
    }

    /// Demucs output root; stems land in `output/htdemucs/<stem>/`
    pub fn output_dir(&self) -> PathBuf {
        self.root_folder.join("output")
    }

    pub fn htdemucs_dir(&self) -> PathBuf {
        self.output_dir().join("htdemucs")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root_folder.join("processed")
    }

    /// Local SQLite database (upload history)
    pub fn local_db_path(&self) -> PathBuf {
        self.root_folder.join("stemcut.db")
    }

    /// Create the folder layout if missing
    pub fn ensure_folders(&self) -> Result<()> {
        for dir in [self.uploads_dir(), self.htdemucs_dir(), self.processed_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Base URL prefixed to relative download links
    pub fn base_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }

    /// Whether protected routes require a key
    pub fn auth_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Environment first, then config file
struct Sources<'a> {
    env: &'a HashMap<String, String>,
    file: Option<&'a toml::Table>,
}

impl Sources<'_> {
    fn get(&self, key: &str) -> Option<String> {
        let from_file = self.file.and_then(|table| {
            table.get(&key.to_lowercase()).map(|value| match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        });

        match self.env.get(key) {
            Some(value) => {
                if from_file.is_some() {
                    warn!("{} set in both environment and config file; using environment", key);
                }
                Some(value.trim().to_string())
            }
            None => from_file,
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|_| Error::InvalidSetting {
                key: key.to_string(),
                value: raw,
            }),
            None => Ok(default),
        }
    }

    /// Like `parse`, but values outside `range` are rejected
    fn parse_in_range<T>(&self, key: &str, default: T, range: RangeInclusive<T>) -> Result<T>
    where
        T: FromStr + PartialOrd + fmt::Display,
    {
        let value = self.parse(key, default)?;
        if range.contains(&value) {
            Ok(value)
        } else {
            Err(Error::InvalidSetting {
                key: key.to_string(),
                value: format!("{} (allowed {}..={})", value, range.start(), range.end()),
            })
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(raw) => parse_flag(&raw).ok_or(Error::InvalidSetting {
                key: key.to_string(),
                value: raw,
            }),
            None => Ok(default),
        }
    }
}

/// `true/1/yes/on` and `false/0/no/off`, case-insensitive
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// `STEMCUT_CONFIG`, then `~/.config/stemcut/config.toml`, then `/etc/stemcut/config.toml`
fn locate_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("STEMCUT_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("stemcut").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/stemcut/config.toml");
    if cfg!(target_os = "linux") && system_config.exists() {
        return Some(system_config);
    }

    None
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stemcut"))
        .unwrap_or_else(|| PathBuf::from("./stemcut_data"))
}
