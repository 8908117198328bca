//! Track title and filename utilities
//!
//! DJ pools name files like `Artist - Title (Version) 10A 124.mp3`. These
//! helpers detect the version type, pull out the BPM, and reduce a title to
//! the base name used for the output folder.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version type of a track, either declared in its title or produced as an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Main,
    Extended,
    Acapella,
    Instrumental,
    Intro,
    Short,
    #[serde(rename = "Original Clean")]
    OriginalClean,
    #[serde(rename = "Original Dirty")]
    OriginalDirty,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Main => "Main",
            TrackType::Extended => "Extended",
            TrackType::Acapella => "Acapella",
            TrackType::Instrumental => "Instrumental",
            TrackType::Intro => "Intro",
            TrackType::Short => "Short",
            TrackType::OriginalClean => "Original Clean",
            TrackType::OriginalDirty => "Original Dirty",
        }
    }

    /// Parse a type name case-insensitively, accepting common aliases
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "main" => Some(TrackType::Main),
            "extended" => Some(TrackType::Extended),
            "acapella" | "acap" | "a cappella" | "a capella" | "acappella" => {
                Some(TrackType::Acapella)
            }
            "instrumental" | "instru" | "inst" => Some(TrackType::Instrumental),
            "intro" => Some(TrackType::Intro),
            "short" | "quick hit" => Some(TrackType::Short),
            "original clean" => Some(TrackType::OriginalClean),
            "original dirty" => Some(TrackType::OriginalDirty),
            _ => None,
        }
    }

    /// Catalog column holding the file URL for this type and format
    ///
    /// Acapella, Instrumental, Intro and Short are stored as MP3 only; a WAV
    /// of those types has no column and yields `None`.
    pub fn file_field(&self, format: AudioFormat) -> Option<&'static str> {
        let wav = format == AudioFormat::Wav;
        match self {
            TrackType::Main => Some(if wav { "track_wav" } else { "track_file" }),
            TrackType::Extended => Some(if wav { "extended_track_wave" } else { "extended_track_mp3" }),
            TrackType::OriginalClean => Some(if wav {
                "original_track_wave_clean"
            } else {
                "original_track_mp3_clean"
            }),
            TrackType::OriginalDirty => Some(if wav {
                "original_track_wave_dirty"
            } else {
                "original_track_mp3_dirty"
            }),
            TrackType::Acapella if !wav => Some("acapella"),
            TrackType::Instrumental if !wav => Some("instru"),
            TrackType::Intro if !wav => Some("intro"),
            TrackType::Short if !wav => Some("short"),
            _ => None,
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every catalog file column, in table order
pub const FILE_FIELDS: &[&str] = &[
    "track_file",
    "track_wav",
    "extended_track_mp3",
    "extended_track_wave",
    "original_track_mp3_clean",
    "original_track_wave_clean",
    "original_track_mp3_dirty",
    "original_track_wave_dirty",
    "acapella",
    "instru",
    "intro",
    "short",
];

/// Output container of an exported edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioFormat {
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "MP3",
            AudioFormat::Wav => "WAV",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
        }
    }
}

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| match Regex::new($pattern) {
            Ok(re) => re,
            Err(e) => panic!("invalid built-in pattern {}: {}", stringify!($name), e),
        });
    };
}

// Bracketed markers accept both () and []
regex!(RE_INST, r"(?i)[(\[]\s*inst(?:rumental)?\s*[)\]]");
regex!(RE_CLEAN_DIRTY_ACAP, r"(?i)[(\[]\s*(?:dirty|clean)\s+acap(?:ella)?\s*[)\]]");
regex!(RE_ACAP, r"(?i)[(\[]\s*acap(?:ella)?\s*[)\]]");
regex!(
    RE_INTRO,
    r"(?i)[(\[]\s*(?:[\w\s]*\s+)?intro(?:\s+(?:clean|dirty))?(?:\s*-\s*(?:clean|dirty))?\s*[)\]]"
);
regex!(RE_INTRO_DASH, r"(?i)intro\s*-\s*(?:clean|dirty)");
regex!(RE_QUICK_HIT, r"(?i)[(\[]\s*quick\s*hit(?:\s+(?:clean|dirty))?\s*[)\]]");
regex!(RE_SHORT, r"(?i)[(\[]\s*short\s*[)\]]");
regex!(RE_EXTENDED, r"(?i)[(\[]\s*extended\s*[)\]]");
regex!(RE_CLEAN, r"(?i)[(\[]\s*clean\s*[)\]]");
regex!(RE_DIRTY, r"(?i)[(\[]\s*dirty\s*[)\]]");
regex!(RE_ACAP_WORD, r"(?i)\bacap\b");

regex!(RE_TRAILING_KEY_BPM, r"\s+\d{1,2}[ABab]\s+\d{2,3}\s*$");
regex!(RE_TRAILING_BPM, r"\s+\d{2,3}\s*$");
regex!(RE_TRAILING_KEY, r"\s+\d{1,2}[ABab]\s*$");
regex!(RE_BPM_SUFFIX, r"(\d{2,3})\s*$");

regex!(RE_AUDIO_EXT, r"(?i)\.(?:mp3|wav|flac|aac|ogg|m4a)$");
regex!(RE_RADIO_EDIT_BRACKET, r"(?i)\s*[(\[]\s*radio\s+edit\s*[)\]]");
regex!(RE_RADIO_EDIT_DASH, r"(?i)\s*-\s*radio[\s-]+edit");
regex!(RE_STRIP_VERSION, r"(?i)\s*[(\[]\s*(?:clean|dirty|inst(?:rumental)?)\s*[)\]]");
regex!(RE_STRIP_CLEAN_DIRTY_ACAP, r"(?i)\s*[(\[]\s*(?:dirty|clean)\s+acap(?:ella)?\s*[)\]]");
regex!(RE_STRIP_ACAP, r"(?i)\s*[(\[]\s*acap(?:ella)?\s*[)\]]");
regex!(RE_STRIP_QUICK_HIT, r"(?i)\s*[(\[]\s*quick\s*hit(?:\s+(?:clean|dirty))?\s*[)\]]");
regex!(RE_STRIP_SHORT, r"(?i)\s*[(\[]\s*short\s*[)\]]");
regex!(RE_STRIP_EXTENDED, r"(?i)\s*[(\[]\s*extended\s*[)\]]");
regex!(
    RE_STRIP_INTRO,
    r"(?i)\s*[(\[]\s*(?:[\w\s]*\s+)?intro(?:\s+(?:clean|dirty))?(?:\s*-\s*(?:clean|dirty))?\s*[)\]]"
);

regex!(RE_ID_SUFFIX, r"-\d+$");
regex!(RE_DOT_CAPITAL, r"\.([A-Z])");
regex!(RE_SPACES, r"\s+");
regex!(RE_UNDERSCORES, r"_+");
regex!(RE_PATH_ILLEGAL, r#"[<>:"/\\|?*]"#);
regex!(RE_FEAT, r"(?i)\s*\b(?:feat\.?|ft\.?)\s+");
regex!(RE_AND, r"(?i)\s+and\s+");
regex!(RE_ARTIST_SEPARATORS, r"\s*(?:\||/|;)\s*|\s+&\s+");

/// Words that mark the part after the last ` - ` as a remixer or DJ edit credit
const EDIT_KEYWORDS: &[&str] = &[
    "remix", "edit", "intro", "outro", "transition", "hype", "club", "bootleg", "mashup",
    "blend", "rework", "redrum", "flip", "version", "mix", "dub", "vip", "break intro", "slam",
];

/// Detect the version type declared in a title or filename
///
/// Bracketed markers win over bare keywords. Returns `None` for a regular track.
pub fn detect_track_type(title: &str) -> Option<TrackType> {
    if title.trim().is_empty() {
        return None;
    }

    let bracketed: [(&Lazy<Regex>, TrackType); 10] = [
        (&RE_INST, TrackType::Instrumental),
        (&RE_CLEAN_DIRTY_ACAP, TrackType::Acapella),
        (&RE_ACAP, TrackType::Acapella),
        (&RE_INTRO, TrackType::Intro),
        (&RE_INTRO_DASH, TrackType::Intro),
        (&RE_QUICK_HIT, TrackType::Short),
        (&RE_SHORT, TrackType::Short),
        (&RE_EXTENDED, TrackType::Extended),
        (&RE_CLEAN, TrackType::OriginalClean),
        (&RE_DIRTY, TrackType::OriginalDirty),
    ];
    for (re, track_type) in bracketed {
        if re.is_match(title) {
            return Some(track_type);
        }
    }

    let lower = title.to_lowercase();
    if lower.contains("instrumental") {
        Some(TrackType::Instrumental)
    } else if lower.contains("acapella")
        || lower.contains("a capella")
        || lower.contains("acappella")
        || RE_ACAP_WORD.is_match(&lower)
    {
        Some(TrackType::Acapella)
    } else if lower.contains("extended") {
        Some(TrackType::Extended)
    } else {
        None
    }
}

/// BPM from the trailing number of a filename, if it falls in 60..=200
pub fn extract_bpm_from_filename(filename: &str) -> Option<u32> {
    let stem = strip_extension(filename);
    let caps = RE_BPM_SUFFIX.captures(stem)?;
    let bpm: u32 = caps.get(1)?.as_str().parse().ok()?;
    (60..=200).contains(&bpm).then_some(bpm)
}

/// Remove a trailing Camelot key and/or BPM (`"Hot Spot [Dirty] 10A 93"` → `"Hot Spot [Dirty]"`)
pub fn strip_trailing_bpm_and_key(title: &str) -> String {
    let cleaned = RE_TRAILING_KEY_BPM.replace(title, "");
    let cleaned = RE_TRAILING_BPM.replace(&cleaned, "");
    let cleaned = RE_TRAILING_KEY.replace(&cleaned, "");
    cleaned.trim().to_string()
}

/// Normalize an upload filename into a display name; returns `(name, extension)`
///
/// Underscores become spaces, a trailing `-<digits>` store ID is dropped, and a
/// period glued to a capital letter gets a space (`ft.Travis` → `ft. Travis`).
pub fn clean_filename(filename: &str) -> (String, String) {
    let (stem, ext) = split_extension(filename);
    let name = stem.replace('_', " ");
    let name = RE_ID_SUFFIX.replace(&name, "");
    let name = RE_DOT_CAPITAL.replace_all(&name, ". $1");
    let name = RE_SPACES.replace_all(&name, " ");
    (name.trim().to_string(), ext.to_string())
}

/// Reduce a title to its base name: no type markers, artist, remixer credit, BPM or key
///
/// `"Akon Ft. John Mamann - Tt Freak (Clean) 123"` → `"Tt Freak"`
pub fn clean_type_from_title(title: &str) -> String {
    let cleaned = RE_AUDIO_EXT.replace(title, "");
    let mut cleaned = strip_trailing_bpm_and_key(&cleaned);

    for re in [
        &RE_RADIO_EDIT_BRACKET,
        &RE_RADIO_EDIT_DASH,
        &RE_STRIP_VERSION,
        &RE_STRIP_CLEAN_DIRTY_ACAP,
        &RE_STRIP_ACAP,
        &RE_STRIP_QUICK_HIT,
        &RE_STRIP_SHORT,
        &RE_STRIP_EXTENDED,
        &RE_STRIP_INTRO,
    ] {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }

    if let Some((_, rest)) = cleaned.split_once(" - ") {
        cleaned = rest.to_string();
    }

    if let Some((head, tail)) = cleaned.rsplit_once(" - ") {
        let tail = tail.to_lowercase();
        if EDIT_KEYWORDS.iter().any(|kw| tail.contains(kw)) {
            cleaned = head.to_string();
        }
    }

    RE_SPACES.replace_all(&cleaned, " ").trim().to_string()
}

/// Folder name used when neither the tag title nor the filename yields one
pub const UNKNOWN_TRACK: &str = "Unknown Track";

/// Base folder name for a track: tag title (path-illegal characters removed)
/// or cleaned filename, minus trailing BPM/key and declared type markers
///
/// The result is always a single path component that stays inside its
/// parent. A title that cleans down to nothing or to a dot name falls back to
/// the filename, then to [`UNKNOWN_TRACK`].
pub fn base_track_name(tag_title: Option<&str>, filename: &str, declared: Option<TrackType>) -> String {
    let from_title = tag_title.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
    let from_filename = clean_filename(filename).0;

    from_title
        .into_iter()
        .chain(std::iter::once(from_filename))
        .map(|candidate| reduce_base_name(&candidate, declared))
        .find(|name| is_safe_folder_name(name))
        .unwrap_or_else(|| UNKNOWN_TRACK.to_string())
}

fn reduce_base_name(candidate: &str, declared: Option<TrackType>) -> String {
    let base = RE_PATH_ILLEGAL.replace_all(candidate, "");
    let base = strip_trailing_bpm_and_key(base.trim());

    if declared.is_some() {
        let cleaned = clean_type_from_title(&base);
        if !cleaned.is_empty() {
            return cleaned;
        }
    }
    base
}

/// True when `name` joined to a folder names an entry directly inside it
pub fn is_safe_folder_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}

/// Join artists as `A`, `A & B`, or `A, B & C`
///
/// Accepts `feat.`, `ft.`, `/`, `;`, `|`, ` & `, ` and ` and NUL as separators.
pub fn format_artists(raw: &str) -> String {
    let normalized = raw.replace('\0', "|");
    let normalized = RE_FEAT.replace_all(&normalized, "|");
    let normalized = RE_AND.replace_all(&normalized, "|");
    let normalized = RE_ARTIST_SEPARATORS.replace_all(&normalized, "|");

    let artists: Vec<&str> = normalized
        .split('|')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();

    match artists.as_slice() {
        [] => raw.trim().to_string(),
        [one] => one.to_string(),
        [rest @ .., last] => format!("{} & {}", rest.join(", "), last),
    }
}

/// Catalog identifier: `{isrc}_{name}` with dashes and spaces folded into single underscores
pub fn build_track_id(isrc: Option<&str>, name: &str) -> String {
    let name = name.replace(['-', '_'], " ");
    let name = RE_SPACES.replace_all(name.trim(), "_");
    let name = RE_UNDERSCORES.replace_all(&name, "_").into_owned();

    match isrc.map(str::trim).filter(|i| !i.is_empty()) {
        Some(isrc) => format!("{}_{}", isrc, name),
        None => name,
    }
}

/// Output filename of an edit: `"{base} - {suffix}.{ext}"`
pub fn edit_filename(base: &str, suffix: &str, format: AudioFormat) -> String {
    format!("{} - {}.{}", base, suffix, format.extension())
}

/// Keep only the final path component of a client-supplied filename and
/// drop characters that are unsafe in a folder name
pub fn sanitize_upload_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned = RE_PATH_ILLEGAL.replace_all(base, "");
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 && !filename[idx + 1..].contains(' ') => {
            (&filename[..idx], &filename[idx..])
        }
        _ => (filename, ""),
    }
}

fn strip_extension(filename: &str) -> &str {
    split_extension(filename).0
}
