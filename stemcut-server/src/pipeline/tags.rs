//! ID3 tag reading (uploads) and writing (exported edits)

use id3::{Tag, TagLike, Version};
use std::path::Path;
use stemcut_common::title::{format_artists, AudioFormat};
use tracing::debug;

/// Tags of an uploaded file that feed naming and reporting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTags {
    pub title: Option<String>,
    /// Artist string formatted as `A, B & C`
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub isrc: Option<String>,
    pub release_date: Option<String>,
    pub label: Option<String>,
    pub bpm: Option<u32>,
    pub key: Option<String>,
}

impl SourceTags {
    /// Read tags from a file; a file without tags yields empty fields
    pub fn read(path: &Path) -> Self {
        match Tag::read_from_path(path) {
            Ok(tag) => Self::from_tag(&tag),
            Err(e) => {
                debug!(file = %path.display(), "No readable ID3 tag: {}", e);
                Self::default()
            }
        }
    }

    pub fn from_tag(tag: &Tag) -> Self {
        Self {
            title: non_empty(tag.title()),
            artist: non_empty(tag.artist()).map(|a| format_artists(&a)),
            album: non_empty(tag.album()),
            genre: non_empty(tag.genre()),
            isrc: text_frame(tag, "TSRC"),
            release_date: tag
                .date_recorded()
                .map(|ts| ts.to_string())
                .or_else(|| text_frame(tag, "TDRC")),
            label: text_frame(tag, "TPUB"),
            bpm: text_frame(tag, "TBPM").and_then(|raw| parse_bpm(&raw)),
            key: text_frame(tag, "TKEY"),
        }
    }
}

/// Tags written to an exported edit
#[derive(Debug, Clone)]
pub struct EditTags<'a> {
    pub title: &'a str,
    pub artist: &'a str,
    pub bpm: Option<u32>,
    pub source: &'a SourceTags,
}

impl EditTags<'_> {
    fn to_tag(&self) -> Tag {
        let mut tag = Tag::new();
        tag.set_title(self.title);
        tag.set_artist(self.artist);
        if let Some(album) = &self.source.album {
            tag.set_album(album.as_str());
        }
        if let Some(genre) = &self.source.genre {
            tag.set_genre(genre.as_str());
        }
        if let Some(bpm) = self.bpm {
            tag.set_text("TBPM", bpm.to_string());
        }
        if let Some(isrc) = &self.source.isrc {
            tag.set_text("TSRC", isrc.as_str());
        }
        if let Some(label) = &self.source.label {
            tag.set_text("TPUB", label.as_str());
        }
        if let Some(key) = &self.source.key {
            tag.set_text("TKEY", key.as_str());
        }
        if let Some(artist) = &self.source.artist {
            tag.set_text("TOPE", artist.as_str());
        }
        tag
    }

    /// Write the tag into an exported MP3 or WAV file
    pub fn write(&self, path: &Path, format: AudioFormat) -> Result<(), id3::Error> {
        let tag = self.to_tag();
        match format {
            AudioFormat::Mp3 => tag.write_to_path(path, Version::Id3v24),
            AudioFormat::Wav => tag.write_to_wav_path(path, Version::Id3v24),
        }
    }
}

/// BPM from a TBPM value such as `"124"` or `"123.8"`
pub fn parse_bpm(raw: &str) -> Option<u32> {
    let value: f64 = raw.trim().parse().ok()?;
    (value > 0.0).then_some(value as u32)
}

fn text_frame(tag: &Tag, id: &str) -> Option<String> {
    non_empty(tag.get(id).and_then(|frame| frame.content().text()))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim_matches(char::from(0)).trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bpm() {
        assert_eq!(parse_bpm("124"), Some(124));
        assert_eq!(parse_bpm(" 123.8 "), Some(123));
        assert_eq!(parse_bpm("0"), None);
        assert_eq!(parse_bpm("fast"), None);
    }

    #[test]
    fn test_source_tags_from_tag() {
        let mut tag = Tag::new();
        tag.set_title("Hot Spot [Dirty] 10A 93");
        tag.set_artist("Artist A feat. Artist B");
        tag.set_text("TBPM", "93");
        tag.set_text("TSRC", "USABC2400001");
        tag.set_text("TPUB", "Label");

        let source = SourceTags::from_tag(&tag);
        assert_eq!(source.title.as_deref(), Some("Hot Spot [Dirty] 10A 93"));
        assert_eq!(source.artist.as_deref(), Some("Artist A & Artist B"));
        assert_eq!(source.bpm, Some(93));
        assert_eq!(source.isrc.as_deref(), Some("USABC2400001"));
        assert_eq!(source.label.as_deref(), Some("Label"));
        assert_eq!(source.album, None);
    }

    #[test]
    fn test_edit_tags_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edit.mp3");
        std::fs::write(&path, b"").unwrap();

        let source = SourceTags {
            album: Some("Album".into()),
            ..Default::default()
        };
        let edit = EditTags {
            title: "Song - Acapella",
            artist: "stemcut",
            bpm: Some(120),
            source: &source,
        };
        edit.write(&path, AudioFormat::Mp3).unwrap();

        let read = SourceTags::read(&path);
        assert_eq!(read.title.as_deref(), Some("Song - Acapella"));
        assert_eq!(read.artist.as_deref(), Some("stemcut"));
        assert_eq!(read.album.as_deref(), Some("Album"));
        assert_eq!(read.bpm, Some(120));
    }

    #[test]
    fn test_missing_file_yields_empty_tags() {
        assert_eq!(SourceTags::read(Path::new("/nonexistent/file.mp3")), SourceTags::default());
    }
}
