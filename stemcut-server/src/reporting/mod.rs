//! Completion reporting
//!
//! Every exported file is reported once, either to the external HTTP API or,
//! in database mode, straight into the catalog.

pub mod api;
pub mod database;
pub mod deezer;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use stemcut_common::title::{build_track_id, AudioFormat, TrackType};

use crate::pipeline::tags::SourceTags;
use deezer::DeezerMatch;

pub use api::ApiReporter;
pub use database::DatabaseReporter;
pub use deezer::DeezerClient;

/// Report payload for one exported file
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackMetadata {
    #[serde(rename = "type")]
    pub track_type: TrackType,
    pub format: AudioFormat,
    /// Edit name, `"{base} - {type}"`
    pub title: String,
    /// Base name shared by all edits of the track
    pub base_title: String,
    /// Absolute download URL
    pub url: String,
    pub artists: String,
    pub album: Option<String>,
    pub bpm: Option<u32>,
    pub key: Option<String>,
    pub isrc: Option<String>,
    pub label: Option<String>,
    pub release_date: Option<String>,
    pub genre: Option<String>,
    /// Identifier of this edit
    pub track_id: String,
    /// Identifier of the base track (catalog primary key)
    pub base_track_id: String,
    /// Catalog column for this type and format
    pub file_field: Option<&'static str>,
}

/// One exported file ready to be described
#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub track_type: TrackType,
    pub format: AudioFormat,
    pub base_name: String,
    /// `/download_file?path=...`
    pub relative_url: String,
}

impl ExportedFile {
    pub fn edit_name(&self) -> String {
        format!("{} - {}", self.base_name, self.track_type)
    }
}

#[async_trait]
pub trait TrackReporter: Send + Sync {
    /// Short name for logs (`api`, `database`)
    fn name(&self) -> &'static str;

    async fn report(&self, metadata: &TrackMetadata) -> Result<()>;
}

/// Build the report payload; tag values win over Deezer values
pub fn prepare_metadata(
    file: &ExportedFile,
    source: &SourceTags,
    bpm: Option<u32>,
    base_url: &str,
    enrichment: Option<&DeezerMatch>,
) -> TrackMetadata {
    let from_deezer = |pick: fn(&DeezerMatch) -> Option<String>| enrichment.and_then(pick);

    let isrc = source.isrc.clone().or_else(|| from_deezer(|m| m.isrc.clone()));
    let name = file.edit_name();

    TrackMetadata {
        track_type: file.track_type,
        format: file.format,
        track_id: build_track_id(isrc.as_deref(), &name),
        base_track_id: build_track_id(isrc.as_deref(), &file.base_name),
        title: name,
        base_title: file.base_name.clone(),
        url: format!("{}{}", base_url, file.relative_url),
        artists: source
            .artist
            .clone()
            .or_else(|| from_deezer(|m| Some(m.artist.clone()).filter(|a| !a.is_empty())))
            .unwrap_or_else(|| "Unknown".to_string()),
        album: source.album.clone().or_else(|| from_deezer(|m| m.album.clone())),
        bpm: bpm.or_else(|| enrichment.and_then(|m| m.bpm)),
        key: source.key.clone(),
        isrc,
        label: source.label.clone().or_else(|| from_deezer(|m| m.label.clone())),
        release_date: source
            .release_date
            .clone()
            .or_else(|| from_deezer(|m| m.release_date.clone())),
        genre: source.genre.clone().or_else(|| from_deezer(|m| m.genre.clone())),
        file_field: file.track_type.file_field(file.format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exported(track_type: TrackType, format: AudioFormat) -> ExportedFile {
        ExportedFile {
            track_type,
            format,
            base_name: "Hot Spot".to_string(),
            relative_url: "/download_file?path=Hot%20Spot/Hot%20Spot%20-%20Main.mp3".to_string(),
        }
    }

    #[test]
    fn test_prepare_metadata_from_tags() {
        let source = SourceTags {
            artist: Some("Artist".into()),
            isrc: Some("USABC2400001".into()),
            genre: Some("House".into()),
            ..Default::default()
        };
        let meta = prepare_metadata(
            &exported(TrackType::Main, AudioFormat::Mp3),
            &source,
            Some(124),
            "https://stems.example.com",
            None,
        );

        assert_eq!(meta.title, "Hot Spot - Main");
        assert_eq!(meta.track_id, "USABC2400001_Hot_Spot_Main");
        assert_eq!(meta.base_track_id, "USABC2400001_Hot_Spot");
        assert_eq!(
            meta.url,
            "https://stems.example.com/download_file?path=Hot%20Spot/Hot%20Spot%20-%20Main.mp3"
        );
        assert_eq!(meta.file_field, Some("track_file"));
        assert_eq!(meta.bpm, Some(124));
        assert_eq!(meta.artists, "Artist");
    }

    #[test]
    fn test_deezer_fills_only_missing_fields() {
        let source = SourceTags {
            genre: Some("House".into()),
            ..Default::default()
        };
        let deezer = DeezerMatch {
            artist: "Deezer Artist".into(),
            isrc: Some("FRXYZ".into()),
            bpm: Some(128),
            genre: Some("Dance".into()),
            label: Some("Label".into()),
            ..Default::default()
        };
        let meta = prepare_metadata(
            &exported(TrackType::Acapella, AudioFormat::Wav),
            &source,
            None,
            "http://localhost:8888",
            Some(&deezer),
        );

        assert_eq!(meta.isrc.as_deref(), Some("FRXYZ"));
        assert_eq!(meta.bpm, Some(128));
        assert_eq!(meta.genre.as_deref(), Some("House"));
        assert_eq!(meta.label.as_deref(), Some("Label"));
        assert_eq!(meta.artists, "Deezer Artist");
        // Acapella is stored as MP3 only
        assert_eq!(meta.file_field, None);
    }

    #[test]
    fn test_metadata_serializes_type_key() {
        let meta = prepare_metadata(
            &exported(TrackType::Instrumental, AudioFormat::Mp3),
            &SourceTags::default(),
            None,
            "",
            None,
        );
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "Instrumental");
        assert_eq!(json["format"], "MP3");
        assert_eq!(json["artists"], "Unknown");
    }
}
