//! Catalog database reporter

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{TrackMetadata, TrackReporter};
use crate::db::catalog::{CatalogDb, CatalogTrack};

pub struct DatabaseReporter {
    catalog: CatalogDb,
}

impl DatabaseReporter {
    pub fn new(catalog: CatalogDb) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl TrackReporter for DatabaseReporter {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn report(&self, metadata: &TrackMetadata) -> Result<()> {
        let Some(file_field) = metadata.file_field else {
            warn!(
                title = %metadata.title,
                format = metadata.format.label(),
                "No catalog column for this type and format, skipping"
            );
            return Ok(());
        };

        self.catalog
            .upsert(&CatalogTrack {
                track_id: &metadata.base_track_id,
                title: &metadata.base_title,
                artists: &metadata.artists,
                bpm: metadata.bpm,
                key: metadata.key.as_deref(),
                isrc: metadata.isrc.as_deref(),
                label: metadata.label.as_deref(),
                release_date: metadata.release_date.as_deref(),
                genre: metadata.genre.as_deref(),
                album: metadata.album.as_deref(),
                file_field,
                file_url: &metadata.url,
            })
            .await?;

        info!(
            track_id = %metadata.base_track_id,
            field = file_field,
            "Saved to catalog"
        );
        Ok(())
    }
}
