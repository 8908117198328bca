//! Catalog database (database mode)
//!
//! One row per base track; each exported edit fills the file column that
//! matches its type and format. `DATABASE_URL` may point at SQLite or
//! PostgreSQL; both go through the sqlx `Any` driver.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use stemcut_common::title::FILE_FIELDS;
use tracing::info;

pub const TRACK_TABLE: &str = "tracks";

/// Number of column names listed in [`SchemaInfo::sample_columns`]
const SAMPLE_COLUMNS: usize = 20;

/// Row written for one exported file
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogTrack<'a> {
    pub track_id: &'a str,
    pub title: &'a str,
    pub artists: &'a str,
    pub bpm: Option<u32>,
    pub key: Option<&'a str>,
    pub isrc: Option<&'a str>,
    pub label: Option<&'a str>,
    pub release_date: Option<&'a str>,
    pub genre: Option<&'a str>,
    pub album: Option<&'a str>,
    pub file_field: &'a str,
    pub file_url: &'a str,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SchemaInfo {
    pub track_table_exists: bool,
    pub tables_count: usize,
    pub track_columns_count: usize,
    pub sample_columns: Vec<String>,
}

/// SQL flavour behind a catalog URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Dialect::Postgres)
        } else {
            None
        }
    }

    /// Bind marker for the 1-based parameter `n`
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }

    /// Comma-separated markers for parameters `1..=count`
    pub fn placeholders(self, count: usize) -> String {
        (1..=count).map(|n| self.placeholder(n)).collect::<Vec<_>>().join(", ")
    }

    fn tables_query(self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            Dialect::Postgres => {
                "SELECT CAST(table_name AS TEXT) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'"
            }
        }
    }

    fn columns_query(self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info(?) ORDER BY cid",
            Dialect::Postgres => {
                "SELECT CAST(column_name AS TEXT) FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 ORDER BY ordinal_position"
            }
        }
    }
}

#[derive(Clone)]
pub struct CatalogDb {
    pool: AnyPool,
    dialect: Dialect,
}

impl CatalogDb {
    /// Connect to `DATABASE_URL` and create the track table if missing
    pub async fn connect(url: &str) -> Result<Self> {
        let Some(dialect) = Dialect::from_url(url) else {
            bail!(
                "unsupported DATABASE_URL scheme (expected sqlite: or postgres://): {}",
                redact(url)
            );
        };
        install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(5).connect(url).await?;
        let db = Self { pool, dialect };
        db.init_schema().await?;
        info!(url = %redact(url), ?dialect, "Connected to catalog database");
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn init_schema(&self) -> Result<()> {
        let file_columns: String = FILE_FIELDS
            .iter()
            .map(|field| format!("            {} TEXT,\n", field))
            .collect();
        let ddl = format!(
            r#"
        CREATE TABLE IF NOT EXISTS {TRACK_TABLE} (
            track_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            artists TEXT NOT NULL DEFAULT '',
            bpm BIGINT,
            key TEXT,
            isrc TEXT,
            label TEXT,
            release_date TEXT,
            genre TEXT,
            album TEXT,
{file_columns}            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Insert or update a track row, setting one file column
    ///
    /// Metadata already present is kept; empty columns are filled.
    pub async fn upsert(&self, track: &CatalogTrack<'_>) -> Result<()> {
        if !FILE_FIELDS.contains(&track.file_field) {
            bail!("unknown file field: {}", track.file_field);
        }
        let field = track.file_field;
        let values = self.dialect.placeholders(11);

        let sql = format!(
            r#"
            INSERT INTO {TRACK_TABLE}
                (track_id, title, artists, bpm, key, isrc, label, release_date, genre, album, {field}, updated_at)
            VALUES ({values}, CURRENT_TIMESTAMP)
            ON CONFLICT(track_id) DO UPDATE SET
                {field} = excluded.{field},
                bpm = COALESCE({TRACK_TABLE}.bpm, excluded.bpm),
                key = COALESCE({TRACK_TABLE}.key, excluded.key),
                isrc = COALESCE({TRACK_TABLE}.isrc, excluded.isrc),
                label = COALESCE({TRACK_TABLE}.label, excluded.label),
                release_date = COALESCE({TRACK_TABLE}.release_date, excluded.release_date),
                genre = COALESCE({TRACK_TABLE}.genre, excluded.genre),
                album = COALESCE({TRACK_TABLE}.album, excluded.album),
                updated_at = CURRENT_TIMESTAMP
            "#
        );

        sqlx::query(&sql)
            .bind(track.track_id)
            .bind(track.title)
            .bind(track.artists)
            .bind(track.bpm.map(i64::from))
            .bind(track.key)
            .bind(track.isrc)
            .bind(track.label)
            .bind(track.release_date)
            .bind(track.genre)
            .bind(track.album)
            .bind(track.file_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// File URL stored in a column, if any
    pub async fn file_url(&self, track_id: &str, field: &str) -> Result<Option<String>> {
        if !FILE_FIELDS.contains(&field) {
            bail!("unknown file field: {}", field);
        }
        let sql = format!(
            "SELECT {field} FROM {TRACK_TABLE} WHERE track_id = {}",
            self.dialect.placeholder(1)
        );
        let row = sqlx::query(&sql).bind(track_id).fetch_optional(&self.pool).await?;
        Ok(match row {
            Some(row) => row.try_get(0)?,
            None => None,
        })
    }

    pub async fn schema_info(&self) -> Result<SchemaInfo> {
        let tables: Vec<String> = sqlx::query_scalar(self.dialect.tables_query())
            .fetch_all(&self.pool)
            .await?;

        let columns: Vec<String> = sqlx::query_scalar(self.dialect.columns_query())
            .bind(TRACK_TABLE)
            .fetch_all(&self.pool)
            .await?;

        Ok(SchemaInfo {
            track_table_exists: tables.iter().any(|t| t == TRACK_TABLE),
            tables_count: tables.len(),
            track_columns_count: columns.len(),
            sample_columns: columns.into_iter().take(SAMPLE_COLUMNS).collect(),
        })
    }
}

/// Database URL with any password masked
pub fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or("");
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Catalog in a fresh SQLite file; keep the directory alive for the test
    async fn setup_catalog() -> (tempfile::TempDir, CatalogDb) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("catalog.db").display());
        let db = CatalogDb::connect(&url).await.unwrap();
        (dir, db)
    }

    fn track<'a>(field: &'a str, url: &'a str, isrc: Option<&'a str>) -> CatalogTrack<'a> {
        CatalogTrack {
            track_id: "USABC_Song",
            title: "Song",
            artists: "Artist",
            bpm: Some(124),
            key: None,
            isrc,
            label: None,
            release_date: None,
            genre: None,
            album: None,
            file_field: field,
            file_url: url,
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_file_fields() {
        let (_dir, db) = setup_catalog().await;
        db.upsert(&track("track_file", "http://h/main.mp3", None)).await.unwrap();
        db.upsert(&track("acapella", "http://h/acap.mp3", Some("USABC"))).await.unwrap();

        assert_eq!(
            db.file_url("USABC_Song", "track_file").await.unwrap().as_deref(),
            Some("http://h/main.mp3")
        );
        assert_eq!(
            db.file_url("USABC_Song", "acapella").await.unwrap().as_deref(),
            Some("http://h/acap.mp3")
        );
        assert_eq!(db.file_url("USABC_Song", "instru").await.unwrap(), None);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_unknown_field() {
        let (_dir, db) = setup_catalog().await;
        assert!(db.upsert(&track("title; DROP TABLE tracks", "x", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_schema_info() {
        let (_dir, db) = setup_catalog().await;
        let info = db.schema_info().await.unwrap();
        assert!(info.track_table_exists);
        assert_eq!(info.tables_count, 1);
        assert_eq!(info.track_columns_count, 10 + FILE_FIELDS.len() + 2);
        assert_eq!(info.sample_columns[0], "track_id");
        assert!(info.sample_columns.len() <= SAMPLE_COLUMNS);
    }

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite://data/catalog.db"), Some(Dialect::Sqlite));
        assert_eq!(Dialect::from_url("postgres://u:p@db/x"), Some(Dialect::Postgres));
        assert_eq!(Dialect::from_url("postgresql://db/x"), Some(Dialect::Postgres));
        assert_eq!(Dialect::from_url("mysql://db/x"), None);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Sqlite.placeholders(3), "?, ?, ?");
        assert_eq!(Dialect::Postgres.placeholders(3), "$1, $2, $3");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = CatalogDb::connect("mysql://user:secret@db/x").await.err().unwrap();
        let message = err.to_string();
        assert!(message.contains("unsupported DATABASE_URL scheme"));
        assert!(!message.contains("secret"));
    }

    #[tokio::test]
    async fn test_sqlite_catalog_reports_dialect() {
        let (_dir, db) = setup_catalog().await;
        assert_eq!(db.dialect(), Dialect::Sqlite);
        assert!(db.ping().await);
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("postgres://user:secret@db:5432/x"), "postgres://user:***@db:5432/x");
        assert_eq!(redact("sqlite://data/catalog.db"), "sqlite://data/catalog.db");
    }
}
