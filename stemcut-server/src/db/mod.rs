//! Database access for stemcut-server
//!
//! Two databases: the local `stemcut.db` (upload history) that always exists,
//! and the catalog database written in database mode.

pub mod catalog;
pub mod history;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

pub use catalog::{CatalogDb, SchemaInfo};

/// Initialize the local database pool, creating the file if needed
pub async fn init_local_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_local_tables(&pool).await?;

    Ok(pool)
}

/// Create the local tables if they don't exist
pub async fn init_local_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            session_id TEXT NOT NULL,
            status TEXT NOT NULL,
            track_type TEXT NOT NULL DEFAULT 'Unknown',
            error TEXT,
            uploaded_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_upload_history_filename ON upload_history(filename)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (upload_history)");

    Ok(())
}
