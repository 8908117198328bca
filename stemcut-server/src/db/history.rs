//! Upload history
//!
//! One row per upload, updated as the file moves through the pipeline.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// Default number of rows returned by [`list`]
pub const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadRecord {
    pub id: i64,
    pub filename: String,
    pub session_id: String,
    pub status: String,
    pub track_type: String,
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record a new upload
pub async fn insert(
    pool: &SqlitePool,
    filename: &str,
    session_id: &str,
    status: &str,
    track_type: &str,
) -> Result<i64> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO upload_history (filename, session_id, status, track_type, uploaded_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(filename)
    .bind(session_id)
    .bind(status)
    .bind(track_type)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Update the most recent record of a file
///
/// `track_type` and `error` are only overwritten when given. Returns false
/// when the file has no history.
pub async fn update_status(
    pool: &SqlitePool,
    filename: &str,
    status: &str,
    track_type: Option<&str>,
    error: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE upload_history
        SET status = ?,
            track_type = COALESCE(?, track_type),
            error = COALESCE(?, error),
            updated_at = ?
        WHERE id = (SELECT MAX(id) FROM upload_history WHERE filename = ?)
        "#,
    )
    .bind(status)
    .bind(track_type)
    .bind(error)
    .bind(Utc::now())
    .bind(filename)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Most recent records first
pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<UploadRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, filename, session_id, status, track_type, error, uploaded_at, updated_at
        FROM upload_history
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(limit.max(0))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(UploadRecord {
                id: row.try_get("id")?,
                filename: row.try_get("filename")?,
                session_id: row.try_get("session_id")?,
                status: row.try_get("status")?,
                track_type: row.try_get("track_type")?,
                error: row.try_get("error")?,
                uploaded_at: row.try_get("uploaded_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_history")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Remove all history rows (full cleanup)
pub async fn clear(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM upload_history").execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::init_local_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_insert_and_list_most_recent_first() {
        let pool = setup_pool().await;
        insert(&pool, "a.mp3", "s1", "uploaded", "Unknown").await.unwrap();
        insert(&pool, "b.mp3", "s1", "uploaded", "Unknown").await.unwrap();

        let records = list(&pool, DEFAULT_LIMIT).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].filename, "b.mp3");
        assert_eq!(count(&pool).await.unwrap(), 2);

        assert_eq!(list(&pool, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_keeps_unset_fields() {
        let pool = setup_pool().await;
        insert(&pool, "a.mp3", "s1", "uploaded", "Unknown").await.unwrap();

        assert!(update_status(&pool, "a.mp3", "processing", Some("Instrumental"), None).await.unwrap());
        assert!(update_status(&pool, "a.mp3", "failed", None, Some("boom")).await.unwrap());

        let record = &list(&pool, 10).await.unwrap()[0];
        assert_eq!(record.status, "failed");
        assert_eq!(record.track_type, "Instrumental");
        assert_eq!(record.error.as_deref(), Some("boom"));

        assert!(!update_status(&pool, "missing.mp3", "failed", None, None).await.unwrap());
    }
}
