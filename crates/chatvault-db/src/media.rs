//! Read-only access to media and chat groups written by the ingestion adapter.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use chatvault_core::{Error, GroupDirectory, MediaItem, MediaRepository, MediaType, Result};

const MEDIA_COLUMNS: &str = "m.id, m.group_id, m.message_id, m.file_path, m.mime_type, m.media_type";

/// PostgreSQL implementation of [`MediaRepository`].
#[derive(Clone)]
pub struct PgMediaRepository {
    pool: Pool<Postgres>,
}

impl PgMediaRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_media_row(row: PgRow) -> MediaItem {
        MediaItem {
            id: row.get("id"),
            group_id: row.get("group_id"),
            message_id: row.get("message_id"),
            file_path: row.get("file_path"),
            mime_type: row.get("mime_type"),
            // Unknown kinds from newer adapters are never OCR candidates.
            media_type: row
                .get::<String, _>("media_type")
                .parse()
                .unwrap_or(MediaType::Other),
        }
    }
}

#[async_trait]
impl MediaRepository for PgMediaRepository {
    async fn get(&self, media_id: Uuid) -> Result<Option<MediaItem>> {
        let row = sqlx::query(&format!("SELECT {MEDIA_COLUMNS} FROM media m WHERE m.id = $1"))
            .bind(media_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(Self::parse_media_row))
    }

    async fn find_ocr_candidates(&self, group_id: Option<Uuid>) -> Result<Vec<MediaItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media m
             JOIN chat_groups g ON g.id = m.group_id
             WHERE g.is_monitored
               AND m.media_type = ANY($1)
               AND ($2::uuid IS NULL OR m.group_id = $2)
             ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(MediaType::ocr_eligible_strs())
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_media_row).collect())
    }

    async fn find_bundle_by_message(&self, message_id: &str) -> Result<Vec<MediaItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media m
             WHERE m.message_id = $1 AND m.media_type IN ('image', 'sticker')
             ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_media_row).collect())
    }
}

/// PostgreSQL implementation of [`GroupDirectory`].
#[derive(Clone)]
pub struct PgGroupDirectory {
    pool: Pool<Postgres>,
}

impl PgGroupDirectory {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupDirectory for PgGroupDirectory {
    async fn is_monitored(&self, group_id: Uuid) -> Result<bool> {
        let monitored: Option<bool> =
            sqlx::query_scalar("SELECT is_monitored FROM chat_groups WHERE id = $1")
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        // A deleted group is treated as unmonitored.
        Ok(monitored.unwrap_or(false))
    }
}
