//! Series/Episode/Media persistence for the descriptor pipeline.
//!
//! All identity here is natural-key identity: series by normalized
//! (name, season), episodes by (series, title, no), media by
//! (download item, file path). Constraint conflicts from concurrent writers
//! are resolved by re-selecting the winning row.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, EpisodeRow, MediaRow, NewMedia, SeriesRow};

impl Database {
    /// Get a series by its normalized natural key
    pub async fn get_series_by_key(&self, norm_key: &str) -> Result<Option<SeriesRow>> {
        let row = sqlx::query_as::<_, SeriesRow>(
            "SELECT id, name, season, norm_key, created_at FROM series WHERE norm_key = ?",
        )
        .bind(norm_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get series: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Insert a series, or return the existing row on a key collision.
    ///
    /// The UNIQUE constraint on `norm_key` arbitrates concurrent upserts for
    /// the same series; the loser re-selects the winner's row.
    pub async fn upsert_series(&self, name: &str, season: &str, norm_key: &str) -> Result<SeriesRow> {
        if let Some(existing) = self.get_series_by_key(norm_key).await? {
            return Ok(existing);
        }

        let now = chrono::Utc::now().timestamp();
        let inserted = sqlx::query(
            "INSERT INTO series (name, season, norm_key, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(season)
        .bind(norm_key)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(result) => Ok(SeriesRow {
                id: result.last_insert_rowid(),
                name: name.to_string(),
                season: season.to_string(),
                norm_key: norm_key.to_string(),
                created_at: now,
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // Lost the insert race; the other writer's row is authoritative.
                self.get_series_by_key(norm_key).await?.ok_or_else(|| {
                    Error::Database(DatabaseError::NotFound(format!(
                        "series vanished after conflict: {}",
                        norm_key
                    )))
                })
            }
            Err(e) => Err(Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert series: {}",
                e
            )))),
        }
    }

    /// Get an episode by its natural key within a series
    pub async fn get_episode(
        &self,
        series_id: i64,
        title: &str,
        no: &str,
    ) -> Result<Option<EpisodeRow>> {
        let row = sqlx::query_as::<_, EpisodeRow>(
            r#"
            SELECT id, series_id, title, no, pub_at, media_id, created_at
            FROM episodes
            WHERE series_id = ? AND title = ? AND no = ?
            "#,
        )
        .bind(series_id)
        .bind(title)
        .bind(no)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get episode: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Insert a new episode
    pub async fn insert_episode(
        &self,
        series_id: i64,
        title: &str,
        no: &str,
        pub_at: Option<i64>,
        media_id: Option<i64>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO episodes (series_id, title, no, pub_at, media_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(series_id)
        .bind(title)
        .bind(no)
        .bind(pub_at)
        .bind(media_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e
                && db_err.is_unique_violation()
            {
                return Error::Database(DatabaseError::ConstraintViolation(format!(
                    "episode already exists: {} #{}",
                    title, no
                )));
            }
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert episode: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Replace an existing episode's fields and file linkage (overwrite path)
    pub async fn replace_episode(
        &self,
        id: i64,
        pub_at: Option<i64>,
        media_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE episodes SET pub_at = ?, media_id = ? WHERE id = ?")
            .bind(pub_at)
            .bind(media_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to replace episode: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Insert a media record, or return the existing one for the same
    /// (item, file path) pair — makes re-running the descriptor pipeline
    /// idempotent at the media level too.
    pub async fn upsert_media(&self, media: &NewMedia) -> Result<MediaRow> {
        let now = chrono::Utc::now().timestamp();

        let inserted = sqlx::query(
            r#"
            INSERT INTO media (
                download_item_id, file_path, file_hash, name,
                description, is_public, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(media.download_item_id)
        .bind(&media.file_path)
        .bind(&media.file_hash)
        .bind(&media.name)
        .bind(&media.description)
        .bind(media.is_public as i32)
        .bind(now)
        .execute(&self.pool)
        .await;

        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing = self
                    .get_media_by_file(media.download_item_id, &media.file_path)
                    .await?;
                return existing.ok_or_else(|| {
                    Error::Database(DatabaseError::NotFound(format!(
                        "media vanished after conflict: {}",
                        media.file_path
                    )))
                });
            }
            Err(e) => {
                return Err(Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert media: {}",
                    e
                ))));
            }
        };

        self.get_media(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!("media {} not found", id)))
        })
    }

    /// Get a media record by ID
    pub async fn get_media(&self, id: i64) -> Result<Option<MediaRow>> {
        let row = sqlx::query_as::<_, MediaRow>(
            r#"
            SELECT id, download_item_id, file_path, file_hash, name,
                   description, is_public, episode_id, created_at
            FROM media WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get media: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Get a media record by its (item, file path) natural key
    pub async fn get_media_by_file(
        &self,
        download_item_id: Option<i64>,
        file_path: &str,
    ) -> Result<Option<MediaRow>> {
        let row = sqlx::query_as::<_, MediaRow>(
            r#"
            SELECT id, download_item_id, file_path, file_hash, name,
                   description, is_public, episode_id, created_at
            FROM media WHERE download_item_id IS ? AND file_path = ?
            "#,
        )
        .bind(download_item_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get media by file: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Apply descriptor-supplied metadata to a media record
    pub async fn update_media_metadata(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
        is_public: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE media SET name = ?, description = ?, is_public = ? WHERE id = ?")
            .bind(name)
            .bind(description)
            .bind(is_public as i32)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update media metadata: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Link a media record to an episode
    pub async fn link_media_episode(&self, media_id: i64, episode_id: i64) -> Result<()> {
        sqlx::query("UPDATE media SET episode_id = ? WHERE id = ?")
            .bind(episode_id)
            .bind(media_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to link media to episode: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Count series rows (used by idempotence checks)
    pub async fn count_series(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM series")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count series: {}",
                    e
                )))
            })?;
        Ok(count)
    }

    /// Count episode rows (used by idempotence checks)
    pub async fn count_episodes(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM episodes")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count episodes: {}",
                    e
                )))
            })?;
        Ok(count)
    }
}
