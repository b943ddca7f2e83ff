//! Download item CRUD and the dedup uniqueness boundary.

use crate::error::DatabaseError;
use crate::types::{DownloadStatus, ItemId};
use crate::{Error, Result};

use super::{Database, ItemRow, NewItem};

const ITEM_COLUMNS: &str = "id, url, url_hash, source_id, rule_id, log_id, adapter, entry_json, \
     status, error_message, dest_dir, created_at, started_at, completed_at";

impl Database {
    /// Insert a new download item in Pending status.
    ///
    /// The `url_hash` UNIQUE constraint is the authoritative dedup boundary:
    /// a conflict maps to [`DatabaseError::ConstraintViolation`], which the
    /// orchestrator translates into a duplicate admission. This holds under
    /// concurrent writers and across process instances — no in-process lock
    /// is involved.
    pub async fn insert_item(&self, item: &NewItem) -> Result<ItemId> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO download_items (
                url, url_hash, source_id, rule_id, log_id, adapter,
                entry_json, status, dest_dir, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.url)
        .bind(&item.url_hash)
        .bind(item.source_id)
        .bind(item.rule_id)
        .bind(item.log_id)
        .bind(&item.adapter)
        .bind(&item.entry_json)
        .bind(DownloadStatus::Pending.to_i32())
        .bind(&item.dest_dir)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e
                && db_err.is_unique_violation()
            {
                return Error::Database(DatabaseError::ConstraintViolation(format!(
                    "url_hash already admitted: {}",
                    item.url_hash
                )));
            }
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert download item: {}",
                e
            )))
        })?;

        Ok(ItemId(result.last_insert_rowid()))
    }

    /// Get a download item by ID
    pub async fn get_item(&self, id: ItemId) -> Result<Option<ItemRow>> {
        let sql = format!("SELECT {} FROM download_items WHERE id = ?", ITEM_COLUMNS);
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get download item: {}",
                    e
                )))
            })?;

        Ok(row)
    }

    /// Get a download item by its URL hash (resolves the winner of a dedup conflict)
    pub async fn get_item_by_hash(&self, url_hash: &str) -> Result<Option<ItemRow>> {
        let sql = format!(
            "SELECT {} FROM download_items WHERE url_hash = ?",
            ITEM_COLUMNS
        );
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(url_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get download item by hash: {}",
                    e
                )))
            })?;

        Ok(row)
    }

    /// List all download items, oldest first
    pub async fn list_items(&self) -> Result<Vec<ItemRow>> {
        let sql = format!(
            "SELECT {} FROM download_items ORDER BY created_at ASC, id ASC",
            ITEM_COLUMNS
        );
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list download items: {}",
                    e
                )))
            })?;

        Ok(rows)
    }

    /// Update item status
    pub async fn update_item_status(&self, id: ItemId, status: DownloadStatus) -> Result<()> {
        sqlx::query("UPDATE download_items SET status = ? WHERE id = ?")
            .bind(status.to_i32())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update item status: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Set item error message
    pub async fn set_item_error(&self, id: ItemId, error: &str) -> Result<()> {
        sqlx::query("UPDATE download_items SET error_message = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set item error: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Set item started timestamp
    pub async fn set_item_started(&self, id: ItemId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE download_items SET started_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set item started timestamp: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Set item completed timestamp
    pub async fn set_item_completed(&self, id: ItemId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE download_items SET completed_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set item completed timestamp: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Delete a download item.
    ///
    /// Only performed on explicit user request; re-downloading a URL requires
    /// this deletion first, because the hash row is what blocks re-admission.
    pub async fn delete_item(&self, id: ItemId) -> Result<()> {
        sqlx::query("DELETE FROM download_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete download item: {}",
                    e
                )))
            })?;

        Ok(())
    }
}
