//! Subscription source CRUD and rule bindings.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, InsertSourceParams, RuleRow, SourceRow};

impl Database {
    /// Insert a new subscription source
    pub async fn insert_source(&self, params: InsertSourceParams<'_>) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO sources (name, url, cron_expr, adapter, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(params.name)
        .bind(params.url)
        .bind(params.cron_expr)
        .bind(params.adapter)
        .bind(params.enabled as i32)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert source: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a source by ID
    pub async fn get_source(&self, id: i64) -> Result<Option<SourceRow>> {
        let row = sqlx::query_as::<_, SourceRow>(
            "SELECT id, name, url, cron_expr, adapter, enabled, created_at FROM sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get source: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List all enabled sources (the scheduler's working set)
    pub async fn list_enabled_sources(&self) -> Result<Vec<SourceRow>> {
        let rows = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT id, name, url, cron_expr, adapter, enabled, created_at
            FROM sources
            WHERE enabled = 1
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list enabled sources: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Enable or disable a source
    pub async fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE sources SET enabled = ? WHERE id = ?")
            .bind(enabled as i32)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set source enabled: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Delete a source.
    ///
    /// Cascades its fetch/parse logs and rule bindings; download item
    /// references are nulled, not deleted — in-flight items continue.
    pub async fn delete_source(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete source: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Bind a rule to a source (idempotent)
    pub async fn bind_rule(&self, source_id: i64, rule_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO source_rules (source_id, rule_id) VALUES (?, ?)")
            .bind(source_id)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to bind rule: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Unbind a rule from a source
    pub async fn unbind_rule(&self, source_id: i64, rule_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM source_rules WHERE source_id = ? AND rule_id = ?")
            .bind(source_id)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to unbind rule: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// List the rules bound to a source
    pub async fn rules_for_source(&self, source_id: i64) -> Result<Vec<RuleRow>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT r.id, r.name, r.script, r.parser_meta, r.created_at
            FROM rules r
            JOIN source_rules sr ON sr.rule_id = r.id
            WHERE sr.source_id = ?
            ORDER BY r.id ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list rules for source: {}",
                e
            )))
        })?;

        Ok(rows)
    }
}
