//! Rule script CRUD.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, InsertRuleParams, RuleRow};

impl Database {
    /// Insert a new rule
    pub async fn insert_rule(&self, params: InsertRuleParams<'_>) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        let result =
            sqlx::query("INSERT INTO rules (name, script, parser_meta, created_at) VALUES (?, ?, ?, ?)")
                .bind(params.name)
                .bind(params.script)
                .bind(params.parser_meta)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to insert rule: {}",
                        e
                    )))
                })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a rule by ID
    pub async fn get_rule(&self, id: i64) -> Result<Option<RuleRow>> {
        let row = sqlx::query_as::<_, RuleRow>(
            "SELECT id, name, script, parser_meta, created_at FROM rules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get rule: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Replace a rule's script text.
    ///
    /// Scripts are read at evaluation time, not cached across runs, so the
    /// edit takes effect on the next scheduler tick.
    pub async fn update_rule_script(&self, id: i64, script: &str) -> Result<()> {
        sqlx::query("UPDATE rules SET script = ? WHERE id = ?")
            .bind(script)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update rule script: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Delete a rule.
    ///
    /// Cascades source bindings; download item references are nulled.
    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete rule: {}",
                    e
                )))
            })?;

        Ok(())
    }
}
