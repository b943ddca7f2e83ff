//! Fetch/parse attempt logs.
//!
//! Both log kinds share one row shape; a row is inserted with status pending
//! and finalized exactly once with a terminal status. Rows bracket one attempt
//! per source and are never mutated after the terminal status is written.

use crate::error::DatabaseError;
use crate::types::LogStatus;
use crate::{Error, Result};

use super::{Database, LogRow};

/// Which attempt log a row belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    /// Feed retrieval attempt
    Fetch,
    /// Rule evaluation / admission attempt
    Parse,
}

impl LogKind {
    fn table(&self) -> &'static str {
        match self {
            LogKind::Fetch => "fetch_logs",
            LogKind::Parse => "parse_logs",
        }
    }
}

impl Database {
    /// Open a new pending log row for a source attempt
    pub async fn insert_log(&self, kind: LogKind, source_id: i64) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        // Table names cannot be bound; LogKind::table is a closed set of constants.
        let sql = format!(
            "INSERT INTO {} (source_id, status, created_at) VALUES (?, ?, ?)",
            kind.table()
        );

        let result = sqlx::query(&sql)
            .bind(source_id)
            .bind(LogStatus::Pending.to_i32())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert {} row: {}",
                    kind.table(),
                    e
                )))
            })?;

        Ok(result.last_insert_rowid())
    }

    /// Write the terminal status (and optional error text) for a log row.
    ///
    /// Only pending rows are updated, so a terminal status is written at most
    /// once.
    pub async fn finalize_log(
        &self,
        kind: LogKind,
        id: i64,
        status: LogStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, error = ? WHERE id = ? AND status = ?",
            kind.table()
        );

        sqlx::query(&sql)
            .bind(status.to_i32())
            .bind(error)
            .bind(id)
            .bind(LogStatus::Pending.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to finalize {} row: {}",
                    kind.table(),
                    e
                )))
            })?;

        Ok(())
    }

    /// Get a log row by ID
    pub async fn get_log(&self, kind: LogKind, id: i64) -> Result<Option<LogRow>> {
        let sql = format!(
            "SELECT id, source_id, status, error, created_at FROM {} WHERE id = ?",
            kind.table()
        );

        let row = sqlx::query_as::<_, LogRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get {} row: {}",
                    kind.table(),
                    e
                )))
            })?;

        Ok(row)
    }

    /// List log rows for a source, newest first
    pub async fn list_logs(&self, kind: LogKind, source_id: i64) -> Result<Vec<LogRow>> {
        let sql = format!(
            "SELECT id, source_id, status, error, created_at FROM {} WHERE source_id = ? ORDER BY id DESC",
            kind.table()
        );

        let rows = sqlx::query_as::<_, LogRow>(&sql)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list {} rows: {}",
                    kind.table(),
                    e
                )))
            })?;

        Ok(rows)
    }
}
