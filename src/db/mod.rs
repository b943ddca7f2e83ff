//! Database layer for feedpipe
//!
//! Handles SQLite persistence for sources, rules, logs, download items, and the
//! materialized catalog.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`sources`] — Subscription source CRUD and rule bindings
//! - [`rules`] — Rule script CRUD
//! - [`logs`] — Fetch/parse attempt logs
//! - [`items`] — Download item CRUD and the dedup uniqueness boundary
//! - [`catalog`] — Series/Episode/Media upserts by natural key

use sqlx::{FromRow, sqlite::SqlitePool};

mod catalog;
mod items;
mod logs;
mod migrations;
mod rules;
mod sources;

pub use logs::LogKind;

/// Subscription source record from database
#[derive(Debug, Clone, FromRow)]
pub struct SourceRow {
    /// Unique database ID
    pub id: i64,
    /// Source display name
    pub name: String,
    /// Feed URL
    pub url: String,
    /// Cron expression driving the fetch schedule
    pub cron_expr: String,
    /// Adapter used for items admitted from this source (NULL = configured default)
    pub adapter: Option<String>,
    /// Whether the source is scheduled (0 = disabled, 1 = enabled)
    pub enabled: i32,
    /// Unix timestamp when the source was created
    pub created_at: i64,
}

/// Parameters for inserting a new subscription source
pub struct InsertSourceParams<'a> {
    /// Source display name
    pub name: &'a str,
    /// Feed URL
    pub url: &'a str,
    /// Cron expression (6/7-field, seconds included)
    pub cron_expr: &'a str,
    /// Optional adapter override
    pub adapter: Option<&'a str>,
    /// Whether the source is scheduled
    pub enabled: bool,
}

/// Rule record from database
#[derive(Debug, Clone, FromRow)]
pub struct RuleRow {
    /// Unique database ID
    pub id: i64,
    /// Rule display name
    pub name: String,
    /// Sandboxed script text (or a "module:export" delegate reference)
    pub script: String,
    /// Free-form parser metadata, opaque to the orchestrator
    pub parser_meta: Option<String>,
    /// Unix timestamp when the rule was created
    pub created_at: i64,
}

/// Parameters for inserting a new rule
pub struct InsertRuleParams<'a> {
    /// Rule display name
    pub name: &'a str,
    /// Script text or delegate reference
    pub script: &'a str,
    /// Free-form parser metadata
    pub parser_meta: Option<&'a str>,
}

/// Fetch/parse log record from database
///
/// Append-only: a row is inserted pending and finalized exactly once with a
/// terminal status; it is never mutated afterwards.
#[derive(Debug, Clone, FromRow)]
pub struct LogRow {
    /// Unique database ID
    pub id: i64,
    /// Source this attempt belongs to
    pub source_id: i64,
    /// Attempt status (see [`crate::types::LogStatus`])
    pub status: i32,
    /// Error text for failed attempts
    pub error: Option<String>,
    /// Unix timestamp when the attempt started
    pub created_at: i64,
}

/// Download item record from database
#[derive(Debug, Clone, FromRow)]
pub struct ItemRow {
    /// Unique database ID
    pub id: i64,
    /// Candidate URL handed to the backend
    pub url: String,
    /// SHA-256 of the URL — UNIQUE, the dedup boundary
    pub url_hash: String,
    /// Originating source (nulled on source deletion)
    pub source_id: Option<i64>,
    /// Rule that accepted the entry (nulled on rule deletion)
    pub rule_id: Option<i64>,
    /// Parse log of the admitting cycle
    pub log_id: Option<i64>,
    /// Adapter that owns (or owned) the backend task
    pub adapter: String,
    /// JSON snapshot of the feed entry, for post-download `describe`
    pub entry_json: Option<String>,
    /// Current status (see [`crate::types::DownloadStatus`])
    pub status: i32,
    /// Error text for failed items
    pub error_message: Option<String>,
    /// Working directory derived from the URL hash
    pub dest_dir: String,
    /// Unix timestamp when the item was admitted
    pub created_at: i64,
    /// Unix timestamp when the backend task was created
    pub started_at: Option<i64>,
    /// Unix timestamp when the item reached a terminal status
    pub completed_at: Option<i64>,
}

/// New download item to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewItem {
    /// Candidate URL
    pub url: String,
    /// Precomputed SHA-256 of the URL
    pub url_hash: String,
    /// Originating source, if any
    pub source_id: Option<i64>,
    /// Accepting rule, if any
    pub rule_id: Option<i64>,
    /// Parse log of the admitting cycle, if any
    pub log_id: Option<i64>,
    /// Adapter name the item will be started on
    pub adapter: String,
    /// JSON snapshot of the feed entry
    pub entry_json: Option<String>,
    /// Working directory for the backend task
    pub dest_dir: String,
}

/// Series record from database
#[derive(Debug, Clone, FromRow)]
pub struct SeriesRow {
    /// Unique database ID
    pub id: i64,
    /// Series name as supplied by the descriptor
    pub name: String,
    /// Season label as supplied by the descriptor
    pub season: String,
    /// Normalized natural key — UNIQUE
    pub norm_key: String,
    /// Unix timestamp when the series was created
    pub created_at: i64,
}

/// Episode record from database
#[derive(Debug, Clone, FromRow)]
pub struct EpisodeRow {
    /// Unique database ID
    pub id: i64,
    /// Owning series
    pub series_id: i64,
    /// Episode title — natural key with `no` within the series
    pub title: String,
    /// Episode number label
    pub no: String,
    /// Publication timestamp
    pub pub_at: Option<i64>,
    /// Linked media record, if any
    pub media_id: Option<i64>,
    /// Unix timestamp when the episode was created
    pub created_at: i64,
}

/// Media record from database
///
/// Always created for a produced file, whether or not `describe` classified it;
/// undescribed files remain queryable as orphan media.
#[derive(Debug, Clone, FromRow)]
pub struct MediaRow {
    /// Unique database ID
    pub id: i64,
    /// Download item that produced the file (nulled on item deletion)
    pub download_item_id: Option<i64>,
    /// Stored file path in the content store
    pub file_path: String,
    /// Content hash of the stored file
    pub file_hash: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Whether the media is publicly visible (0 = no, 1 = yes)
    pub is_public: i32,
    /// Episode the file is linked to, if classified
    pub episode_id: Option<i64>,
    /// Unix timestamp when the record was created
    pub created_at: i64,
}

/// New media record to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewMedia {
    /// Producing download item
    pub download_item_id: Option<i64>,
    /// Stored file path
    pub file_path: String,
    /// Content hash
    pub file_hash: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Whether the media is publicly visible
    pub is_public: bool,
}

/// Database handle for feedpipe
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
