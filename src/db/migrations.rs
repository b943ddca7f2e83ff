//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Connect to database with foreign key enforcement and WAL mode
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Close the database connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        // Create schema version table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        // Check current version
        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        // Apply migrations
        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: Create initial schema
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        // Wrap migration in a transaction so partial failures don't leave the DB in a broken state
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            Self::create_subscription_schema(conn).await?;
            Self::create_items_schema(conn).await?;
            Self::create_catalog_schema(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v1: {}",
                            e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Database migration v1 complete");
        Ok(())
    }

    /// Create sources, rules, bindings, and log tables
    async fn create_subscription_schema(conn: &mut SqliteConnection) -> Result<()> {
        for (name, sql) in [
            (
                "sources",
                r#"
                CREATE TABLE sources (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    cron_expr TEXT NOT NULL,
                    adapter TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "rules",
                r#"
                CREATE TABLE rules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    script TEXT NOT NULL,
                    parser_meta TEXT,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "source_rules",
                r#"
                CREATE TABLE source_rules (
                    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                    rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                    PRIMARY KEY (source_id, rule_id)
                )
                "#,
            ),
            (
                "fetch_logs",
                r#"
                CREATE TABLE fetch_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                    status INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "parse_logs",
                r#"
                CREATE TABLE parse_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                    status INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
        ] {
            sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to create {} table: {}",
                    name, e
                )))
            })?;
        }

        Ok(())
    }

    /// Create the download_items table.
    ///
    /// `url_hash` carries the UNIQUE constraint that enforces at-most-once
    /// admission, including across concurrent writers and process instances.
    async fn create_items_schema(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE download_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                url_hash TEXT NOT NULL UNIQUE,
                source_id INTEGER REFERENCES sources(id) ON DELETE SET NULL,
                rule_id INTEGER REFERENCES rules(id) ON DELETE SET NULL,
                log_id INTEGER REFERENCES parse_logs(id) ON DELETE SET NULL,
                adapter TEXT NOT NULL,
                entry_json TEXT,
                status INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                dest_dir TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create download_items table: {}",
                e
            )))
        })?;

        sqlx::query("CREATE INDEX idx_items_status ON download_items(status)")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to create items status index: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Create series, episodes, and media tables
    async fn create_catalog_schema(conn: &mut SqliteConnection) -> Result<()> {
        for (name, sql) in [
            (
                "series",
                r#"
                CREATE TABLE series (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    season TEXT NOT NULL,
                    norm_key TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "episodes",
                r#"
                CREATE TABLE episodes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    series_id INTEGER NOT NULL REFERENCES series(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    no TEXT NOT NULL,
                    pub_at INTEGER,
                    media_id INTEGER,
                    created_at INTEGER NOT NULL,
                    UNIQUE (series_id, title, no)
                )
                "#,
            ),
            (
                "media",
                r#"
                CREATE TABLE media (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    download_item_id INTEGER REFERENCES download_items(id) ON DELETE SET NULL,
                    file_path TEXT NOT NULL,
                    file_hash TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    is_public INTEGER NOT NULL DEFAULT 0,
                    episode_id INTEGER REFERENCES episodes(id) ON DELETE SET NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (download_item_id, file_path)
                )
                "#,
            ),
        ] {
            sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to create {} table: {}",
                    name, e
                )))
            })?;
        }

        Ok(())
    }

    /// Record that a migration version was applied
    async fn record_migration(conn: &mut SqliteConnection, version: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration version {}: {}",
                    version, e
                )))
            })?;
        Ok(())
    }
}
