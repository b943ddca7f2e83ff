//! Error types for feedpipe
//!
//! This module provides comprehensive error handling for the library, including:
//! - Domain-specific error types (Sandbox, Download, Database, etc.)
//! - A capture-granularity policy: per-entry and per-file errors are recorded
//!   and contained, only source-level fetch/parse setup errors abort a cycle
//! - Context information (item ID, hook name, adapter name, etc.)

use thiserror::Error;

/// Result type alias for feedpipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for feedpipe
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Rule sandbox error (compile failure, hook timeout, hook runtime error)
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Feed could not be parsed as RSS or Atom
    #[error("feed parse error: {0}")]
    FeedParse(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Duplicate URL admission — the hash already maps to an existing item.
    ///
    /// This is the authoritative dedup signal; callers treat it as a no-op
    /// skip, not a user-visible failure.
    #[error("duplicate url: already admitted as item {existing_id}")]
    Duplicate {
        /// ID of the already-admitted download item for this URL hash
        existing_id: i64,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Rule sandbox errors
///
/// Every variant is containable: a compile error marks the rule inactive for
/// the cycle, a hook error resolves that single call to its reject/null value.
/// None of these ever escalates to a process-level fault.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Script failed to compile (syntax error, unknown delegate, or compile budget exceeded)
    #[error("rule script failed to compile: {message}")]
    Compile {
        /// Raw diagnostic text from the script engine
        message: String,
    },

    /// A single hook call exceeded its wall-clock budget
    #[error("rule hook '{hook}' timed out after {budget_ms}ms")]
    HookTimeout {
        /// Hook name ("validate" or "describe")
        hook: &'static str,
        /// Budget that was exceeded, in milliseconds
        budget_ms: u64,
    },

    /// A single hook call raised a runtime error
    #[error("rule hook '{hook}' failed: {message}")]
    HookRuntime {
        /// Hook name ("validate" or "describe")
        hook: &'static str,
        /// Raw diagnostic text from the script engine
        message: String,
    },
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Download item not found
    #[error("download item {id} not found")]
    NotFound {
        /// The item ID that was not found
        id: i64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} item {id} in state {current_state}")]
    InvalidState {
        /// The item ID that is in an invalid state for the operation
        id: i64,
        /// The operation that was attempted (e.g., "pause", "unpause")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// No adapter registered under the requested name
    #[error("unknown downloader adapter: {name}")]
    UnknownAdapter {
        /// The adapter name that was requested
        name: String,
    },

    /// Adapter transport is down — new task creation is refused until recovery.
    ///
    /// Surfaced once at the orchestrator level rather than failing every
    /// candidate individually.
    #[error("downloader backend '{adapter}' unavailable: {reason}")]
    BackendUnavailable {
        /// The adapter whose transport is down
        adapter: String,
        /// Last transport error
        reason: String,
    },

    /// A control command (pause/unpause/remove) got no backend confirmation in time.
    ///
    /// Distinct from failed-to-execute: the command may still take effect, and
    /// item state is reconciled on the next state poll.
    #[error("no backend confirmation for {operation} on item {id} within {timeout_ms}ms")]
    ConfirmationTimeout {
        /// The item the command targeted
        id: i64,
        /// The operation that went unconfirmed
        operation: String,
        /// The confirmation timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Backend rejected or failed the task
    #[error("backend task failed: {message}")]
    Backend {
        /// Backend-reported failure detail
        message: String,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_error_carries_existing_id() {
        let err = Error::Duplicate { existing_id: 42 };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn confirmation_timeout_is_distinct_from_backend_failure() {
        let confirm = DownloadError::ConfirmationTimeout {
            id: 1,
            operation: "pause".to_string(),
            timeout_ms: 5000,
        };
        let exec = DownloadError::Backend {
            message: "disk full".to_string(),
        };
        assert!(confirm.to_string().contains("confirmation"));
        assert!(!exec.to_string().contains("confirmation"));
    }

    #[test]
    fn sandbox_errors_name_the_hook() {
        let err = SandboxError::HookTimeout {
            hook: "validate",
            budget_ms: 3000,
        };
        assert!(err.to_string().contains("validate"));
        assert!(err.to_string().contains("3000"));
    }
}
