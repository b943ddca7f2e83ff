//! # feedpipe
//!
//! Embeddable subscription-download pipeline: watch RSS/Atom feeds, filter
//! entries through sandboxed user rules, hand accepted URLs to pluggable
//! downloader backends, and catalog the completed files.
//!
//! ## Design Philosophy
//!
//! feedpipe is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Sensible defaults** - Works out of the box with the in-process fetch backend
//! - **Sandboxed rules** - User filter/classify scripts run time-boxed and isolated
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedpipe::{Config, FeedPipeline, Scheduler, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = FeedPipeline::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Drive enabled sources on their cron schedules
//!     let scheduler = Arc::new(Scheduler::new(pipeline.clone()));
//!     tokio::spawn(scheduler.clone().run());
//!
//!     run_with_shutdown(pipeline, scheduler).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Downloader backend adapters
pub mod adapters;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Post-download cataloging pipeline
pub mod descriptor;
/// Error types
pub mod error;
/// Feed fetching and normalization
pub mod feed;
/// Core orchestrator implementation (decomposed into focused submodules)
pub mod pipeline;
/// Retry logic with exponential backoff
pub mod retry;
/// Rule script sandbox
pub mod sandbox;
/// Cron-driven source scheduling
pub mod scheduler;
/// Hash-addressed content store
pub mod store;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use adapters::{AdapterRegistry, DownloadTask, DownloaderAdapter, TaskSpec};
pub use config::{Config, RetryConfig, RpcBackendConfig, SandboxConfig};
pub use db::Database;
pub use descriptor::DescribeOutcome;
pub use error::{DatabaseError, DownloadError, Error, Result, SandboxError};
pub use pipeline::{AdmitOrigin, AdmitOutcome, FeedPipeline};
pub use sandbox::{RuleContext, RuleHooks, RuleSandbox, RuleVm};
pub use scheduler::Scheduler;
pub use store::{ContentStore, FileRecord, LocalContentStore};
pub use types::{
    DownloadItemState, DownloadStatus, Entry, Event, FileDescriptor, ItemId, TaskEvent,
};

/// Helper function to run the pipeline with graceful signal handling.
///
/// Waits for a termination signal, stops the scheduler, and closes the
/// pipeline to new admissions.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use feedpipe::{Config, FeedPipeline, Scheduler, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = FeedPipeline::new(Config::default()).await?;
///     let scheduler = Arc::new(Scheduler::new(pipeline.clone()));
///     tokio::spawn(scheduler.clone().run());
///
///     run_with_shutdown(pipeline, scheduler).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(pipeline: FeedPipeline, scheduler: std::sync::Arc<Scheduler>) {
    wait_for_signal().await;
    scheduler.shutdown();
    pipeline.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
