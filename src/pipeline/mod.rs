//! Core orchestrator implementation split into focused submodules.
//!
//! The `FeedPipeline` struct and its methods are organized by domain:
//! - [`admit`] - Candidate admission and URL dedup
//! - [`tracker`] - Backend task creation and event tracking
//! - [`control`] - Item lifecycle control (pause/unpause/remove/state)

mod admit;
mod control;
mod tracker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use admit::{AdmitOrigin, AdmitOutcome};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::adapters::{AdapterRegistry, DownloadTask, LocalAdapter, RpcAdapter};
use crate::config::Config;
use crate::db::Database;
use crate::descriptor::DescriptorPipeline;
use crate::error::{Error, Result};
use crate::sandbox::RuleSandbox;
use crate::store::LocalContentStore;
use crate::types::{DownloadStatus, Event, ItemId};

/// Live backend task tracking
#[derive(Clone)]
pub(crate) struct TaskState {
    /// Map of items with a live backend task (for control commands and state queries)
    pub(crate) active_tasks:
        Arc<tokio::sync::Mutex<HashMap<ItemId, Arc<dyn DownloadTask>>>>,
    /// Flag to indicate whether new admissions are accepted (cleared during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

/// Main orchestrator instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct FeedPipeline {
    /// Database instance for persistence (wrapped in Arc for sharing across tasks)
    /// Public for integration tests to query item status
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Rule sandbox owning the delegate registry and script budgets
    pub(crate) sandbox: Arc<RuleSandbox>,
    /// Feed fetcher shared by scheduler cycles
    pub(crate) fetcher: Arc<crate::feed::FeedFetcher>,
    /// Registered downloader backends
    pub(crate) adapters: Arc<AdapterRegistry>,
    /// Post-download cataloging pipeline
    pub(crate) descriptor: Arc<DescriptorPipeline>,
    /// Live backend task tracking
    pub(crate) task_state: TaskState,
}

impl FeedPipeline {
    /// Create a new FeedPipeline instance with the default adapter set.
    ///
    /// This initializes all core components:
    /// - Opens/creates the SQLite database and runs migrations
    /// - Registers the local fetch adapter, plus the RPC adapter when a
    ///   backend is configured
    /// - Sets up the event broadcast channel
    pub async fn new(config: Config) -> Result<Self> {
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(LocalAdapter::new()?));
        if let Some(rpc) = &config.rpc_backend {
            adapters.register(Arc::new(RpcAdapter::new(rpc, config.retry.clone())?));
        }

        Self::with_adapters(config, adapters).await
    }

    /// Create a FeedPipeline with a caller-supplied adapter registry.
    ///
    /// Lets embedders plug in their own [`crate::adapters::DownloaderAdapter`]
    /// implementations alongside or instead of the built-in backends.
    pub async fn with_adapters(config: Config, adapters: AdapterRegistry) -> Result<Self> {
        config.validate()?;

        // Ensure working and store directories exist
        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;
        tokio::fs::create_dir_all(&config.persistence.store_root)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create store root '{}': {}",
                        config.persistence.store_root.display(),
                        e
                    ),
                ))
            })?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);

        // Buffer of 1000 events; multiple subscribers each receive all events
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let sandbox = Arc::new(RuleSandbox::new(config.sandbox.clone()));
        let fetcher = Arc::new(crate::feed::FeedFetcher::new()?);
        let store = Arc::new(LocalContentStore::new(
            config.persistence.store_root.clone(),
        ));
        let descriptor = Arc::new(DescriptorPipeline::new(db.clone(), store));

        let task_state = TaskState {
            active_tasks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
        };

        info!(
            adapters = ?adapters.names(),
            database = %config.persistence.database_path.display(),
            "Pipeline initialized"
        );

        Ok(Self {
            db,
            event_tx,
            config: Arc::new(config),
            sandbox,
            fetcher,
            adapters: Arc::new(adapters),
            descriptor,
            task_state,
        })
    }

    /// Subscribe to pipeline events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events
    /// independently. Events are buffered, but a subscriber that falls behind
    /// by more than 1000 events receives a `RecvError::Lagged` error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use feedpipe::{Config, FeedPipeline};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let pipeline = FeedPipeline::new(Config::default()).await?;
    ///
    ///     let mut events = pipeline.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             tracing::info!(?event, "pipeline event");
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Names of the registered downloader adapters
    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.names()
    }

    /// Register a native delegate module for `module:export` rules.
    ///
    /// Rules whose script is a delegate reference resolve against this
    /// registry at load time.
    pub fn register_rule_module(&self, key: &str, hooks: Arc<dyn crate::sandbox::RuleHooks>) {
        self.sandbox.register_module(key, hooks);
    }

    /// Register a subscription source after validating its cron expression.
    pub async fn add_source(&self, params: crate::db::InsertSourceParams<'_>) -> Result<i64> {
        if let Err(e) = <cron::Schedule as std::str::FromStr>::from_str(params.cron_expr) {
            return Err(Error::Config {
                message: format!("invalid cron expression '{}': {}", params.cron_expr, e),
                key: Some("cron_expr".to_string()),
            });
        }
        self.db.insert_source(params).await
    }

    /// Register a rule after compile-checking its script.
    ///
    /// Rejecting broken scripts at registration keeps cycle-time compile
    /// failures limited to rules that stopped compiling after an edit.
    pub async fn add_rule(&self, params: crate::db::InsertRuleParams<'_>) -> Result<i64> {
        let vm = self.sandbox.load(params.script).await?;
        vm.release();
        self.db.insert_rule(params).await
    }

    /// Bind a rule to a source for its future cycles
    pub async fn bind_rule(&self, source_id: i64, rule_id: i64) -> Result<()> {
        self.db.bind_rule(source_id, rule_id).await
    }

    /// Stop accepting new admissions.
    ///
    /// Live backend tasks keep running and their events keep being tracked;
    /// only new work is refused. Terminal persistence makes a later restart
    /// pick up where this instance left off.
    pub async fn shutdown(&self) {
        self.task_state.accepting_new.store(false, Ordering::SeqCst);

        let active = self.task_state.active_tasks.lock().await.len();
        info!(active_tasks = active, "Pipeline shutting down, admissions closed");
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped
    /// (ok() converts Err to None); tracking never depends on listeners.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Per-item working directory, derived from the item's dedup hash so it
    /// is computable before the row exists and stable across restarts.
    pub(crate) fn dest_dir_for(&self, url_hash: &str) -> std::path::PathBuf {
        self.config
            .download
            .download_dir
            .join(format!("item-{}", &url_hash[..12.min(url_hash.len())]))
    }

    /// Persist a status transition after checking legality.
    ///
    /// Returns whether the transition was applied. An illegal transition is
    /// logged and skipped rather than escalated, so a stray backend event can
    /// never resurrect a terminal item.
    pub(crate) async fn transition(&self, id: ItemId, to: DownloadStatus) -> Result<bool> {
        let item = self
            .db
            .get_item(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("download item {} not found", id)))?;

        let current = DownloadStatus::from_i32(item.status);
        if current == to {
            return Ok(false);
        }
        if !current.can_transition_to(to) {
            warn!(
                item_id = %id,
                from = %current,
                to = %to,
                "Ignoring illegal status transition"
            );
            return Ok(false);
        }

        self.db.update_item_status(id, to).await?;
        Ok(true)
    }
}
