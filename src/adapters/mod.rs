//! Downloader backend adapters.
//!
//! Every backend — the in-process HTTP fetch engine and the external JSON-RPC
//! engine — is reached through the same two seams:
//!
//! - [`DownloaderAdapter`] creates backend tasks for admitted items
//! - [`DownloadTask`] is one live transfer: it emits [`TaskEvent`]s, answers
//!   state queries, and accepts pause/unpause/remove commands
//!
//! Commands are requests, not state changes: a command returns once the
//! backend accepted it, and the item's persisted status only moves when the
//! matching confirmation event arrives. [`await_confirmation`] implements that
//! subscribe-then-command-then-await sequence.

mod local;
mod rpc;

pub use local::LocalAdapter;
pub use rpc::RpcAdapter;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{DownloadError, Result};
use crate::types::{DownloadItemState, ItemId, TaskEvent};

/// Everything a backend needs to create one task
#[derive(Clone, Debug)]
pub struct TaskSpec {
    /// The admitted item this task downloads
    pub item_id: ItemId,
    /// Candidate URL to fetch
    pub url: String,
    /// Per-item working directory the files land in
    pub dest_dir: PathBuf,
    /// Tracker/peer hints forwarded verbatim to backends that use them
    pub tracker_hints: Vec<String>,
}

/// A downloader backend capable of creating tasks
#[async_trait]
pub trait DownloaderAdapter: Send + Sync {
    /// Stable adapter name used in configuration and source records
    fn name(&self) -> &'static str;

    /// Whether the backend transport is currently reachable.
    ///
    /// Adapters with no external transport always report `true`.
    fn is_available(&self) -> bool;

    /// Create a backend task for one admitted item.
    ///
    /// Returns [`DownloadError::BackendUnavailable`] when the transport is
    /// down; the orchestrator leaves the item Pending and retries on a later
    /// cycle.
    async fn create_task(&self, spec: TaskSpec) -> Result<Arc<dyn DownloadTask>>;
}

impl std::fmt::Debug for dyn DownloaderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloaderAdapter")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// One live backend transfer
#[async_trait]
pub trait DownloadTask: Send + Sync {
    /// The item this task belongs to
    fn item_id(&self) -> ItemId;

    /// Subscribe to this task's event stream.
    ///
    /// Every lifecycle change (started, paused, removed, complete, error) is
    /// emitted here; so are periodic progress updates.
    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;

    /// Snapshot of the task's live state
    async fn state(&self) -> DownloadItemState;

    /// Ask the backend to pause the transfer
    async fn pause(&self) -> Result<()>;

    /// Ask the backend to resume a paused transfer
    async fn unpause(&self) -> Result<()>;

    /// Ask the backend to stop the transfer and discard partial data
    async fn remove(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("item_id", &self.item_id())
            .finish_non_exhaustive()
    }
}

/// Name-indexed set of registered adapters
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn DownloaderAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under its own name
    pub fn register(&mut self, adapter: Arc<dyn DownloaderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Look up an adapter by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn DownloaderAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| {
                DownloadError::UnknownAdapter {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Names of all registered adapters
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a backend confirmation event after issuing a control command.
///
/// The caller subscribes BEFORE sending the command so the confirmation cannot
/// be lost to a race, then passes the receiver here. Resolves when `matches`
/// accepts an event; yields [`DownloadError::ConfirmationTimeout`] when the
/// window elapses, which callers surface as failed-to-confirm while leaving
/// reconciliation to the next state poll.
pub(crate) async fn await_confirmation<F>(
    mut rx: broadcast::Receiver<TaskEvent>,
    id: ItemId,
    operation: &str,
    timeout: Duration,
    matches: F,
) -> Result<()>
where
    F: Fn(&TaskEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let event = tokio::select! {
            received = rx.recv() => received,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(DownloadError::ConfirmationTimeout {
                    id: id.into(),
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
        };

        match event {
            Ok(event) if matches(&event) => return Ok(()),
            Ok(_) => continue,
            // Lagged subscribers skip ahead; the matching event may still arrive
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(DownloadError::ConfirmationTimeout {
                    id: id.into(),
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
        }
    }
}
