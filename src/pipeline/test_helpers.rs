//! Shared test helpers for creating FeedPipeline instances in tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::{Mutex, broadcast};

use crate::adapters::{AdapterRegistry, DownloadTask, DownloaderAdapter, TaskSpec};
use crate::config::Config;
use crate::error::{DownloadError, Result};
use crate::pipeline::FeedPipeline;
use crate::types::{DownloadItemState, DownloadStatus, ItemId, TaskEvent};

/// Helper to create a test FeedPipeline with the given mock adapter and a
/// persistent database. Returns the pipeline and the tempdir (which must be
/// kept alive).
pub(crate) async fn create_test_pipeline(
    adapter: Arc<MockAdapter>,
) -> (FeedPipeline, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();

    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("test.db");
    config.persistence.store_root = temp_dir.path().join("library");
    config.download.download_dir = temp_dir.path().join("downloads");
    config.download.default_adapter = "mock".to_string();
    config.download.confirm_timeout = std::time::Duration::from_millis(250);

    let mut adapters = AdapterRegistry::new();
    adapters.register(adapter);

    let pipeline = FeedPipeline::with_adapters(config, adapters).await.unwrap();
    (pipeline, temp_dir)
}

/// Scriptable in-memory backend for orchestrator tests.
///
/// Tasks created by this adapter do no work on their own: tests drive them
/// through [`MockTask::emit`] and inspect what commands the pipeline issued.
pub(crate) struct MockAdapter {
    available: AtomicBool,
    /// When set, pause commands are accepted but never confirmed
    swallow_pause: bool,
    tasks: Mutex<Vec<Arc<MockTask>>>,
}

impl MockAdapter {
    pub(crate) fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            swallow_pause: false,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A backend that accepts pause commands without ever confirming them
    pub(crate) fn swallowing_pause() -> Self {
        Self {
            swallow_pause: true,
            ..Self::new()
        }
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The task created for the given item, if any
    pub(crate) async fn task_for(&self, id: ItemId) -> Option<Arc<MockTask>> {
        self.tasks
            .lock()
            .await
            .iter()
            .find(|t| t.item_id == id)
            .cloned()
    }
}

#[async_trait]
impl DownloaderAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn create_task(&self, spec: TaskSpec) -> Result<Arc<dyn DownloadTask>> {
        tokio::fs::create_dir_all(&spec.dest_dir).await?;

        let (events, _rx) = broadcast::channel(64);
        let task = Arc::new(MockTask {
            item_id: spec.item_id,
            dest_dir: spec.dest_dir,
            events,
            state: Mutex::new(DownloadItemState {
                status: DownloadStatus::Active,
                progress_percent: 0.0,
                speed_bps: 0,
                connections: 1,
                backend_id: Some(format!("mock-{}", spec.item_id)),
            }),
            swallow_pause: self.swallow_pause,
        });
        self.tasks.lock().await.push(task.clone());
        Ok(task)
    }
}

pub(crate) struct MockTask {
    pub(crate) item_id: ItemId,
    pub(crate) dest_dir: PathBuf,
    events: broadcast::Sender<TaskEvent>,
    state: Mutex<DownloadItemState>,
    swallow_pause: bool,
}

impl MockTask {
    /// Emit a raw task event, as the backend would
    pub(crate) fn emit(&self, event: TaskEvent) {
        self.events.send(event).ok();
    }

    /// Write files into the task's dest dir and emit Complete for them
    pub(crate) async fn complete_with_files(&self, names: &[(&str, &[u8])]) -> Vec<PathBuf> {
        let mut files = Vec::with_capacity(names.len());
        for (name, contents) in names {
            let path = self.dest_dir.join(name);
            tokio::fs::write(&path, contents).await.unwrap();
            files.push(path);
        }
        {
            let mut state = self.state.lock().await;
            state.status = DownloadStatus::Success;
            state.progress_percent = 100.0;
        }
        self.emit(TaskEvent::Complete {
            files: files.clone(),
        });
        files
    }
}

#[async_trait]
impl DownloadTask for MockTask {
    fn item_id(&self) -> ItemId {
        self.item_id
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn state(&self) -> DownloadItemState {
        self.state.lock().await.clone()
    }

    async fn pause(&self) -> Result<()> {
        if self.swallow_pause {
            // Command accepted, confirmation never arrives
            return Ok(());
        }
        self.state.lock().await.status = DownloadStatus::Paused;
        self.emit(TaskEvent::Paused);
        Ok(())
    }

    async fn unpause(&self) -> Result<()> {
        self.state.lock().await.status = DownloadStatus::Active;
        self.emit(TaskEvent::Started);
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let status = self.state.lock().await.status;
        if status.is_terminal() {
            return Err(DownloadError::Backend {
                message: "remove rejected: task already finished".to_string(),
            }
            .into());
        }
        self.emit(TaskEvent::Removed);
        Ok(())
    }
}
