//! In-process HTTP fetch engine.
//!
//! The default backend: streams the candidate URL straight to the item's
//! working directory with no external process. Pause keeps the partial file
//! and resume continues from it with an HTTP Range request (falling back to a
//! full refetch when the server ignores the range). Remove discards partial
//! data.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{DownloadTask, DownloaderAdapter, TaskSpec};
use crate::error::{DownloadError, Result};
use crate::types::{DownloadItemState, DownloadStatus, ItemId, TaskEvent};
use crate::utils;

/// How often progress events are emitted while streaming
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// The in-process HTTP download backend
pub struct LocalAdapter {
    client: reqwest::Client,
}

impl LocalAdapter {
    /// Create the adapter with its own HTTP client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent("feedpipe downloader")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DownloaderAdapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_available(&self) -> bool {
        // No external transport to lose
        true
    }

    async fn create_task(&self, spec: TaskSpec) -> Result<Arc<dyn DownloadTask>> {
        fs::create_dir_all(&spec.dest_dir).await?;

        let (events, _) = broadcast::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let state = Arc::new(Mutex::new(DownloadItemState {
            status: DownloadStatus::Active,
            progress_percent: 0.0,
            speed_bps: 0,
            connections: 1,
            backend_id: None,
        }));

        let item_id = spec.item_id;
        debug!(item_id = %item_id, url = %spec.url, "Creating local fetch task");

        let worker = Worker {
            client: self.client.clone(),
            spec,
            events: events.clone(),
            cmd_rx,
            state: state.clone(),
        };
        tokio::spawn(worker.run());

        Ok(Arc::new(LocalTask {
            item_id,
            events,
            cmd_tx,
            state,
        }))
    }
}

enum TaskCommand {
    Pause,
    Resume,
    Remove,
}

/// Handle to one in-process fetch
struct LocalTask {
    item_id: ItemId,
    events: broadcast::Sender<TaskEvent>,
    cmd_tx: mpsc::Sender<TaskCommand>,
    state: Arc<Mutex<DownloadItemState>>,
}

impl LocalTask {
    async fn send_command(&self, command: TaskCommand, operation: &str) -> Result<()> {
        self.cmd_tx.send(command).await.map_err(|_| {
            DownloadError::Backend {
                message: format!("{} rejected: task is no longer running", operation),
            }
            .into()
        })
    }
}

#[async_trait]
impl DownloadTask for LocalTask {
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
        self.send_command(TaskCommand::Pause, "pause").await
    }

    async fn unpause(&self) -> Result<()> {
        self.send_command(TaskCommand::Resume, "unpause").await
    }

    async fn remove(&self) -> Result<()> {
        self.send_command(TaskCommand::Remove, "remove").await
    }
}

/// What one transfer attempt resolved to
enum Outcome {
    Complete,
    Paused,
    Removed,
    /// All command senders dropped — stop without touching partial data
    Detached,
}

struct Worker {
    client: reqwest::Client,
    spec: TaskSpec,
    events: broadcast::Sender<TaskEvent>,
    cmd_rx: mpsc::Receiver<TaskCommand>,
    state: Arc<Mutex<DownloadItemState>>,
}

impl Worker {
    async fn run(mut self) {
        let file_name = utils::filename_from_url(&self.spec.url);
        let path = self.spec.dest_dir.join(&file_name);
        let item_id = self.spec.item_id;
        let mut downloaded: u64 = 0;

        'transfer: loop {
            match self.transfer(&path, &mut downloaded).await {
                Ok(Outcome::Complete) => {
                    self.set_state(DownloadStatus::Success, 100.0, 0).await;
                    info!(item_id = %item_id, path = %path.display(), "Local fetch complete");
                    self.events
                        .send(TaskEvent::Complete {
                            files: vec![path.clone()],
                        })
                        .ok();
                    return;
                }
                Ok(Outcome::Paused) => {
                    self.set_state(DownloadStatus::Paused, -1.0, 0).await;
                    debug!(item_id = %item_id, downloaded, "Local fetch paused");
                    self.events.send(TaskEvent::Paused).ok();

                    // Hold the partial file until resumed or removed
                    loop {
                        match self.cmd_rx.recv().await {
                            Some(TaskCommand::Resume) => {
                                self.set_state(DownloadStatus::Active, -1.0, 0).await;
                                continue 'transfer;
                            }
                            Some(TaskCommand::Remove) => {
                                discard_partial(&path).await;
                                self.events.send(TaskEvent::Removed).ok();
                                return;
                            }
                            Some(TaskCommand::Pause) => continue,
                            None => return,
                        }
                    }
                }
                Ok(Outcome::Removed) => {
                    discard_partial(&path).await;
                    debug!(item_id = %item_id, "Local fetch removed");
                    self.events.send(TaskEvent::Removed).ok();
                    return;
                }
                Ok(Outcome::Detached) => return,
                Err(e) => {
                    self.set_state(DownloadStatus::Failed, -1.0, 0).await;
                    warn!(item_id = %item_id, error = %e, "Local fetch failed");
                    self.events
                        .send(TaskEvent::Error {
                            message: e.to_string(),
                        })
                        .ok();
                    return;
                }
            }
        }
    }

    /// Stream the URL to `path`, starting at `downloaded` bytes when resuming
    async fn transfer(&mut self, path: &Path, downloaded: &mut u64) -> Result<Outcome> {
        let mut request = self.client.get(&self.spec.url);
        if *downloaded > 0 {
            request = request.header(RANGE, format!("bytes={}-", downloaded));
        }

        let response = request.send().await?.error_for_status()?;

        if *downloaded > 0 && response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            // Server ignored the range; the body is the whole file again
            debug!(item_id = %self.spec.item_id, "Range not honored, refetching from start");
            *downloaded = 0;
        }
        let total = response.content_length().map(|len| len + *downloaded);

        let mut file = if *downloaded > 0 {
            fs::OpenOptions::new().append(true).open(path).await?
        } else {
            fs::File::create(path).await?
        };

        self.events.send(TaskEvent::Started).ok();

        let events = self.events.clone();
        let state = self.state.clone();
        let mut stream = response.bytes_stream();
        let mut window_start = tokio::time::Instant::now();
        let mut window_bytes: u64 = 0;

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(TaskCommand::Pause) => {
                        file.flush().await?;
                        return Ok(Outcome::Paused);
                    }
                    Some(TaskCommand::Remove) => return Ok(Outcome::Removed),
                    Some(TaskCommand::Resume) => continue,
                    None => return Ok(Outcome::Detached),
                },
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        let chunk = chunk?;
                        file.write_all(&chunk).await?;
                        *downloaded += chunk.len() as u64;
                        window_bytes += chunk.len() as u64;

                        let elapsed = window_start.elapsed();
                        if elapsed >= PROGRESS_INTERVAL {
                            let speed_bps =
                                (window_bytes as f64 / elapsed.as_secs_f64()) as u64;
                            let percent = total
                                .filter(|t| *t > 0)
                                .map(|t| (*downloaded as f32 / t as f32) * 100.0)
                                .unwrap_or(0.0)
                                .min(100.0);

                            {
                                let mut s = state.lock().await;
                                s.progress_percent = percent;
                                s.speed_bps = speed_bps;
                            }
                            events
                                .send(TaskEvent::Progress {
                                    percent,
                                    speed_bps,
                                    connections: 1,
                                })
                                .ok();

                            window_start = tokio::time::Instant::now();
                            window_bytes = 0;
                        }
                    }
                    None => {
                        file.flush().await?;
                        return Ok(Outcome::Complete);
                    }
                },
            }
        }
    }

    /// Update the shared state snapshot; a negative percent leaves it untouched
    async fn set_state(&self, status: DownloadStatus, percent: f32, speed_bps: u64) {
        let mut s = self.state.lock().await;
        s.status = status;
        if percent >= 0.0 {
            s.progress_percent = percent;
        }
        s.speed_bps = speed_bps;
    }
}

async fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to delete partial file");
    }
}
