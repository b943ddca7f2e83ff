//! External JSON-RPC downloader backend (aria2-style engine).
//!
//! Tasks are created with `addUri` and observed by polling `tellStatus`; the
//! poller translates status changes into [`TaskEvent`]s. A metadata step that
//! finishes with a `followedBy` list redirects the task to the follow-up gid,
//! so the gid a task answers to can change mid-flight: every control call
//! resolves the current gid under the same lock the poller updates it through,
//! and retries once when the backend reports the gid gone.
//!
//! Transport availability is tracked on the adapter; an outage is logged once
//! on the transition rather than once per failed call.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::{DownloadTask, DownloaderAdapter, TaskSpec};
use crate::config::{RetryConfig, RpcBackendConfig};
use crate::error::{DownloadError, Error, Result};
use crate::retry::with_retry;
use crate::types::{DownloadItemState, DownloadStatus, ItemId, TaskEvent};

const ADAPTER_NAME: &str = "rpc";

/// The external JSON-RPC download backend
pub struct RpcAdapter {
    client: Arc<RpcClient>,
    poll_interval: Duration,
    retry: RetryConfig,
}

impl RpcAdapter {
    /// Create the adapter for one configured RPC endpoint
    pub fn new(config: &RpcBackendConfig, retry: RetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("feedpipe rpc client")
            .build()?;

        Ok(Self {
            client: Arc::new(RpcClient {
                endpoint: config.endpoint.clone(),
                secret: config.secret.clone(),
                http,
                next_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
            poll_interval: config.poll_interval,
            retry,
        })
    }
}

#[async_trait]
impl DownloaderAdapter for RpcAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn is_available(&self) -> bool {
        self.client.available.load(Ordering::SeqCst)
    }

    async fn create_task(&self, spec: TaskSpec) -> Result<Arc<dyn DownloadTask>> {
        let uris = json!([spec.url]);
        let mut options = serde_json::Map::new();
        options.insert(
            "dir".to_string(),
            json!(spec.dest_dir.to_string_lossy().into_owned()),
        );
        if !spec.tracker_hints.is_empty() {
            options.insert("bt-tracker".to_string(), json!(spec.tracker_hints.join(",")));
        }
        let options = Value::Object(options);

        // Transient transport failures back off and retry; RPC-level rejections
        // (bad URL, disk full) surface immediately.
        let client = self.client.clone();
        let result = with_retry(&self.retry, || {
            let client = client.clone();
            let params = vec![uris.clone(), options.clone()];
            async move { client.call("aria2.addUri", params).await }
        })
        .await?;

        let gid = result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| DownloadError::Backend {
                message: format!("addUri returned a non-string gid: {}", result),
            })?;

        info!(item_id = %spec.item_id, gid = %gid, "Created RPC download task");

        let (events, _) = broadcast::channel(64);
        let state = Arc::new(Mutex::new(DownloadItemState {
            status: DownloadStatus::Active,
            progress_percent: 0.0,
            speed_bps: 0,
            connections: 0,
            backend_id: Some(gid.clone()),
        }));
        let gid = Arc::new(Mutex::new(gid));

        let poller = Poller {
            item_id: spec.item_id,
            client: self.client.clone(),
            gid: gid.clone(),
            events: events.clone(),
            state: state.clone(),
            interval: self.poll_interval,
        };
        tokio::spawn(poller.run());

        Ok(Arc::new(RpcTask {
            item_id: spec.item_id,
            client: self.client.clone(),
            gid,
            events,
            state,
        }))
    }
}

// ---------------------------------------------------------------------------
// RPC transport
// ---------------------------------------------------------------------------

struct RpcClient {
    endpoint: String,
    secret: Option<String>,
    http: reqwest::Client,
    next_id: AtomicU64,
    available: AtomicBool,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut full_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            full_params.push(json!(format!("token:{}", secret)));
        }
        full_params.extend(params);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": full_params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?
            .error_for_status()
            .map_err(|e| self.transport_error(e))?;

        self.mark_available();

        let envelope: RpcEnvelope = response.json().await.map_err(|e| DownloadError::Backend {
            message: format!("malformed RPC response: {}", e),
        })?;

        if let Some(error) = envelope.error {
            return Err(DownloadError::Backend {
                message: format!("{} (code {})", error.message, error.code),
            }
            .into());
        }
        envelope.result.ok_or_else(|| {
            DownloadError::Backend {
                message: "RPC response carried neither result nor error".to_string(),
            }
            .into()
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        let reason = e.to_string();
        self.mark_unavailable(&reason);
        DownloadError::BackendUnavailable {
            adapter: ADAPTER_NAME.to_string(),
            reason,
        }
        .into()
    }

    fn mark_unavailable(&self, reason: &str) {
        // Log only on the available -> unavailable transition
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(reason = %reason, "RPC downloader backend unreachable");
        }
    }

    fn mark_available(&self) {
        if !self.available.swap(true, Ordering::SeqCst) {
            info!("RPC downloader backend reachable again");
        }
    }
}

fn is_gid_not_found(e: &Error) -> bool {
    matches!(
        e,
        Error::Download(DownloadError::Backend { message }) if message.contains("not found")
    )
}

fn is_backend_unavailable(e: &Error) -> bool {
    matches!(e, Error::Download(DownloadError::BackendUnavailable { .. }))
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Handle to one RPC-managed transfer
struct RpcTask {
    item_id: ItemId,
    client: Arc<RpcClient>,
    gid: Arc<Mutex<String>>,
    events: broadcast::Sender<TaskEvent>,
    state: Arc<Mutex<DownloadItemState>>,
}

impl RpcTask {
    /// Call a gid-addressed method against the task's CURRENT gid.
    ///
    /// The gid is read under the poller's lock immediately before the call.
    /// If the backend still reports it gone — the poller may have followed a
    /// `followedBy` redirect between the read and the call — the current gid
    /// is re-read and the call retried exactly once.
    async fn call_on_gid(&self, method: &str) -> Result<Value> {
        let gid = self.gid.lock().await.clone();
        match self.client.call(method, vec![json!(gid.clone())]).await {
            Err(e) if is_gid_not_found(&e) => {
                let current = self.gid.lock().await.clone();
                if current != gid {
                    debug!(item_id = %self.item_id, old_gid = %gid, gid = %current,
                        "gid redirected mid-command, retrying once");
                    self.client.call(method, vec![json!(current)]).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl DownloadTask for RpcTask {
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
        self.call_on_gid("aria2.pause").await.map(|_| ())
    }

    async fn unpause(&self) -> Result<()> {
        self.call_on_gid("aria2.unpause").await.map(|_| ())
    }

    async fn remove(&self) -> Result<()> {
        self.call_on_gid("aria2.remove").await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Status poller
// ---------------------------------------------------------------------------

/// Parsed subset of a `tellStatus` result
struct StatusSnapshot {
    status: String,
    total_length: u64,
    completed_length: u64,
    download_speed: u64,
    connections: u32,
    followed_by: Vec<String>,
    files: Vec<PathBuf>,
    error_message: Option<String>,
}

impl StatusSnapshot {
    fn parse(value: &Value) -> Self {
        // aria2 encodes numbers as strings
        let u64_field = |key: &str| -> u64 {
            value
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };

        Self {
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            total_length: u64_field("totalLength"),
            completed_length: u64_field("completedLength"),
            download_speed: u64_field("downloadSpeed"),
            connections: u64_field("connections") as u32,
            followed_by: value
                .get("followedBy")
                .and_then(Value::as_array)
                .map(|gids| {
                    gids.iter()
                        .filter_map(Value::as_str)
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            files: value
                .get("files")
                .and_then(Value::as_array)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|f| f.get("path").and_then(Value::as_str))
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            error_message: value
                .get("errorMessage")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        }
    }

    fn percent(&self) -> f32 {
        if self.total_length == 0 {
            0.0
        } else {
            ((self.completed_length as f64 / self.total_length as f64) * 100.0) as f32
        }
    }
}

struct Poller {
    item_id: ItemId,
    client: Arc<RpcClient>,
    gid: Arc<Mutex<String>>,
    events: broadcast::Sender<TaskEvent>,
    state: Arc<Mutex<DownloadItemState>>,
    interval: Duration,
}

impl Poller {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_status: Option<DownloadStatus> = None;
        let mut tolerated_not_found = false;

        loop {
            interval.tick().await;

            let gid = self.gid.lock().await.clone();
            let result = self
                .client
                .call("aria2.tellStatus", vec![json!(gid.clone())])
                .await;

            let snapshot = match result {
                Ok(value) => StatusSnapshot::parse(&value),
                Err(e) if is_gid_not_found(&e) => {
                    // A redirect may still be landing; give it one more poll
                    if !tolerated_not_found {
                        tolerated_not_found = true;
                        continue;
                    }
                    self.fail(format!("gid {} vanished from the backend", gid))
                        .await;
                    return;
                }
                Err(e) if is_backend_unavailable(&e) => {
                    // Outage already logged on the transition; keep polling
                    continue;
                }
                Err(e) => {
                    self.fail(e.to_string()).await;
                    return;
                }
            };
            tolerated_not_found = false;

            match snapshot.status.as_str() {
                "active" | "waiting" => {
                    {
                        let mut s = self.state.lock().await;
                        s.status = DownloadStatus::Active;
                        s.progress_percent = snapshot.percent();
                        s.speed_bps = snapshot.download_speed;
                        s.connections = snapshot.connections;
                        s.backend_id = Some(gid);
                    }
                    if last_status != Some(DownloadStatus::Active) {
                        self.events.send(TaskEvent::Started).ok();
                        last_status = Some(DownloadStatus::Active);
                    }
                    self.events
                        .send(TaskEvent::Progress {
                            percent: snapshot.percent(),
                            speed_bps: snapshot.download_speed,
                            connections: snapshot.connections,
                        })
                        .ok();
                }
                "paused" => {
                    if last_status != Some(DownloadStatus::Paused) {
                        {
                            let mut s = self.state.lock().await;
                            s.status = DownloadStatus::Paused;
                            s.speed_bps = 0;
                        }
                        self.events.send(TaskEvent::Paused).ok();
                        last_status = Some(DownloadStatus::Paused);
                    }
                }
                "complete" => {
                    if let Some(next_gid) = snapshot.followed_by.first() {
                        // Metadata step done; the real transfer continues under
                        // the follow-up gid
                        debug!(item_id = %self.item_id, old_gid = %gid, gid = %next_gid,
                            "Following gid redirect");
                        *self.gid.lock().await = next_gid.clone();
                        last_status = None;
                        continue;
                    }

                    {
                        let mut s = self.state.lock().await;
                        s.status = DownloadStatus::Success;
                        s.progress_percent = 100.0;
                        s.speed_bps = 0;
                    }
                    info!(item_id = %self.item_id, files = snapshot.files.len(),
                        "RPC download complete");
                    self.events
                        .send(TaskEvent::Complete {
                            files: snapshot.files,
                        })
                        .ok();
                    return;
                }
                "removed" => {
                    debug!(item_id = %self.item_id, "RPC download removed");
                    self.events.send(TaskEvent::Removed).ok();
                    return;
                }
                "error" => {
                    let message = snapshot
                        .error_message
                        .unwrap_or_else(|| "backend reported an unspecified error".to_string());
                    self.fail(message).await;
                    return;
                }
                other => {
                    warn!(item_id = %self.item_id, status = other, "Unknown backend status");
                }
            }
        }
    }

    async fn fail(&self, message: String) {
        {
            let mut s = self.state.lock().await;
            s.status = DownloadStatus::Failed;
            s.speed_bps = 0;
        }
        warn!(item_id = %self.item_id, error = %message, "RPC download failed");
        self.events.send(TaskEvent::Error { message }).ok();
    }
}
