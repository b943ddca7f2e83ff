//! Backend task creation and event tracking.
//!
//! `start` hands an admitted item to its adapter; the spawned tracker owns
//! all persistence for that task from then on. Task events map 1:1 to status
//! transitions, so control commands only issue requests and wait for the
//! backend-confirmed event to land here.

use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::adapters::TaskSpec;
use crate::db::ItemRow;
use crate::error::{DownloadError, Error, Result};
use crate::sandbox::{RuleContext, RuleVm};
use crate::types::{DownloadStatus, Event, ItemId, TaskEvent};

use super::FeedPipeline;

impl FeedPipeline {
    /// Create the backend task for a Pending item and start tracking it.
    ///
    /// The item moves to Active only after the adapter accepted the task.
    /// When the adapter's transport is down the item is left Pending and the
    /// error is surfaced once, rather than failing the item; a later cycle
    /// retries it.
    ///
    /// # Errors
    /// - [`DownloadError::NotFound`] if the item does not exist
    /// - [`DownloadError::InvalidState`] if the item is terminal
    /// - [`DownloadError::UnknownAdapter`] if no adapter matches the item
    /// - [`DownloadError::BackendUnavailable`] if the transport is down
    pub async fn start(&self, id: ItemId) -> Result<()> {
        let item = self
            .db
            .get_item(id)
            .await?
            .ok_or(DownloadError::NotFound { id: id.into() })?;

        match DownloadStatus::from_i32(item.status) {
            DownloadStatus::Pending => {}
            // Already has (or had) a backend task; starting again is a no-op
            DownloadStatus::Active | DownloadStatus::Paused => return Ok(()),
            terminal => {
                return Err(Error::Download(DownloadError::InvalidState {
                    id: id.into(),
                    operation: "start".to_string(),
                    current_state: terminal.to_string(),
                }));
            }
        }

        let adapter = self.adapters.get(&item.adapter)?;
        if !adapter.is_available() {
            return Err(Error::Download(DownloadError::BackendUnavailable {
                adapter: item.adapter.clone(),
                reason: "transport reported unavailable".to_string(),
            }));
        }

        let task = adapter
            .create_task(TaskSpec {
                item_id: id,
                url: item.url.clone(),
                dest_dir: PathBuf::from(&item.dest_dir),
                tracker_hints: self.config.download.tracker_hints.clone(),
            })
            .await?;

        // Subscribe before anything can happen on the task
        let events = task.subscribe();
        self.task_state
            .active_tasks
            .lock()
            .await
            .insert(id, task.clone());

        self.transition(id, DownloadStatus::Active).await?;
        self.db.set_item_started(id).await?;
        info!(item_id = %id, adapter = %item.adapter, "Backend task created");
        self.emit_event(Event::ItemStarted {
            id,
            adapter: item.adapter.clone(),
        });

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.track_task(id, item, events).await;
        });

        Ok(())
    }

    /// Consume a task's event stream until it ends, translating each event
    /// into the matching persisted transition and pipeline event.
    async fn track_task(
        &self,
        id: ItemId,
        item: ItemRow,
        mut events: broadcast::Receiver<TaskEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(item_id = %id, skipped, "Task event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(item_id = %id, "Task event stream closed without a terminal event");
                    self.detach_task(id).await;
                    return;
                }
            };

            match event {
                TaskEvent::Started => {
                    // Initial start is persisted by start(); a Started after
                    // Paused is a backend-confirmed resume.
                    match self.transition(id, DownloadStatus::Active).await {
                        Ok(true) => self.emit_event(Event::ItemResumed { id }),
                        Ok(false) => {}
                        Err(e) => {
                            error!(item_id = %id, error = %e, "Failed to persist resume")
                        }
                    }
                }
                TaskEvent::Progress {
                    percent,
                    speed_bps,
                    connections: _,
                } => {
                    self.emit_event(Event::ItemProgress {
                        id,
                        percent,
                        speed_bps,
                    });
                }
                TaskEvent::Paused => {
                    match self.transition(id, DownloadStatus::Paused).await {
                        Ok(true) => self.emit_event(Event::ItemPaused { id }),
                        Ok(false) => {}
                        Err(e) => {
                            error!(item_id = %id, error = %e, "Failed to persist pause")
                        }
                    }
                }
                TaskEvent::Removed => {
                    // Row deletion is the remove command's job; the tracker
                    // only stops following the task.
                    debug!(item_id = %id, "Task removed, tracker detaching");
                    self.detach_task(id).await;
                    return;
                }
                TaskEvent::Complete { files } => {
                    self.handle_complete(id, &item, files).await;
                    self.detach_task(id).await;
                    return;
                }
                TaskEvent::Error { message } => {
                    self.handle_task_error(id, &message).await;
                    self.detach_task(id).await;
                    return;
                }
            }
        }
    }

    /// Register a completed task's files and move the item to Success.
    ///
    /// Per-file errors are captured and logged, never escalated: the transfer
    /// itself succeeded and the files stay on disk, so a cataloging failure
    /// must not mark the item Failed.
    async fn handle_complete(&self, id: ItemId, item: &ItemRow, files: Vec<PathBuf>) {
        let rule = self.rule_for(item).await;
        let ctx = RuleContext {
            source_id: item.source_id,
            rule_id: item.rule_id,
            parser_meta: rule.as_ref().and_then(|r| r.parser_meta.clone()),
        };
        let vm = match &rule {
            Some(rule) => self.load_rule_vm(item, rule).await,
            None => None,
        };

        let mut described = 0usize;
        for file in &files {
            match self
                .descriptor
                .process_file(item, vm.as_ref(), &ctx, file)
                .await
            {
                Ok(outcome) => {
                    if outcome.episode_id.is_some() {
                        described += 1;
                    }
                    self.emit_event(Event::FileDescribed {
                        id,
                        media_id: outcome.media_id,
                        episode_id: outcome.episode_id,
                    });
                }
                Err(e) => {
                    warn!(
                        item_id = %id,
                        file = %file.display(),
                        error = %e,
                        "Failed to register completed file"
                    );
                }
            }
        }
        if let Some(vm) = vm {
            vm.release();
        }

        match self.transition(id, DownloadStatus::Success).await {
            Ok(true) => {
                if let Err(e) = self.db.set_item_completed(id).await {
                    error!(item_id = %id, error = %e, "Failed to set completion timestamp");
                }
                info!(
                    item_id = %id,
                    files = files.len(),
                    described,
                    "Item complete"
                );
                self.emit_event(Event::ItemComplete {
                    id,
                    files: files.len(),
                });
            }
            Ok(false) => {}
            Err(e) => error!(item_id = %id, error = %e, "Failed to persist completion"),
        }
    }

    /// Persist a backend-reported task failure.
    async fn handle_task_error(&self, id: ItemId, message: &str) {
        if let Err(e) = self.db.set_item_error(id, message).await {
            error!(item_id = %id, error = %e, "Failed to record item error");
        }
        match self.transition(id, DownloadStatus::Failed).await {
            Ok(true) => {
                warn!(item_id = %id, error = %message, "Item failed");
                self.emit_event(Event::ItemFailed {
                    id,
                    error: message.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => error!(item_id = %id, error = %e, "Failed to persist failure"),
        }
    }

    /// Fetch the item's accepting rule, if it still exists
    async fn rule_for(&self, item: &ItemRow) -> Option<crate::db::RuleRow> {
        let rule_id = item.rule_id?;
        match self.db.get_rule(rule_id).await {
            Ok(Some(rule)) => Some(rule),
            Ok(None) => {
                debug!(item_id = item.id, rule_id, "Accepting rule no longer exists");
                None
            }
            Err(e) => {
                warn!(item_id = item.id, rule_id, error = %e, "Failed to load accepting rule");
                None
            }
        }
    }

    /// Load the accepting rule's VM for post-download `describe`.
    ///
    /// A rule that no longer compiles leaves files undescribed rather than
    /// failing the item.
    async fn load_rule_vm(&self, item: &ItemRow, rule: &crate::db::RuleRow) -> Option<RuleVm> {
        match self.sandbox.load(&rule.script).await {
            Ok(vm) => Some(vm),
            Err(e) => {
                warn!(
                    item_id = item.id,
                    rule_id = rule.id,
                    error = %e,
                    "Accepting rule no longer compiles, leaving files undescribed"
                );
                None
            }
        }
    }

    /// Drop the item's live task handle
    async fn detach_task(&self, id: ItemId) {
        self.task_state.active_tasks.lock().await.remove(&id);
    }
}
