//! Item lifecycle control — pause, unpause, remove, state projection.
//!
//! Control commands are requests to the backend, not state changes. Each
//! command subscribes to the task's events first, issues the command, and
//! waits for the backend-confirmed event within the configured window; the
//! tracker is the only writer of the resulting status transition. A timeout
//! surfaces as [`DownloadError::ConfirmationTimeout`], which is distinct from
//! failed-to-execute: the command may still take effect later.

use std::sync::Arc;

use tracing::{info, warn};

use crate::adapters::{DownloadTask, await_confirmation};
use crate::error::{DownloadError, Error, Result};
use crate::types::{DownloadItemState, DownloadStatus, Event, ItemId, TaskEvent};

use super::FeedPipeline;

impl FeedPipeline {
    /// Pause an active download.
    ///
    /// Returns once the backend confirmed the pause. Pausing an already
    /// paused item is a no-op; a Pending or terminal item cannot be paused.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use feedpipe::{FeedPipeline, ItemId, Result};
    /// # async fn example(pipeline: FeedPipeline, id: ItemId) -> Result<()> {
    /// pipeline.pause(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pause(&self, id: ItemId) -> Result<()> {
        let status = self.item_status(id).await?;

        match status {
            DownloadStatus::Paused => return Ok(()),
            DownloadStatus::Active => {}
            other => {
                return Err(Error::Download(DownloadError::InvalidState {
                    id: id.into(),
                    operation: "pause".to_string(),
                    current_state: other.to_string(),
                }));
            }
        }

        let task = self.live_task(id, "pause").await?;
        let rx = task.subscribe();
        task.pause().await?;
        await_confirmation(
            rx,
            id,
            "pause",
            self.config.download.confirm_timeout,
            |event| matches!(event, TaskEvent::Paused),
        )
        .await?;

        info!(item_id = %id, "Pause confirmed");
        Ok(())
    }

    /// Resume a paused download.
    ///
    /// Returns once the backend confirmed the resume. Unpausing an Active
    /// item is a no-op; a Pending or terminal item cannot be unpaused.
    pub async fn unpause(&self, id: ItemId) -> Result<()> {
        let status = self.item_status(id).await?;

        match status {
            DownloadStatus::Active => return Ok(()),
            DownloadStatus::Paused => {}
            other => {
                return Err(Error::Download(DownloadError::InvalidState {
                    id: id.into(),
                    operation: "unpause".to_string(),
                    current_state: other.to_string(),
                }));
            }
        }

        let task = self.live_task(id, "unpause").await?;
        let rx = task.subscribe();
        task.unpause().await?;
        await_confirmation(
            rx,
            id,
            "unpause",
            self.config.download.confirm_timeout,
            |event| matches!(event, TaskEvent::Started),
        )
        .await?;

        info!(item_id = %id, "Resume confirmed");
        Ok(())
    }

    /// Remove an item, discarding partial data and its database row.
    ///
    /// With a live backend task the removal is backend-confirmed first. For
    /// an item with no live task (Pending, or terminal from an earlier run)
    /// only the row and working directory are removed. Deleting the row frees
    /// the URL hash, so the same URL can be admitted again afterwards.
    pub async fn remove(&self, id: ItemId) -> Result<()> {
        let item = self
            .db
            .get_item(id)
            .await?
            .ok_or(DownloadError::NotFound { id: id.into() })?;

        let task = self.task_state.active_tasks.lock().await.get(&id).cloned();
        if let Some(task) = task {
            let rx = task.subscribe();
            task.remove().await?;
            await_confirmation(
                rx,
                id,
                "remove",
                self.config.download.confirm_timeout,
                |event| matches!(event, TaskEvent::Removed),
            )
            .await?;
            self.task_state.active_tasks.lock().await.remove(&id);
        }

        // Clear the working directory; row deletion matters more than leftovers
        let dest_dir = std::path::PathBuf::from(&item.dest_dir);
        if dest_dir.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&dest_dir).await
        {
            warn!(
                item_id = %id,
                path = %dest_dir.display(),
                error = %e,
                "Failed to delete item working directory"
            );
        }

        self.db.delete_item(id).await?;
        info!(item_id = %id, "Item removed");
        self.emit_event(Event::ItemRemoved { id });

        Ok(())
    }

    /// Live state projection for an item.
    ///
    /// With a live backend task this is the task's current snapshot; without
    /// one it is a minimal projection built from the persisted status. The
    /// projection itself never fails — only a missing item is an error.
    pub async fn state(&self, id: ItemId) -> Result<DownloadItemState> {
        if let Some(task) = self.task_state.active_tasks.lock().await.get(&id).cloned() {
            return Ok(task.state().await);
        }

        let status = self.item_status(id).await?;
        Ok(DownloadItemState::terminal(status))
    }

    /// Current persisted status of an item
    async fn item_status(&self, id: ItemId) -> Result<DownloadStatus> {
        let item = self
            .db
            .get_item(id)
            .await?
            .ok_or(DownloadError::NotFound { id: id.into() })?;
        Ok(DownloadStatus::from_i32(item.status))
    }

    /// The item's live backend task, required for control commands.
    ///
    /// An item can be Active in the database with no live task after a
    /// process restart; commands on it fail until a new task is started.
    async fn live_task(&self, id: ItemId, operation: &str) -> Result<Arc<dyn DownloadTask>> {
        self.task_state
            .active_tasks
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                Error::Download(DownloadError::Backend {
                    message: format!("no live backend task for {} on item {}", operation, id),
                })
            })
    }
}
