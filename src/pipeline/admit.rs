//! Candidate admission — URL dedup and item persistence.

use tracing::{debug, info};

use crate::db::NewItem;
use crate::error::{DatabaseError, Error, Result};
use crate::types::{Entry, Event, ItemId};
use crate::utils::url_hash;

use super::FeedPipeline;

/// Where an admitted candidate came from.
///
/// Scheduler cycles fill every field; ad hoc admissions (a URL handed to the
/// pipeline directly) leave them at their defaults and fall back to the
/// configured default adapter.
#[derive(Clone, Debug, Default)]
pub struct AdmitOrigin {
    /// Originating source, if any
    pub source_id: Option<i64>,
    /// Rule that accepted the entry, if any
    pub rule_id: Option<i64>,
    /// Parse log of the admitting cycle, if any
    pub log_id: Option<i64>,
    /// Adapter override; `None` uses the configured default
    pub adapter: Option<String>,
    /// The feed entry the candidate came from, snapshotted for `describe`
    pub entry: Option<Entry>,
}

/// Result of an admission attempt
#[derive(Clone, Debug)]
pub enum AdmitOutcome {
    /// The candidate was new and persisted as a Pending item
    Admitted(ItemId),
    /// The candidate's URL hash already maps to an existing item
    Duplicate {
        /// The item that already owns this URL
        existing_id: ItemId,
    },
}

impl FeedPipeline {
    /// Admit a candidate URL into the pipeline.
    ///
    /// Computes the URL's dedup hash and inserts a Pending item. The
    /// `url_hash` UNIQUE constraint is the authoritative dedup boundary:
    /// under concurrent admissions of the same URL exactly one caller gets
    /// [`AdmitOutcome::Admitted`] and every other gets
    /// [`AdmitOutcome::Duplicate`] naming the winner. A duplicate is an
    /// outcome, not an error.
    ///
    /// # Errors
    /// Returns [`Error::ShuttingDown`] once shutdown has begun, or a database
    /// error if persistence fails.
    pub async fn admit(&self, url: &str, origin: AdmitOrigin) -> Result<AdmitOutcome> {
        if !self
            .task_state
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::ShuttingDown);
        }

        match self.insert_candidate(url, &origin).await {
            Ok(id) => {
                info!(item_id = %id, url, "Candidate admitted");
                self.emit_event(Event::ItemAdmitted {
                    id,
                    url: url.to_string(),
                });
                Ok(AdmitOutcome::Admitted(id))
            }
            Err(Error::Duplicate { existing_id }) => {
                debug!(existing_id, url, "Candidate skipped as duplicate");
                let existing_id = ItemId(existing_id);
                self.emit_event(Event::ItemDuplicate {
                    existing_id,
                    url: url.to_string(),
                });
                Ok(AdmitOutcome::Duplicate { existing_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Insert the candidate row, translating the hash conflict into
    /// [`Error::Duplicate`] carrying the winner's id.
    async fn insert_candidate(&self, url: &str, origin: &AdmitOrigin) -> Result<ItemId> {
        let hash = url_hash(url);
        let adapter = origin
            .adapter
            .clone()
            .unwrap_or_else(|| self.config.download.default_adapter.clone());
        let entry_json = origin
            .entry
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let dest_dir = self.dest_dir_for(&hash).to_string_lossy().into_owned();

        let insert = self
            .db
            .insert_item(&NewItem {
                url: url.to_string(),
                url_hash: hash.clone(),
                source_id: origin.source_id,
                rule_id: origin.rule_id,
                log_id: origin.log_id,
                adapter,
                entry_json,
                dest_dir,
            })
            .await;

        match insert {
            Ok(id) => Ok(id),
            Err(Error::Database(DatabaseError::ConstraintViolation(_))) => {
                let existing = self.db.get_item_by_hash(&hash).await?.ok_or_else(|| {
                    // The winning row was deleted between conflict and lookup
                    Error::Database(DatabaseError::NotFound(format!(
                        "item vanished after dedup conflict: {}",
                        url
                    )))
                })?;
                Err(Error::Duplicate {
                    existing_id: existing.id,
                })
            }
            Err(e) => Err(e),
        }
    }
}
