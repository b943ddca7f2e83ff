//! Post-download cataloging: content store registration plus Media /
//! Series / Episode materialization driven by a rule's `describe` hook.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::{Database, ItemRow, NewMedia};
use crate::error::DatabaseError;
use crate::sandbox::{RuleContext, RuleVm};
use crate::store::ContentStore;
use crate::types::{DownloadedFile, Entry, EpisodeDescriptor, FileDescriptor};
use crate::utils::series_key;
use crate::{Error, Result};

/// Catalog records materialized for one produced file
#[derive(Clone, Copy, Debug)]
pub struct DescribeOutcome {
    /// The media record for the file (always created)
    pub media_id: i64,
    /// The episode the media was linked to, if the descriptor named one
    pub episode_id: Option<i64>,
}

/// Registers the files of a completed download and materializes catalog rows.
///
/// Every file gets a Media record even when no rule describes it; Series and
/// Episode rows are created only from a descriptor, and always resolved by
/// natural key rather than by ids a script supplies.
pub struct DescriptorPipeline {
    db: Arc<Database>,
    store: Arc<dyn ContentStore>,
}

impl DescriptorPipeline {
    /// Create a pipeline over the given database and content store
    pub fn new(db: Arc<Database>, store: Arc<dyn ContentStore>) -> Self {
        Self { db, store }
    }

    /// Register one produced file and materialize its catalog records.
    ///
    /// The file is copied into the content store first, so a crash between
    /// store and catalog writes leaves at worst an unreferenced store entry.
    /// Re-running the whole method for the same (item, file) pair is
    /// idempotent: the media insert resolves to the existing row and episode
    /// resolution follows the descriptor's `overwrite_episode` flag.
    ///
    /// # Arguments
    /// * `item` - The completed download item the file belongs to
    /// * `vm` - The accepting rule's VM, if the rule still exists
    /// * `ctx` - Hook context forwarded to `describe`
    /// * `file_path` - Path of the produced file in the task's dest dir
    pub async fn process_file(
        &self,
        item: &ItemRow,
        vm: Option<&RuleVm>,
        ctx: &RuleContext,
        file_path: &Path,
    ) -> Result<DescribeOutcome> {
        let tag = format!("item-{}", item.id);
        let record = self.store.save_local_file(file_path, &tag).await?;
        let file = DownloadedFile::from_path(&record.path, record.size_bytes);

        let entry = entry_snapshot(item);
        let default_name = entry
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| file.name.clone());

        // The media row exists regardless of whether any rule describes the
        // file; undescribed files simply stay orphan records.
        let media = self
            .db
            .upsert_media(&NewMedia {
                download_item_id: Some(item.id),
                file_path: record.path.to_string_lossy().into_owned(),
                file_hash: record.hash.clone(),
                name: default_name.clone(),
                description: entry.description.clone(),
                is_public: false,
            })
            .await?;

        let descriptor = match vm {
            Some(vm) => vm.describe(&entry, &file, ctx).await,
            None => None,
        };

        let Some(descriptor) = descriptor else {
            debug!(
                item_id = item.id,
                media_id = media.id,
                file = %file.name,
                "File registered without a descriptor"
            );
            return Ok(DescribeOutcome {
                media_id: media.id,
                episode_id: None,
            });
        };

        let episode_id = self
            .apply_descriptor(media.id, &default_name, &entry, &descriptor)
            .await?;

        Ok(DescribeOutcome {
            media_id: media.id,
            episode_id,
        })
    }

    /// Fold a descriptor into the catalog: media metadata, then series, then
    /// episode resolution and linkage.
    async fn apply_descriptor(
        &self,
        media_id: i64,
        default_name: &str,
        entry: &Entry,
        descriptor: &FileDescriptor,
    ) -> Result<Option<i64>> {
        if let Some(meta) = &descriptor.media {
            let name = meta.name.as_deref().unwrap_or(default_name);
            let description = meta
                .description
                .clone()
                .or_else(|| entry.description.clone());
            self.db
                .update_media_metadata(media_id, name, description.as_deref(), meta.is_public)
                .await?;
        }

        let Some(series) = &descriptor.series else {
            return Ok(None);
        };

        let key = series_key(&series.name, &series.season);
        let series_row = self
            .db
            .upsert_series(&series.name, &series.season, &key)
            .await?;

        let Some(episode) = &descriptor.episode else {
            debug!(
                media_id,
                series_id = series_row.id,
                "Descriptor named a series but no episode"
            );
            return Ok(None);
        };

        self.resolve_episode(
            series_row.id,
            episode,
            descriptor.overwrite_episode,
            entry,
            media_id,
        )
        .await
    }

    /// Resolve an episode by its (series, title, no) natural key and link the
    /// media row to it. A key collision is replaced or skipped depending on
    /// `overwrite`; a concurrent-insert race falls back to the same collision
    /// handling after a re-select.
    async fn resolve_episode(
        &self,
        series_id: i64,
        episode: &EpisodeDescriptor,
        overwrite: bool,
        entry: &Entry,
        media_id: i64,
    ) -> Result<Option<i64>> {
        let pub_at = episode
            .pub_at
            .or(entry.published)
            .map(|t| t.timestamp());

        if let Some(existing) = self
            .db
            .get_episode(series_id, &episode.title, &episode.no)
            .await?
        {
            return self
                .on_collision(existing.id, overwrite, pub_at, media_id)
                .await;
        }

        match self
            .db
            .insert_episode(series_id, &episode.title, &episode.no, pub_at, Some(media_id))
            .await
        {
            Ok(id) => {
                self.db.link_media_episode(media_id, id).await?;
                Ok(Some(id))
            }
            Err(Error::Database(DatabaseError::ConstraintViolation(_))) => {
                // Lost an insert race; the winner's row decides the collision.
                let existing = self
                    .db
                    .get_episode(series_id, &episode.title, &episode.no)
                    .await?
                    .ok_or_else(|| {
                        Error::Database(DatabaseError::NotFound(format!(
                            "episode vanished after conflict: series {} {} {}",
                            series_id, episode.title, episode.no
                        )))
                    })?;
                self.on_collision(existing.id, overwrite, pub_at, media_id)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn on_collision(
        &self,
        episode_id: i64,
        overwrite: bool,
        pub_at: Option<i64>,
        media_id: i64,
    ) -> Result<Option<i64>> {
        if !overwrite {
            debug!(
                episode_id,
                media_id, "Episode key already taken, keeping existing linkage"
            );
            return Ok(None);
        }

        self.db
            .replace_episode(episode_id, pub_at, Some(media_id))
            .await?;
        self.db.link_media_episode(media_id, episode_id).await?;
        Ok(Some(episode_id))
    }
}

/// Reconstruct the feed entry snapshot persisted at admission, falling back
/// to a minimal entry built from the URL for items admitted ad hoc.
fn entry_snapshot(item: &ItemRow) -> Entry {
    if let Some(json) = item.entry_json.as_deref() {
        match serde_json::from_str(json) {
            Ok(entry) => return entry,
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Stored entry snapshot is unreadable");
            }
        }
    }

    Entry {
        id: item.url.clone(),
        link: Some(item.url.clone()),
        title: None,
        description: None,
        published: None,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::db::NewItem;
    use crate::sandbox::RuleSandbox;
    use crate::store::LocalContentStore;
    use crate::utils::url_hash;
    use tempfile::TempDir;

    const CLASSIFY_RULE: &str = r#"
fn validate(entry, ctx) { true }

fn describe(entry, file, ctx) {
    if file.ext != "mkv" {
        return ();
    }
    #{
        media: #{ name: "Show S01E01", is_public: true },
        series: #{ name: "Show", season: "01" },
        episode: #{ title: "Pilot", no: "01" },
        overwrite_episode: false,
    }
}
"#;

    const OVERWRITE_RULE: &str = r#"
fn validate(entry, ctx) { true }

fn describe(entry, file, ctx) {
    #{
        series: #{ name: "Show", season: "01" },
        episode: #{ title: "Pilot", no: "01" },
        overwrite_episode: true,
    }
}
"#;

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        pipeline: DescriptorPipeline,
        dl_dir: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).await.unwrap());
        let store = Arc::new(LocalContentStore::new(dir.path().join("store")));
        let pipeline = DescriptorPipeline::new(db.clone(), store);
        let dl_dir = dir.path().join("dl");
        std::fs::create_dir_all(&dl_dir).unwrap();
        Fixture {
            _dir: dir,
            db,
            pipeline,
            dl_dir,
        }
    }

    async fn insert_item(db: &Database, url: &str, entry: Option<&Entry>) -> ItemRow {
        let id = db
            .insert_item(&NewItem {
                url: url.to_string(),
                url_hash: url_hash(url),
                source_id: None,
                rule_id: None,
                log_id: None,
                adapter: "local".to_string(),
                entry_json: entry.map(|e| serde_json::to_string(e).unwrap()),
                dest_dir: "/tmp/unused".to_string(),
            })
            .await
            .unwrap();
        db.get_item(id).await.unwrap().unwrap()
    }

    fn entry_titled(title: &str) -> Entry {
        Entry {
            id: "guid-1".to_string(),
            link: Some("https://example.com/ep01.mkv".to_string()),
            title: Some(title.to_string()),
            description: Some("episode one".to_string()),
            published: None,
        }
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn load_vm(script: &str) -> RuleVm {
        RuleSandbox::new(SandboxConfig::default())
            .load(script)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn undescribed_file_still_gets_a_media_record() {
        let fx = fixture().await;
        let entry = entry_titled("Show S01E01 1080p");
        let item = insert_item(&fx.db, "https://example.com/ep01.mkv", Some(&entry)).await;
        let file = write_file(&fx.dl_dir, "ep01.mkv", b"video bytes");

        let outcome = fx
            .pipeline
            .process_file(&item, None, &RuleContext::default(), &file)
            .await
            .unwrap();

        assert!(outcome.episode_id.is_none());
        let media = fx.db.get_media(outcome.media_id).await.unwrap().unwrap();
        assert_eq!(media.name, "Show S01E01 1080p");
        assert_eq!(media.is_public, 0);
        assert!(media.episode_id.is_none());
        assert_eq!(fx.db.count_series().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn media_name_falls_back_to_file_name_without_an_entry() {
        let fx = fixture().await;
        let item = insert_item(&fx.db, "https://example.com/raw.bin", None).await;
        let file = write_file(&fx.dl_dir, "raw.bin", b"opaque");

        let outcome = fx
            .pipeline
            .process_file(&item, None, &RuleContext::default(), &file)
            .await
            .unwrap();

        let media = fx.db.get_media(outcome.media_id).await.unwrap().unwrap();
        assert_eq!(media.name, "raw.bin");
    }

    #[tokio::test]
    async fn descriptor_materializes_series_episode_and_linkage() {
        let fx = fixture().await;
        let entry = entry_titled("Show S01E01 1080p");
        let item = insert_item(&fx.db, "https://example.com/ep01.mkv", Some(&entry)).await;
        let file = write_file(&fx.dl_dir, "ep01.mkv", b"video bytes");
        let vm = load_vm(CLASSIFY_RULE).await;

        let outcome = fx
            .pipeline
            .process_file(&item, Some(&vm), &RuleContext::default(), &file)
            .await
            .unwrap();

        let episode_id = outcome.episode_id.unwrap();
        assert_eq!(fx.db.count_series().await.unwrap(), 1);
        assert_eq!(fx.db.count_episodes().await.unwrap(), 1);

        let media = fx.db.get_media(outcome.media_id).await.unwrap().unwrap();
        assert_eq!(media.name, "Show S01E01");
        assert_eq!(media.is_public, 1);
        assert_eq!(media.episode_id, Some(episode_id));

        // The series row keeps the display form, resolution is by key.
        let series = fx
            .db
            .get_series_by_key(&series_key("show", "01"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(series.name, "Show");
    }

    #[tokio::test]
    async fn non_matching_file_is_left_undescribed_by_the_rule() {
        let fx = fixture().await;
        let entry = entry_titled("Show S01E01 1080p");
        let item = insert_item(&fx.db, "https://example.com/notes.txt", Some(&entry)).await;
        let file = write_file(&fx.dl_dir, "notes.txt", b"readme");
        let vm = load_vm(CLASSIFY_RULE).await;

        let outcome = fx
            .pipeline
            .process_file(&item, Some(&vm), &RuleContext::default(), &file)
            .await
            .unwrap();

        assert!(outcome.episode_id.is_none());
        assert_eq!(fx.db.count_episodes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rerun_without_overwrite_leaves_the_catalog_unchanged() {
        let fx = fixture().await;
        let entry = entry_titled("Show S01E01 1080p");
        let item = insert_item(&fx.db, "https://example.com/ep01.mkv", Some(&entry)).await;
        let file = write_file(&fx.dl_dir, "ep01.mkv", b"video bytes");
        let vm = load_vm(CLASSIFY_RULE).await;

        let first = fx
            .pipeline
            .process_file(&item, Some(&vm), &RuleContext::default(), &file)
            .await
            .unwrap();
        let second = fx
            .pipeline
            .process_file(&item, Some(&vm), &RuleContext::default(), &file)
            .await
            .unwrap();

        // Same media row; the episode key collision is skipped, not duplicated.
        assert_eq!(first.media_id, second.media_id);
        assert!(first.episode_id.is_some());
        assert!(second.episode_id.is_none());
        assert_eq!(fx.db.count_series().await.unwrap(), 1);
        assert_eq!(fx.db.count_episodes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overwrite_repoints_an_existing_episode() {
        let fx = fixture().await;
        let entry = entry_titled("Show S01E01 repack");
        let first_item =
            insert_item(&fx.db, "https://example.com/ep01.mkv", Some(&entry)).await;
        let second_item =
            insert_item(&fx.db, "https://example.com/ep01-repack.mkv", Some(&entry)).await;
        let first_file = write_file(&fx.dl_dir, "ep01.mkv", b"original cut");
        let second_file = write_file(&fx.dl_dir, "ep01-repack.mkv", b"repacked cut");
        let vm = load_vm(OVERWRITE_RULE).await;

        let first = fx
            .pipeline
            .process_file(&first_item, Some(&vm), &RuleContext::default(), &first_file)
            .await
            .unwrap();
        let second = fx
            .pipeline
            .process_file(
                &second_item,
                Some(&vm),
                &RuleContext::default(),
                &second_file,
            )
            .await
            .unwrap();

        assert_eq!(first.episode_id, second.episode_id);
        assert_eq!(fx.db.count_episodes().await.unwrap(), 1);

        let episode_id = second.episode_id.unwrap();
        let episode = fx
            .db
            .get_episode(
                fx.db
                    .get_series_by_key(&series_key("Show", "01"))
                    .await
                    .unwrap()
                    .unwrap()
                    .id,
                "Pilot",
                "01",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(episode.id, episode_id);
        assert_eq!(episode.media_id, Some(second.media_id));
        assert_ne!(first.media_id, second.media_id);
    }
}
