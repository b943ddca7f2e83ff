use crate::db::*;
use crate::error::{DatabaseError, Error};
use crate::types::{DownloadStatus, LogStatus};
use crate::utils::{series_key, url_hash};
use tempfile::NamedTempFile;

async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn new_item(url: &str) -> NewItem {
    NewItem {
        url: url.to_string(),
        url_hash: url_hash(url),
        source_id: None,
        rule_id: None,
        log_id: None,
        adapter: "local".to_string(),
        entry_json: None,
        dest_dir: "/tmp/items/1".to_string(),
    }
}

// ---------------------------------------------------------------
// sources and rules
// ---------------------------------------------------------------

#[tokio::test]
async fn insert_and_get_source_with_bound_rules() {
    let (db, _tmp) = test_db().await;

    let source_id = db
        .insert_source(InsertSourceParams {
            name: "Nightly Anime",
            url: "https://example.com/feed.xml",
            cron_expr: "0 */30 * * * *",
            adapter: Some("rpc"),
            enabled: true,
        })
        .await
        .unwrap();

    let rule_id = db
        .insert_rule(InsertRuleParams {
            name: "1080p only",
            script: r#"fn validate(entry, ctx) { entry.title.contains("1080p") }"#,
            parser_meta: Some("group=subs"),
        })
        .await
        .unwrap();

    db.bind_rule(source_id, rule_id).await.unwrap();
    // Binding is idempotent
    db.bind_rule(source_id, rule_id).await.unwrap();

    let source = db.get_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.name, "Nightly Anime");
    assert_eq!(source.adapter.as_deref(), Some("rpc"));
    assert_eq!(source.enabled, 1);

    let rules = db.rules_for_source(source_id).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].name, "1080p only");
    assert_eq!(rules[0].parser_meta.as_deref(), Some("group=subs"));

    db.close().await;
}

#[tokio::test]
async fn deleting_source_cascades_logs_and_nulls_item_reference() {
    let (db, _tmp) = test_db().await;

    let source_id = db
        .insert_source(InsertSourceParams {
            name: "S",
            url: "https://example.com/feed.xml",
            cron_expr: "0 0 * * * *",
            adapter: None,
            enabled: true,
        })
        .await
        .unwrap();

    let log_id = db.insert_log(LogKind::Fetch, source_id).await.unwrap();

    let mut item = new_item("https://example.com/a.mkv");
    item.source_id = Some(source_id);
    let item_id = db.insert_item(&item).await.unwrap();

    db.delete_source(source_id).await.unwrap();

    assert!(db.get_log(LogKind::Fetch, log_id).await.unwrap().is_none());

    // Item survives with its source reference nulled
    let item = db.get_item(item_id).await.unwrap().unwrap();
    assert!(item.source_id.is_none());

    db.close().await;
}

#[tokio::test]
async fn disabled_sources_are_excluded_from_scheduler_working_set() {
    let (db, _tmp) = test_db().await;

    for (name, enabled) in [("on", true), ("off", false)] {
        db.insert_source(InsertSourceParams {
            name,
            url: "https://example.com/feed.xml",
            cron_expr: "0 0 * * * *",
            adapter: None,
            enabled,
        })
        .await
        .unwrap();
    }

    let enabled = db.list_enabled_sources().await.unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].name, "on");

    db.close().await;
}

// ---------------------------------------------------------------
// logs
// ---------------------------------------------------------------

#[tokio::test]
async fn log_rows_finalize_exactly_once() {
    let (db, _tmp) = test_db().await;

    let source_id = db
        .insert_source(InsertSourceParams {
            name: "S",
            url: "https://example.com/feed.xml",
            cron_expr: "0 0 * * * *",
            adapter: None,
            enabled: true,
        })
        .await
        .unwrap();

    let log_id = db.insert_log(LogKind::Parse, source_id).await.unwrap();

    let row = db.get_log(LogKind::Parse, log_id).await.unwrap().unwrap();
    assert_eq!(LogStatus::from_i32(row.status), LogStatus::Pending);

    db.finalize_log(LogKind::Parse, log_id, LogStatus::Failed, Some("boom"))
        .await
        .unwrap();

    // A second finalize must not overwrite the terminal status
    db.finalize_log(LogKind::Parse, log_id, LogStatus::Success, None)
        .await
        .unwrap();

    let row = db.get_log(LogKind::Parse, log_id).await.unwrap().unwrap();
    assert_eq!(LogStatus::from_i32(row.status), LogStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("boom"));

    db.close().await;
}

// ---------------------------------------------------------------
// download items / dedup
// ---------------------------------------------------------------

#[tokio::test]
async fn insert_item_starts_pending() {
    let (db, _tmp) = test_db().await;

    let id = db.insert_item(&new_item("https://example.com/a.mkv")).await.unwrap();
    let item = db.get_item(id).await.unwrap().unwrap();

    assert_eq!(DownloadStatus::from_i32(item.status), DownloadStatus::Pending);
    assert_eq!(item.url, "https://example.com/a.mkv");
    assert!(item.started_at.is_none());

    db.close().await;
}

#[tokio::test]
async fn duplicate_url_hash_is_a_constraint_violation() {
    let (db, _tmp) = test_db().await;

    let first = db.insert_item(&new_item("https://example.com/a.mkv")).await.unwrap();

    let err = db
        .insert_item(&new_item("https://example.com/a.mkv"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Database(DatabaseError::ConstraintViolation(_))
    ));

    // The winner is resolvable by hash
    let existing = db
        .get_item_by_hash(&url_hash("https://example.com/a.mkv"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(existing.id, first.get());

    db.close().await;
}

#[tokio::test]
async fn concurrent_inserts_for_same_url_admit_exactly_one() {
    let (db, _tmp) = test_db().await;
    let db = std::sync::Arc::new(db);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.insert_item(&new_item("https://example.com/contested.mkv"))
                .await
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(Error::Database(DatabaseError::ConstraintViolation(_))) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(created, 1, "exactly one admission must win");
    assert_eq!(conflicts, 7);

    db.close().await;
}

#[tokio::test]
async fn item_status_and_timestamps_update() {
    let (db, _tmp) = test_db().await;

    let id = db.insert_item(&new_item("https://example.com/a.mkv")).await.unwrap();

    db.update_item_status(id, DownloadStatus::Active).await.unwrap();
    db.set_item_started(id).await.unwrap();
    db.update_item_status(id, DownloadStatus::Failed).await.unwrap();
    db.set_item_error(id, "tracker unreachable").await.unwrap();
    db.set_item_completed(id).await.unwrap();

    let item = db.get_item(id).await.unwrap().unwrap();
    assert_eq!(DownloadStatus::from_i32(item.status), DownloadStatus::Failed);
    assert_eq!(item.error_message.as_deref(), Some("tracker unreachable"));
    assert!(item.started_at.is_some());
    assert!(item.completed_at.is_some());

    db.close().await;
}

#[tokio::test]
async fn deleting_item_frees_the_hash_for_readmission() {
    let (db, _tmp) = test_db().await;

    let id = db.insert_item(&new_item("https://example.com/a.mkv")).await.unwrap();
    db.delete_item(id).await.unwrap();

    // Explicit deletion is the only path to re-download
    let second = db.insert_item(&new_item("https://example.com/a.mkv")).await.unwrap();
    assert_ne!(id, second);

    db.close().await;
}

// ---------------------------------------------------------------
// catalog
// ---------------------------------------------------------------

#[tokio::test]
async fn series_upsert_reuses_row_for_normalized_key() {
    let (db, _tmp) = test_db().await;

    let a = db
        .upsert_series("My Show", "01", &series_key("My Show", "01"))
        .await
        .unwrap();
    let b = db
        .upsert_series("my  show", " 01", &series_key("my  show", " 01"))
        .await
        .unwrap();

    assert_eq!(a.id, b.id, "case/whitespace variants share identity");
    assert_eq!(db.count_series().await.unwrap(), 1);

    db.close().await;
}

#[tokio::test]
async fn episode_natural_key_rejects_duplicates() {
    let (db, _tmp) = test_db().await;

    let series = db
        .upsert_series("X", "01", &series_key("X", "01"))
        .await
        .unwrap();

    db.insert_episode(series.id, "Ep1", "01", None, None)
        .await
        .unwrap();
    let err = db
        .insert_episode(series.id, "Ep1", "01", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Database(DatabaseError::ConstraintViolation(_))
    ));

    db.close().await;
}

#[tokio::test]
async fn media_upsert_is_idempotent_per_item_and_path() {
    let (db, _tmp) = test_db().await;

    let item_id = db.insert_item(&new_item("https://example.com/a.mkv")).await.unwrap();

    let media = NewMedia {
        download_item_id: Some(item_id.get()),
        file_path: "/library/ab/cd/a.mkv".to_string(),
        file_hash: "abcd".to_string(),
        name: "a.mkv".to_string(),
        description: None,
        is_public: false,
    };

    let first = db.upsert_media(&media).await.unwrap();
    let second = db.upsert_media(&media).await.unwrap();
    assert_eq!(first.id, second.id);

    db.close().await;
}
