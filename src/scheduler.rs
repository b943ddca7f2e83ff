//! Cron-driven source scheduling and the per-source fetch cycle.
//!
//! The supervisor loop re-reads enabled sources every tick, so source edits
//! take effect without a restart. Due-ness is evaluated against each source's
//! cron expression in UTC; a source whose previous cycle is still running is
//! skipped, never queued. No error crosses a cycle boundary: every failure is
//! recorded in the cycle's logs or on the affected item, and the supervisor
//! keeps running. Sources are never auto-disabled by failures.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{LogKind, SourceRow};
use crate::error::{DownloadError, Error};
use crate::pipeline::{AdmitOrigin, AdmitOutcome, FeedPipeline};
use crate::sandbox::{RuleContext, RuleVm};
use crate::types::{DownloadStatus, Entry, Event, ItemId, LogStatus};

/// Cron supervisor driving fetch cycles for enabled sources
pub struct Scheduler {
    pipeline: FeedPipeline,
    shutdown: CancellationToken,
    /// Sources with a cycle currently running
    in_flight: Arc<Mutex<HashSet<i64>>>,
    /// Last time each source fired, for cron due-ness
    last_fire: Arc<Mutex<HashMap<i64, DateTime<Utc>>>>,
}

impl Scheduler {
    /// Create a scheduler over the given pipeline
    pub fn new(pipeline: FeedPipeline) -> Self {
        Self {
            pipeline,
            shutdown: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            last_fire: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Request the supervisor loop to stop after its current tick
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the supervisor loop until [`Scheduler::shutdown`] is called.
    ///
    /// Sources that become due between ticks fire on the next tick; a tick
    /// interval no larger than one second keeps second-granularity cron
    /// expressions accurate.
    pub async fn run(self: Arc<Self>) {
        let tick = self.pipeline.get_config().scheduler.tick_interval;
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(tick_ms = tick.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => {
                    info!("Scheduler stopped");
                    return;
                }
            }

            let sources = match self.pipeline.db.list_enabled_sources().await {
                Ok(sources) => sources,
                Err(e) => {
                    error!(error = %e, "Failed to load enabled sources");
                    continue;
                }
            };

            let now = Utc::now();
            for source in sources {
                if !self.is_due(&source, now).await {
                    continue;
                }
                if !self.claim(source.id).await {
                    debug!(source_id = source.id, "Previous cycle still running, skipping");
                    continue;
                }

                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.pipeline.run_source_cycle(&source).await;
                    scheduler.in_flight.lock().await.remove(&source.id);
                });
            }
        }
    }

    /// Whether the source's cron expression has a firing time since its last
    /// fire (or since now, for a source seen for the first time).
    async fn is_due(&self, source: &SourceRow, now: DateTime<Utc>) -> bool {
        let schedule = match cron::Schedule::from_str(&source.cron_expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(
                    source_id = source.id,
                    cron = %source.cron_expr,
                    error = %e,
                    "Invalid cron expression, source skipped"
                );
                return false;
            }
        };

        let mut last_fire = self.last_fire.lock().await;
        let since = *last_fire.entry(source.id).or_insert(now);

        match schedule.after(&since).next() {
            Some(when) if when <= now => {
                last_fire.insert(source.id, now);
                true
            }
            _ => false,
        }
    }

    /// Mark a source's cycle in flight; fails when one is already running
    async fn claim(&self, source_id: i64) -> bool {
        self.in_flight.lock().await.insert(source_id)
    }
}

/// A rule compiled for one cycle
struct CycleRule {
    id: i64,
    name: String,
    parser_meta: Option<String>,
    vm: RuleVm,
}

impl FeedPipeline {
    /// Run one full fetch cycle for a source: fetch, parse, validate, admit,
    /// start. Every stage failure is recorded in the cycle's logs or on the
    /// affected item; nothing escapes to the caller.
    pub async fn run_source_cycle(&self, source: &SourceRow) {
        debug!(source_id = source.id, url = %source.url, "Cycle starting");

        let fetch_log = match self.db.insert_log(LogKind::Fetch, source.id).await {
            Ok(id) => id,
            Err(e) => {
                error!(source_id = source.id, error = %e, "Failed to open fetch log");
                return;
            }
        };
        self.emit_event(Event::FetchStarted {
            source_id: source.id,
        });

        let entries = match self.fetcher.fetch(&source.url).await {
            Ok(entries) => {
                self.finalize_log(LogKind::Fetch, fetch_log, LogStatus::Success, None)
                    .await;
                entries
            }
            Err(e) => {
                let error = e.to_string();
                warn!(source_id = source.id, error = %error, "Feed fetch failed");
                self.finalize_log(LogKind::Fetch, fetch_log, LogStatus::Failed, Some(&error))
                    .await;
                self.emit_event(Event::FetchFailed {
                    source_id: source.id,
                    error,
                });
                return;
            }
        };

        let parse_log = match self.db.insert_log(LogKind::Parse, source.id).await {
            Ok(id) => id,
            Err(e) => {
                error!(source_id = source.id, error = %e, "Failed to open parse log");
                return;
            }
        };

        let (rules, compile_errors) = self.compile_source_rules(source).await;

        let admitted = self
            .admit_accepted_entries(source, parse_log, &entries, &rules)
            .await;

        for rule in rules {
            rule.vm.release();
        }

        // Compile failures are recorded but only fail the attempt when no
        // rule survived to evaluate anything.
        let (status, error_text) = if !compile_errors.is_empty() {
            let joined = compile_errors.join("; ");
            if admitted.evaluated {
                (LogStatus::Success, Some(joined))
            } else {
                (LogStatus::Failed, Some(joined))
            }
        } else {
            (LogStatus::Success, None)
        };
        self.finalize_log(LogKind::Parse, parse_log, status, error_text.as_deref())
            .await;

        info!(
            source_id = source.id,
            entries = entries.len(),
            admitted = admitted.count,
            "Cycle complete"
        );
        self.emit_event(Event::FetchComplete {
            source_id: source.id,
            entries: entries.len(),
            admitted: admitted.count,
        });
    }

    /// Compile the source's bound rules, collecting per-rule failures.
    ///
    /// A rule that fails to compile is skipped for this cycle only; it stays
    /// bound and is retried next cycle.
    async fn compile_source_rules(
        &self,
        source: &SourceRow,
    ) -> (Vec<CycleRule>, Vec<String>) {
        let rows = match self.db.rules_for_source(source.id).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(source_id = source.id, error = %e, "Failed to load source rules");
                return (Vec::new(), vec![format!("failed to load rules: {}", e)]);
            }
        };

        let mut rules = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        for row in rows {
            match self.sandbox.load(&row.script).await {
                Ok(vm) => rules.push(CycleRule {
                    id: row.id,
                    name: row.name,
                    parser_meta: row.parser_meta,
                    vm,
                }),
                Err(e) => {
                    warn!(
                        source_id = source.id,
                        rule_id = row.id,
                        error = %e,
                        "Rule failed to compile, skipped for this cycle"
                    );
                    errors.push(format!("rule '{}': {}", row.name, e));
                }
            }
        }
        (rules, errors)
    }

    /// Validate entries against the compiled rules and admit the accepted
    /// ones. Validation fans out bounded by the sandbox's `eval_concurrency`;
    /// admissions and starts run sequentially so dedup outcomes are ordered.
    /// Duplicates that resolve to a still-Pending item get a fresh start
    /// attempt, which is how outage-stranded items recover.
    async fn admit_accepted_entries(
        &self,
        source: &SourceRow,
        parse_log: i64,
        entries: &[Entry],
        rules: &[CycleRule],
    ) -> CycleAdmissions {
        let concurrency = self.config.sandbox.eval_concurrency;

        let evaluations: Vec<_> = entries
            .iter()
            .map(|entry| async move {
                let rule_id = self.first_accepting_rule(source, entry, rules).await?;
                Some((entry, rule_id))
            })
            .collect();
        let accepted: Vec<(&Entry, i64)> = stream::iter(evaluations)
            .buffer_unordered(concurrency)
            .filter_map(|accepted| async move { accepted })
            .collect()
            .await;

        let mut admissions = CycleAdmissions {
            count: 0,
            evaluated: !rules.is_empty() || entries.is_empty(),
        };

        for (entry, rule_id) in accepted {
            let Some(url) = entry.link.as_deref() else {
                debug!(entry_id = %entry.id, "Accepted entry has no link, skipped");
                continue;
            };

            let origin = AdmitOrigin {
                source_id: Some(source.id),
                rule_id: Some(rule_id),
                log_id: Some(parse_log),
                adapter: source.adapter.clone(),
                entry: Some(entry.clone()),
            };

            match self.admit(url, origin).await {
                Ok(AdmitOutcome::Admitted(id)) => {
                    admissions.count += 1;
                    if let Err(e) = self.start(id).await {
                        self.capture_start_failure(id, e).await;
                    }
                }
                Ok(AdmitOutcome::Duplicate { existing_id }) => {
                    // The winner may be an item stranded Pending by an
                    // earlier backend outage; give it another start now.
                    self.restart_if_stranded(existing_id).await;
                }
                Err(Error::ShuttingDown) => {
                    debug!(source_id = source.id, "Shutdown during cycle, admissions stopped");
                    break;
                }
                Err(e) => {
                    warn!(source_id = source.id, url, error = %e, "Admission failed");
                }
            }
        }

        admissions
    }

    /// The first bound rule whose `validate` accepts the entry.
    ///
    /// Hook failures resolve to reject inside the sandbox, so one broken rule
    /// cannot block its siblings from accepting the entry.
    async fn first_accepting_rule(
        &self,
        source: &SourceRow,
        entry: &Entry,
        rules: &[CycleRule],
    ) -> Option<i64> {
        for rule in rules {
            let ctx = RuleContext {
                source_id: Some(source.id),
                rule_id: Some(rule.id),
                parser_meta: rule.parser_meta.clone(),
            };
            if rule.vm.validate(entry, &ctx).await {
                debug!(entry_id = %entry.id, rule = %rule.name, "Entry accepted");
                return Some(rule.id);
            }
        }
        None
    }

    /// Re-start an item left Pending by an earlier backend outage.
    ///
    /// A duplicate admission is the natural place to catch these: the feed
    /// keeps listing the entry, so every cycle while the item is stranded
    /// resolves its URL to the existing row and lands here.
    async fn restart_if_stranded(&self, id: ItemId) {
        let status = match self.db.get_item(id).await {
            Ok(Some(item)) => DownloadStatus::from_i32(item.status),
            Ok(None) => return,
            Err(e) => {
                warn!(item_id = %id, error = %e, "Failed to inspect duplicate item");
                return;
            }
        };
        if status != DownloadStatus::Pending {
            return;
        }

        debug!(item_id = %id, "Duplicate names a Pending item, retrying start");
        if let Err(e) = self.start(id).await {
            self.capture_start_failure(id, e).await;
        }
    }

    /// Record a start failure on the item without failing the cycle.
    ///
    /// An unavailable backend leaves the item Pending; the next cycle's
    /// duplicate hit on the same URL retries the start. Anything else marks
    /// the item Failed with the error retained.
    async fn capture_start_failure(&self, id: ItemId, error: Error) {
        let message = error.to_string();
        warn!(item_id = %id, error = %message, "Failed to start admitted item");

        if let Err(e) = self.db.set_item_error(id, &message).await {
            error!(item_id = %id, error = %e, "Failed to record start failure");
        }

        let retryable = matches!(
            error,
            Error::Download(DownloadError::BackendUnavailable { .. })
        );
        if !retryable {
            match self.transition(id, DownloadStatus::Failed).await {
                Ok(true) => self.emit_event(Event::ItemFailed {
                    id,
                    error: message,
                }),
                Ok(false) => {}
                Err(e) => error!(item_id = %id, error = %e, "Failed to persist start failure"),
            }
        }
    }

    /// Finalize a log row, logging rather than propagating a write failure
    async fn finalize_log(
        &self,
        kind: LogKind,
        id: i64,
        status: LogStatus,
        error_text: Option<&str>,
    ) {
        if let Err(e) = self.db.finalize_log(kind, id, status, error_text).await {
            error!(log_id = id, error = %e, "Failed to finalize log row");
        }
    }
}

/// What a cycle's admission stage produced
struct CycleAdmissions {
    /// Items admitted this cycle
    count: usize,
    /// Whether any evaluation was possible (false when every rule failed to
    /// compile while entries were waiting)
    evaluated: bool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{InsertRuleParams, InsertSourceParams};
    use crate::types::DownloadStatus;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUALITY_RULE: &str = r#"
fn validate(entry, ctx) {
    entry.title != () && entry.title.contains("1080p")
}
"#;

    async fn test_pipeline(tick: Duration) -> (FeedPipeline, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.persistence.database_path = dir.path().join("test.db");
        config.persistence.store_root = dir.path().join("library");
        config.download.download_dir = dir.path().join("downloads");
        config.scheduler.tick_interval = tick;
        let pipeline = FeedPipeline::new(config).await.unwrap();
        (pipeline, dir)
    }

    fn rss_feed(items: &[(&str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(title, link)| {
                format!(
                    "<item><title>{title}</title><link>{link}</link><guid>{link}</guid></item>"
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>releases</title>{body}</channel></rss>"#
        )
    }

    async fn insert_source(pipeline: &FeedPipeline, url: &str, cron_expr: &str) -> SourceRow {
        let id = pipeline
            .db
            .insert_source(InsertSourceParams {
                name: "releases",
                url,
                cron_expr,
                adapter: None,
                enabled: true,
            })
            .await
            .unwrap();
        pipeline.db.get_source(id).await.unwrap().unwrap()
    }

    async fn bind_new_rule(
        pipeline: &FeedPipeline,
        source_id: i64,
        name: &str,
        script: &str,
    ) -> i64 {
        let rule_id = pipeline
            .db
            .insert_rule(InsertRuleParams {
                name,
                script,
                parser_meta: None,
            })
            .await
            .unwrap();
        pipeline.db.bind_rule(source_id, rule_id).await.unwrap();
        rule_id
    }

    async fn wait_for_completions(pipeline: &FeedPipeline, expected: usize) {
        let mut events = pipeline.subscribe();
        // subscribing after the fact would miss events, so poll the database
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = pipeline
                    .db
                    .list_items()
                    .await
                    .unwrap()
                    .iter()
                    .filter(|i| DownloadStatus::from_i32(i.status) == DownloadStatus::Success)
                    .count();
                if done >= expected {
                    return;
                }
                tokio::select! {
                    _ = events.recv() => {}
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                }
            }
        })
        .await
        .expect("downloads did not complete in time");
    }

    // -----------------------------------------------------------
    // Cycle behavior
    // -----------------------------------------------------------

    #[tokio::test]
    async fn cycle_admits_and_downloads_matching_entries() {
        let server = MockServer::start().await;
        let (pipeline, _dir) = test_pipeline(Duration::from_secs(1)).await;

        for name in ["ep01.mkv", "ep02.mkv"] {
            Mock::given(method("GET"))
                .and(path(format!("/files/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video".to_vec()))
                .mount(&server)
                .await;
        }
        let feed = rss_feed(&[
            ("Show S01E01 1080p", &format!("{}/files/ep01.mkv", server.uri())),
            ("Show S01E01 480p", &format!("{}/files/ep01-sd.mkv", server.uri())),
            ("Show S01E02 1080p", &format!("{}/files/ep02.mkv", server.uri())),
        ]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed))
            .mount(&server)
            .await;

        let source =
            insert_source(&pipeline, &format!("{}/feed.xml", server.uri()), "0 0 3 * * *").await;
        bind_new_rule(&pipeline, source.id, "hd-only", QUALITY_RULE).await;

        pipeline.run_source_cycle(&source).await;

        // Only the two 1080p entries were admitted
        let items = pipeline.db.list_items().await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.url.contains("ep01.mkv") || i.url.contains("ep02.mkv")));

        wait_for_completions(&pipeline, 2).await;

        // Both attempt logs finalized as success
        let fetch_logs = pipeline.db.list_logs(LogKind::Fetch, source.id).await.unwrap();
        assert_eq!(fetch_logs.len(), 1);
        assert_eq!(LogStatus::from_i32(fetch_logs[0].status), LogStatus::Success);
        let parse_logs = pipeline.db.list_logs(LogKind::Parse, source.id).await.unwrap();
        assert_eq!(LogStatus::from_i32(parse_logs[0].status), LogStatus::Success);
    }

    #[tokio::test]
    async fn fetch_failure_ends_the_cycle_with_a_failed_log() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (pipeline, _dir) = test_pipeline(Duration::from_secs(1)).await;
        let source =
            insert_source(&pipeline, &format!("{}/feed.xml", server.uri()), "0 0 3 * * *").await;
        bind_new_rule(&pipeline, source.id, "hd-only", QUALITY_RULE).await;

        let mut events = pipeline.subscribe();
        pipeline.run_source_cycle(&source).await;

        let fetch_logs = pipeline.db.list_logs(LogKind::Fetch, source.id).await.unwrap();
        assert_eq!(LogStatus::from_i32(fetch_logs[0].status), LogStatus::Failed);
        assert!(fetch_logs[0].error.is_some());

        // The cycle never reached the parse stage
        let parse_logs = pipeline.db.list_logs(LogKind::Parse, source.id).await.unwrap();
        assert!(parse_logs.is_empty());
        assert!(pipeline.db.list_items().await.unwrap().is_empty());

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::FetchFailed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn broken_rule_is_skipped_and_recorded_without_blocking_siblings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/ep01.mkv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video".to_vec()))
            .mount(&server)
            .await;
        let feed = rss_feed(&[(
            "Show S01E01 1080p",
            &format!("{}/files/ep01.mkv", server.uri()),
        )]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed))
            .mount(&server)
            .await;

        let (pipeline, _dir) = test_pipeline(Duration::from_secs(1)).await;
        let source =
            insert_source(&pipeline, &format!("{}/feed.xml", server.uri()), "0 0 3 * * *").await;
        bind_new_rule(&pipeline, source.id, "broken", "fn validate(entry, ctx) {").await;
        bind_new_rule(&pipeline, source.id, "hd-only", QUALITY_RULE).await;

        pipeline.run_source_cycle(&source).await;

        // The healthy rule still admitted the entry
        assert_eq!(pipeline.db.list_items().await.unwrap().len(), 1);

        // The compile failure is recorded on the parse log by rule name
        let parse_logs = pipeline.db.list_logs(LogKind::Parse, source.id).await.unwrap();
        assert_eq!(LogStatus::from_i32(parse_logs[0].status), LogStatus::Success);
        assert!(parse_logs[0].error.as_deref().unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn repeated_cycles_admit_each_url_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/ep01.mkv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video".to_vec()))
            .mount(&server)
            .await;
        let feed = rss_feed(&[(
            "Show S01E01 1080p",
            &format!("{}/files/ep01.mkv", server.uri()),
        )]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed))
            .mount(&server)
            .await;

        let (pipeline, _dir) = test_pipeline(Duration::from_secs(1)).await;
        let source =
            insert_source(&pipeline, &format!("{}/feed.xml", server.uri()), "0 0 3 * * *").await;
        bind_new_rule(&pipeline, source.id, "hd-only", QUALITY_RULE).await;

        pipeline.run_source_cycle(&source).await;
        pipeline.run_source_cycle(&source).await;

        assert_eq!(pipeline.db.list_items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outage_stranded_items_are_restarted_by_a_later_cycle() {
        use crate::pipeline::test_helpers::{MockAdapter, create_test_pipeline};

        let server = MockServer::start().await;
        let feed = rss_feed(&[("Show S01E01 1080p", "https://example.com/ep01.mkv")]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed))
            .mount(&server)
            .await;

        let adapter = Arc::new(MockAdapter::new());
        adapter.set_available(false);
        let (pipeline, _dir) = create_test_pipeline(adapter.clone()).await;
        let source =
            insert_source(&pipeline, &format!("{}/feed.xml", server.uri()), "0 0 3 * * *").await;
        bind_new_rule(&pipeline, source.id, "hd-only", QUALITY_RULE).await;

        // The entry is admitted but the backend refuses the start
        pipeline.run_source_cycle(&source).await;
        let items = pipeline.db.list_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            DownloadStatus::from_i32(items[0].status),
            DownloadStatus::Pending
        );
        assert!(items[0].error_message.is_some());

        // The next cycle resolves the same URL to a duplicate of the
        // stranded item and starts it now that the backend is back
        adapter.set_available(true);
        pipeline.run_source_cycle(&source).await;
        let items = pipeline.db.list_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            DownloadStatus::from_i32(items[0].status),
            DownloadStatus::Active
        );
    }

    // -----------------------------------------------------------
    // Supervisor loop
    // -----------------------------------------------------------

    #[tokio::test]
    async fn supervisor_fires_due_sources() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss_feed(&[])))
            .mount(&server)
            .await;

        let (pipeline, _dir) = test_pipeline(Duration::from_millis(50)).await;
        let source = insert_source(
            &pipeline,
            &format!("{}/feed.xml", server.uri()),
            "* * * * * *", // every second
        )
        .await;

        let scheduler = Arc::new(Scheduler::new(pipeline.clone()));
        let handle = tokio::spawn(scheduler.clone().run());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let logs = pipeline.db.list_logs(LogKind::Fetch, source.id).await.unwrap();
                if !logs.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("scheduler never fired the due source");

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_sources_are_never_fired() {
        let server = MockServer::start().await;
        let (pipeline, _dir) = test_pipeline(Duration::from_millis(50)).await;
        let source = insert_source(
            &pipeline,
            &format!("{}/feed.xml", server.uri()),
            "* * * * * *",
        )
        .await;
        pipeline.db.set_source_enabled(source.id, false).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(pipeline.clone()));
        let handle = tokio::spawn(scheduler.clone().run());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown();
        handle.await.unwrap();

        let logs = pipeline.db.list_logs(LogKind::Fetch, source.id).await.unwrap();
        assert!(logs.is_empty());
    }
}
