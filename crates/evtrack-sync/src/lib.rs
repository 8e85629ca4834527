//! Incremental event ingestion: cursor -> bounded fetch -> idempotent persist -> cursor advance -> report.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use evtrack_adapters::{
    ApiConfig, EventSource, HttpEventSource, Notifier, SlackConfig, SlackNotifier,
};
use evtrack_core::{ErrorDetail, Event, MessageHandle, Reaction};
use evtrack_storage::{CursorStore, DbConfig, EventStore, PgStore, StoreError};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const BATCH_FAILURE_CONTEXT: &str = "Failed to process events batch";

/// Where the cursor lands after a page has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorPolicy {
    /// Last event of the fetched page, even when earlier events failed to persist.
    /// Failed events before that id are never fetched again.
    #[default]
    LastFetched,
    /// Last event of the leading run of events that were stored or already present.
    LastContiguous,
}

impl FromStr for CursorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "last-fetched" => Ok(Self::LastFetched),
            "last-contiguous" => Ok(Self::LastContiguous),
            other => bail!("unknown cursor policy {other:?} (expected last-fetched or last-contiguous)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db: DbConfig,
    pub api: ApiConfig,
    pub slack: SlackConfig,
    pub cursor_policy: CursorPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("missing required environment variable {key}"))
        };
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a whole number of seconds, got {v:?}")),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let defaults = DbConfig::default();
        let db = DbConfig {
            database_url: get("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            user: get("DB_USER").unwrap_or(defaults.user),
            host: get("DB_HOST").unwrap_or(defaults.host),
            database: get("DB_NAME").unwrap_or(defaults.database),
            password: get("DB_PASSWORD").unwrap_or(defaults.password),
            port: match get("DB_PORT").filter(|v| !v.trim().is_empty()) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("DB_PORT must be a port number, got {v:?}"))?,
                None => defaults.port,
            },
            max_connections: defaults.max_connections,
            op_timeout: secs("EVTRACK_STORE_TIMEOUT_SECS", 10)?,
        };

        let mut api = ApiConfig::new(required("API_BASE_URL")?, required("API_KEY")?);
        api.timeout = secs("EVTRACK_HTTP_TIMEOUT_SECS", 20)?;

        let mut slack = SlackConfig::new(required("SLACK_BOT_TOKEN")?, required("SLACK_CHANNEL")?);
        if let Some(base) = get("SLACK_API_BASE").filter(|v| !v.trim().is_empty()) {
            slack.api_base = base;
        }

        let cursor_policy = match get("EVTRACK_CURSOR_POLICY") {
            Some(v) => v.parse().context("parsing EVTRACK_CURSOR_POLICY")?,
            None => CursorPolicy::default(),
        };

        Ok(Self {
            db,
            api,
            slack,
            cursor_policy,
            scheduler_enabled: get("EVTRACK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("EVTRACK_SYNC_CRON").unwrap_or_else(|| "0 */15 * * * *".to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Init,
    CursorLoaded,
    Fetched,
    CursorAdvanced,
    Reported,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub last_event_id: Option<String>,
    /// Id the cursor was advanced to in this run, if any.
    pub cursor: Option<String>,
}

impl RunSummary {
    pub fn report_text(&self) -> String {
        let mut text = format!(
            "Event processing completed:\n- Total events: {}\n- Processed: {}\n- Skipped: {}\n- Errors: {}\n- Last event ID: {}",
            self.fetched,
            self.processed,
            self.skipped,
            self.errored,
            self.last_event_id.as_deref().unwrap_or("N/A"),
        );
        if self.cursor != self.last_event_id {
            text.push_str(&format!(
                "\n- Cursor: {}",
                self.cursor.as_deref().unwrap_or("unchanged")
            ));
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persisted {
    Inserted,
    Skipped,
}

struct RunTrace {
    stage: RunStage,
}

impl RunTrace {
    fn enter(&mut self, stage: RunStage) {
        debug!(from = ?self.stage, to = ?stage, "pipeline stage");
        self.stage = stage;
    }
}

pub struct IngestionPipeline {
    cursors: Arc<dyn CursorStore>,
    events: Arc<dyn EventStore>,
    source: Arc<dyn EventSource>,
    notifier: Arc<dyn Notifier>,
    cursor_policy: CursorPolicy,
}

impl IngestionPipeline {
    pub fn new(
        cursors: Arc<dyn CursorStore>,
        events: Arc<dyn EventStore>,
        source: Arc<dyn EventSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cursors,
            events,
            source,
            notifier,
            cursor_policy: CursorPolicy::default(),
        }
    }

    pub fn with_cursor_policy(mut self, cursor_policy: CursorPolicy) -> Self {
        self.cursor_policy = cursor_policy;
        self
    }

    /// One complete run. Per-event failures are counted and reported; cursor, fetch
    /// and cursor-advance failures are returned after a failure notification.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_run", %run_id);

        async {
            let mut trace = RunTrace {
                stage: RunStage::Init,
            };
            match self.ingest(&mut trace, run_id, started_at).await {
                Ok(summary) => {
                    self.report_success(&summary).await;
                    trace.enter(RunStage::Reported);
                    info!(
                        fetched = summary.fetched,
                        processed = summary.processed,
                        skipped = summary.skipped,
                        errored = summary.errored,
                        "event ingestion run completed"
                    );
                    trace.enter(RunStage::Done);
                    Ok(summary)
                }
                Err(err) => {
                    error!(stage = ?trace.stage, error = %format!("{err:#}"), "event ingestion run failed");
                    trace.enter(RunStage::Failed);
                    notify_failure(self.notifier.as_ref(), &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest(
        &self,
        trace: &mut RunTrace,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary> {
        let cursor = self
            .cursors
            .last_processed_event_id()
            .await
            .context("loading last processed event id")?;
        trace.enter(RunStage::CursorLoaded);
        info!(cursor = cursor.as_deref().unwrap_or("none"), "loaded cursor");

        let events = self
            .source
            .fetch_events(cursor.as_deref())
            .await
            .context("fetching events")?;
        trace.enter(RunStage::Fetched);
        info!(count = events.len(), "fetched events");

        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut errored = 0usize;
        let mut error_thread: Option<MessageHandle> = None;
        let mut contiguous_end: Option<usize> = None;

        for (idx, event) in events.iter().enumerate() {
            match self.persist(event).await {
                Ok(Persisted::Inserted) => {
                    processed += 1;
                    info!(event_id = %event.id, "saved event");
                }
                Ok(Persisted::Skipped) => {
                    skipped += 1;
                    info!(event_id = %event.id, "skipped existing event");
                }
                Err(err) => {
                    errored += 1;
                    warn!(event_id = %event.id, error = %err, "failed to process event");
                    self.report_event_failure(&mut error_thread, event, err).await;
                }
            }
            if errored == 0 {
                contiguous_end = Some(idx);
            }
        }

        let last_event_id = events.last().map(|e| e.id.clone());
        let cursor_target = match self.cursor_policy {
            CursorPolicy::LastFetched => last_event_id.clone(),
            CursorPolicy::LastContiguous => contiguous_end.map(|idx| events[idx].id.clone()),
        };

        if let Some(target) = &cursor_target {
            self.cursors
                .advance(target)
                .await
                .with_context(|| format!("advancing cursor to {target}"))?;
            trace.enter(RunStage::CursorAdvanced);
            info!(cursor = %target, "updated last processed event id");
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched: events.len(),
            processed,
            skipped,
            errored,
            last_event_id,
            cursor: cursor_target,
        })
    }

    async fn persist(&self, event: &Event) -> Result<Persisted, StoreError> {
        if self.events.exists(&event.id).await? {
            return Ok(Persisted::Skipped);
        }
        self.events.insert(event).await?;
        Ok(Persisted::Inserted)
    }

    /// Every failure posts its own alert. The first alert that gets posted opens
    /// the thread and every failure adds its detail as a reply under that parent.
    async fn report_event_failure(
        &self,
        error_thread: &mut Option<MessageHandle>,
        event: &Event,
        err: StoreError,
    ) {
        let message = err.to_string();
        let err = anyhow::Error::new(err);

        let context = format!("Failed to process event {}", event.id);
        let alert = self.notifier.send_error(&context, &err).await;
        if error_thread.is_none() {
            *error_thread = alert;
        }
        if let Some(parent) = error_thread.as_ref() {
            self.notifier
                .send_detail(parent, &ErrorDetail::new(event.id.clone(), message))
                .await;
        }
    }

    async fn report_success(&self, summary: &RunSummary) {
        if let Some(handle) = self.notifier.send_success(&summary.report_text()).await {
            self.notifier.add_reaction(&handle, Reaction::Success).await;
        }
    }
}

async fn notify_failure(notifier: &dyn Notifier, err: &anyhow::Error) {
    if let Some(handle) = notifier.send_error(BATCH_FAILURE_CONTEXT, err).await {
        notifier.add_reaction(&handle, Reaction::Failure).await;
    }
}

/// Runs the pipeline once against Postgres, the HTTP event API and Slack.
/// The store pool is closed on every path once it has been opened.
pub async fn run_sync_once(config: &SyncConfig) -> Result<RunSummary> {
    let notifier: Arc<dyn Notifier> = Arc::new(SlackNotifier::new(config.slack.clone())?);
    let source = Arc::new(HttpEventSource::new(config.api.clone())?);

    let store = match PgStore::connect(&config.db).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            let err = anyhow::Error::new(err).context("connecting to event store");
            error!(error = %format!("{err:#}"), "event ingestion run failed");
            notify_failure(notifier.as_ref(), &err).await;
            return Err(err);
        }
    };

    let pipeline = IngestionPipeline::new(store.clone(), store.clone(), source, notifier)
        .with_cursor_policy(config.cursor_policy);
    let result = pipeline.run_once().await;
    store.close().await;
    result
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    run_sync_once(&config).await
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = PgStore::connect(&config.db)
        .await
        .context("connecting to event store")?;
    let result = store.migrate().await.context("applying migrations");
    store.close().await;
    result
}

/// Builds the in-process scheduler when enabled. Ticks that arrive while a run is
/// still in flight are skipped so runs never overlap.
pub async fn maybe_build_scheduler(config: SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let config = Arc::new(config);
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous ingestion run still in progress; skipping tick");
                return;
            };
            match run_sync_once(&config).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled ingestion run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingestion run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let cron = config.sync_cron.clone();
    let Some(mut sched) = maybe_build_scheduler(config).await? else {
        bail!("scheduler disabled; set EVTRACK_SCHEDULER_ENABLED=true to run on a schedule");
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use evtrack_adapters::FetchError;
    use evtrack_storage::MemoryStore;
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            data: json!({ "id": id }),
            created_at: Utc::now(),
        }
    }

    struct ScriptedSource {
        page: std::sync::Mutex<Option<Result<Vec<Event>, FetchError>>>,
        cursors_seen: std::sync::Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn page(ids: &[&str]) -> Arc<Self> {
            Self::with(Ok(ids.iter().map(|id| event(id)).collect()))
        }

        fn failing() -> Arc<Self> {
            Self::with(Err(FetchError::HttpStatus {
                status: 503,
                url: "http://events.test/events".to_string(),
            }))
        }

        fn with(result: Result<Vec<Event>, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                page: std::sync::Mutex::new(Some(result)),
                cursors_seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.cursors_seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn fetch_events(&self, cursor: Option<&str>) -> Result<Vec<Event>, FetchError> {
            self.cursors_seen
                .lock()
                .unwrap()
                .push(cursor.map(ToString::to_string));
            self.page.lock().unwrap().take().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_insert: HashSet<String>,
        fail_exists: HashSet<String>,
        fail_cursor_load: bool,
        fail_advance: bool,
        inserts: AtomicUsize,
    }

    impl FlakyStore {
        fn failing_inserts(ids: &[&str]) -> Self {
            Self {
                fail_insert: ids.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CursorStore for FlakyStore {
        async fn last_processed_event_id(&self) -> Result<Option<String>, StoreError> {
            if self.fail_cursor_load {
                return Err(StoreError::Timeout(Duration::from_secs(10)));
            }
            self.inner.last_processed_event_id().await
        }

        async fn advance(&self, event_id: &str) -> Result<(), StoreError> {
            if self.fail_advance {
                return Err(StoreError::Timeout(Duration::from_secs(10)));
            }
            self.inner.advance(event_id).await
        }
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn exists(&self, event_id: &str) -> Result<bool, StoreError> {
            if self.fail_exists.contains(event_id) {
                return Err(StoreError::Timeout(Duration::from_secs(10)));
            }
            self.inner.exists(event_id).await
        }

        async fn insert(&self, event: &Event) -> Result<(), StoreError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            if self.fail_insert.contains(&event.id) {
                return Err(StoreError::Duplicate(event.id.clone()));
            }
            self.inner.insert(event).await
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Note {
        Error { context: String, ts: String },
        Success { message: String, ts: String },
        Detail { parent: String, event_id: String },
        Reaction { ts: String, name: &'static str },
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notes: std::sync::Mutex<Vec<Note>>,
        next_ts: AtomicUsize,
        down: AtomicBool,
    }

    impl RecordingNotifier {
        fn down() -> Arc<Self> {
            let notifier = Self::default();
            notifier.down.store(true, Ordering::SeqCst);
            Arc::new(notifier)
        }

        fn notes(&self) -> Vec<Note> {
            self.notes.lock().unwrap().clone()
        }

        fn post(&self) -> Option<String> {
            if self.down.load(Ordering::SeqCst) {
                return None;
            }
            Some(format!("ts-{}", self.next_ts.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_error(&self, context: &str, _error: &anyhow::Error) -> Option<MessageHandle> {
            let ts = self.post()?;
            self.notes.lock().unwrap().push(Note::Error {
                context: context.to_string(),
                ts: ts.clone(),
            });
            Some(MessageHandle::new(ts))
        }

        async fn send_success(&self, message: &str) -> Option<MessageHandle> {
            let ts = self.post()?;
            self.notes.lock().unwrap().push(Note::Success {
                message: message.to_string(),
                ts: ts.clone(),
            });
            Some(MessageHandle::new(ts))
        }

        async fn send_detail(&self, parent: &MessageHandle, detail: &ErrorDetail) {
            if self.down.load(Ordering::SeqCst) {
                return;
            }
            self.notes.lock().unwrap().push(Note::Detail {
                parent: parent.ts.clone(),
                event_id: detail.event_id.clone(),
            });
        }

        async fn add_reaction(&self, handle: &MessageHandle, reaction: Reaction) {
            if self.down.load(Ordering::SeqCst) {
                return;
            }
            self.notes.lock().unwrap().push(Note::Reaction {
                ts: handle.ts.clone(),
                name: reaction.name(),
            });
        }
    }

    fn pipeline(
        store: &Arc<FlakyStore>,
        source: &Arc<ScriptedSource>,
        notifier: &Arc<RecordingNotifier>,
    ) -> IngestionPipeline {
        IngestionPipeline::new(
            store.clone(),
            store.clone(),
            source.clone(),
            notifier.clone(),
        )
    }

    async fn cursor_of(store: &FlakyStore) -> Option<String> {
        store.inner.last_processed_event_id().await.unwrap()
    }

    #[tokio::test]
    async fn fresh_page_is_fully_ingested() {
        let store = Arc::new(FlakyStore::default());
        let source = ScriptedSource::page(&["a", "b", "c"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();

        assert_eq!((summary.fetched, summary.processed, summary.skipped, summary.errored), (3, 3, 0, 0));
        assert_eq!(cursor_of(&store).await.as_deref(), Some("c"));
        assert_eq!(store.inner.events().await.len(), 3);

        let notes = notifier.notes();
        assert_eq!(notes.len(), 2);
        match &notes[0] {
            Note::Success { message, ts } => {
                assert!(message.contains("- Processed: 3"));
                assert!(message.contains("- Last event ID: c"));
                assert_eq!(
                    notes[1],
                    Note::Reaction {
                        ts: ts.clone(),
                        name: "white_check_mark"
                    }
                );
            }
            other => panic!("expected success notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_page_leaves_cursor_untouched() {
        let store = Arc::new(FlakyStore::default());
        store.inner.advance("z").await.unwrap();
        let source = ScriptedSource::page(&[]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();

        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.cursor, None);
        assert_eq!(store.inner.cursor_log().await.len(), 1);
        assert_eq!(source.cursors_seen.lock().unwrap()[0].as_deref(), Some("z"));

        let notes = notifier.notes();
        assert!(notes.iter().all(|n| !matches!(n, Note::Error { .. })));
        assert!(matches!(&notes[0], Note::Success { message, .. } if message.contains("Last event ID: N/A")));
    }

    #[tokio::test]
    async fn existing_events_are_skipped_not_reinserted() {
        let store = Arc::new(FlakyStore::default());
        store.inner.insert(&event("b")).await.unwrap();
        let source = ScriptedSource::page(&["a", "b", "c"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();

        assert_eq!((summary.processed, summary.skipped, summary.errored), (2, 1, 0));
        assert_eq!(store.inserts.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.events().await.len(), 3);
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal_and_reported_once() {
        let store = Arc::new(FlakyStore::default());
        store.inner.advance("prev").await.unwrap();
        let source = ScriptedSource::failing();
        let notifier = Arc::new(RecordingNotifier::default());

        let err = pipeline(&store, &source, &notifier).run_once().await.unwrap_err();

        assert!(format!("{err:#}").contains("fetching events"));
        assert_eq!(cursor_of(&store).await.as_deref(), Some("prev"));
        assert_eq!(store.inner.cursor_log().await.len(), 1);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
        assert_eq!(
            notifier.notes(),
            vec![
                Note::Error {
                    context: BATCH_FAILURE_CONTEXT.to_string(),
                    ts: "ts-1".to_string()
                },
                Note::Reaction {
                    ts: "ts-1".to_string(),
                    name: "x"
                },
            ]
        );
    }

    #[tokio::test]
    async fn cursor_load_failure_skips_fetch() {
        let store = Arc::new(FlakyStore {
            fail_cursor_load: true,
            ..Default::default()
        });
        let source = ScriptedSource::page(&["a"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let err = pipeline(&store, &source, &notifier).run_once().await.unwrap_err();

        assert!(format!("{err:#}").contains("loading last processed event id"));
        assert_eq!(source.calls(), 0);
        assert!(matches!(&notifier.notes()[0], Note::Error { context, .. } if context == BATCH_FAILURE_CONTEXT));
    }

    #[tokio::test]
    async fn cursor_advance_failure_is_fatal() {
        let store = Arc::new(FlakyStore {
            fail_advance: true,
            ..Default::default()
        });
        let source = ScriptedSource::page(&["a", "b"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let err = pipeline(&store, &source, &notifier).run_once().await.unwrap_err();

        assert!(format!("{err:#}").contains("advancing cursor to b"));
        assert_eq!(store.inner.events().await.len(), 2);
        let notes = notifier.notes();
        assert!(notes.iter().all(|n| !matches!(n, Note::Success { .. })));
        assert!(notes.contains(&Note::Reaction {
            ts: "ts-1".to_string(),
            name: "x"
        }));
    }

    #[tokio::test]
    async fn single_insert_failure_is_isolated() {
        let store = Arc::new(FlakyStore::failing_inserts(&["b"]));
        let source = ScriptedSource::page(&["a", "b", "c", "d"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();

        assert_eq!((summary.processed, summary.skipped, summary.errored), (3, 0, 1));
        assert_eq!(cursor_of(&store).await.as_deref(), Some("d"));
        assert!(summary.report_text().contains("- Errors: 1"));
        assert!(notifier.notes().contains(&Note::Error {
            context: "Failed to process event b".to_string(),
            ts: "ts-1".to_string()
        }));
    }

    #[tokio::test]
    async fn every_failure_alerts_and_replies_in_first_thread() {
        let store = Arc::new(FlakyStore::failing_inserts(&["a", "c", "d"]));
        let source = ScriptedSource::page(&["a", "b", "c", "d"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();
        assert_eq!(summary.errored, 3);

        let notes = notifier.notes();
        let alerts = notes
            .iter()
            .filter_map(|n| match n {
                Note::Error { context, ts } => Some((context.as_str(), ts.as_str())),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            alerts,
            vec![
                ("Failed to process event a", "ts-1"),
                ("Failed to process event c", "ts-2"),
                ("Failed to process event d", "ts-3"),
            ]
        );

        let details: HashMap<String, String> = notes
            .iter()
            .filter_map(|n| match n {
                Note::Detail { parent, event_id } => Some((event_id.clone(), parent.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(details.len(), 3);
        assert!(details.values().all(|parent| parent == "ts-1"));
    }

    #[tokio::test]
    async fn existence_check_failure_is_isolated() {
        let store = Arc::new(FlakyStore {
            fail_exists: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        let source = ScriptedSource::page(&["a", "b", "c"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();

        assert_eq!((summary.processed, summary.skipped, summary.errored), (2, 0, 1));
        assert_eq!(cursor_of(&store).await.as_deref(), Some("c"));
        assert_eq!(store.inserts.load(Ordering::SeqCst), 2);
        assert!(!store.inner.exists("b").await.unwrap());

        let notes = notifier.notes();
        assert!(notes.contains(&Note::Error {
            context: "Failed to process event b".to_string(),
            ts: "ts-1".to_string()
        }));
        assert!(notes.contains(&Note::Detail {
            parent: "ts-1".to_string(),
            event_id: "b".to_string()
        }));
        assert!(matches!(notes.last(), Some(Note::Reaction { name: "white_check_mark", .. })));
    }

    #[tokio::test]
    async fn notifier_outage_does_not_affect_ingestion() {
        let store = Arc::new(FlakyStore::failing_inserts(&["a"]));
        let source = ScriptedSource::page(&["a", "b"]);
        let notifier = RecordingNotifier::down();

        let summary = pipeline(&store, &source, &notifier).run_once().await.unwrap();

        assert_eq!((summary.processed, summary.errored), (1, 1));
        assert_eq!(cursor_of(&store).await.as_deref(), Some("b"));
        assert!(notifier.notes().is_empty());
    }

    #[tokio::test]
    async fn contiguous_policy_stops_before_first_failure() {
        let store = Arc::new(FlakyStore::failing_inserts(&["c"]));
        let source = ScriptedSource::page(&["a", "b", "c", "d"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier)
            .with_cursor_policy(CursorPolicy::LastContiguous)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.cursor.as_deref(), Some("b"));
        assert_eq!(cursor_of(&store).await.as_deref(), Some("b"));
        assert!(summary.report_text().ends_with("- Cursor: b"));
    }

    #[tokio::test]
    async fn contiguous_policy_holds_cursor_when_first_event_fails() {
        let store = Arc::new(FlakyStore::failing_inserts(&["a"]));
        let source = ScriptedSource::page(&["a", "b"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let summary = pipeline(&store, &source, &notifier)
            .with_cursor_policy(CursorPolicy::LastContiguous)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.cursor, None);
        assert!(store.inner.cursor_log().await.is_empty());
        assert!(summary.report_text().ends_with("- Cursor: unchanged"));
    }

    #[test]
    fn report_text_matches_channel_format() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            fetched: 3,
            processed: 2,
            skipped: 1,
            errored: 0,
            last_event_id: Some("c".to_string()),
            cursor: Some("c".to_string()),
        };
        assert_eq!(
            summary.report_text(),
            "Event processing completed:\n- Total events: 3\n- Processed: 2\n- Skipped: 1\n- Errors: 0\n- Last event ID: c"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("API_BASE_URL", "https://events.example.com"),
        ("API_KEY", "key"),
        ("SLACK_BOT_TOKEN", "xoxb-1"),
        ("SLACK_CHANNEL", "C42"),
    ];

    #[test]
    fn config_defaults_from_minimal_env() {
        let config = SyncConfig::from_lookup(env(&REQUIRED)).unwrap();

        assert_eq!(config.db.port, 5432);
        assert_eq!(config.db.op_timeout, Duration::from_secs(10));
        assert_eq!(config.api.timeout, Duration::from_secs(20));
        assert_eq!(config.api.page_size, 100);
        assert_eq!(config.slack.api_base, "https://slack.com/api");
        assert_eq!(config.cursor_policy, CursorPolicy::LastFetched);
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn config_reads_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "6543"),
            ("EVTRACK_CURSOR_POLICY", "last_contiguous"),
            ("EVTRACK_SCHEDULER_ENABLED", "true"),
            ("EVTRACK_HTTP_TIMEOUT_SECS", "5"),
        ]);
        let config = SyncConfig::from_lookup(env(&pairs)).unwrap();

        assert_eq!(config.db.host, "db.internal");
        assert_eq!(config.db.port, 6543);
        assert_eq!(config.cursor_policy, CursorPolicy::LastContiguous);
        assert!(config.scheduler_enabled);
        assert_eq!(config.api.timeout, Duration::from_secs(5));
    }

    #[test]
    fn empty_db_port_falls_back_to_default() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DB_PORT", " "));
        let config = SyncConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.db.port, 5432);
    }

    #[test]
    fn config_names_missing_variable() {
        let err = SyncConfig::from_lookup(env(&REQUIRED[..1])).unwrap_err();
        assert!(err.to_string().contains("API_KEY"));
    }

    #[test]
    fn unknown_cursor_policy_is_rejected() {
        assert!("newest".parse::<CursorPolicy>().is_err());
        assert_eq!(
            " Last-Fetched ".parse::<CursorPolicy>().unwrap(),
            CursorPolicy::LastFetched
        );
    }
}
