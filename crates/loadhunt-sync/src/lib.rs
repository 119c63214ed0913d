//! Orchestration: the ingest pipeline (fetch pages, reconcile, audit), the
//! description backfill run, and the collaborator scoring run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use loadhunt_adapters::{DescriptionProvider, RecordSource, ScoreCollaborator, SourceError};
use loadhunt_core::{DomainFields, RecordKind, RecordState};
use loadhunt_store::{
    RecordStore, ShortlistOutcome, ShortlistRequest, StoreError, QueryRequest, UpsertOutcome,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "loadhunt-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("fetching page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: SourceError,
    },
}

/// Ingest tuning. Values come from the environment in production and are
/// pinned in tests.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub max_pages: u32,
    pub page_delay: Duration,
    pub overwrite: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            page_delay: Duration::from_millis(250),
            overwrite: false,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            max_pages: env_parsed("LOADHUNT_MAX_PAGES", base.max_pages),
            page_delay: Duration::from_millis(env_parsed(
                "LOADHUNT_PAGE_DELAY_MS",
                base.page_delay.as_millis() as u64,
            )),
            overwrite: false,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub ran_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub pages_fetched: u32,
    pub total_returned: u64,
    pub inserted: u64,
    pub updated: u64,
    pub total_in_store: i64,
}

/// Fetches pages starting at 1 until the feed goes empty or the page cap,
/// reconciling each page as it lands. A fetch failure aborts the run;
/// earlier pages stay committed. Every run leaves a row in the audit
/// table.
pub async fn run_ingest(
    store: &RecordStore,
    source: &dyn RecordSource,
    config: &IngestConfig,
) -> Result<IngestSummary, SyncError> {
    let ran_at = Utc::now();
    let kind = source.kind();
    if config.overwrite {
        let removed = store.clear_kind(kind).await?;
        info!(kind = %kind, removed, "overwrite ingest cleared existing records");
    }

    let mut pages_fetched = 0u32;
    let mut total_returned = 0u64;
    let mut inserted = 0u64;
    let mut updated = 0u64;

    for page in 1..=config.max_pages {
        if page > 1 && !config.page_delay.is_zero() {
            sleep(config.page_delay).await;
        }
        let drafts = source
            .fetch_page(page)
            .await
            .map_err(|source| SyncError::Fetch { page, source })?;
        pages_fetched += 1;
        if drafts.is_empty() {
            break;
        }
        total_returned += drafts.len() as u64;
        for draft in &drafts {
            match store.upsert(draft).await? {
                UpsertOutcome::Inserted => inserted += 1,
                UpsertOutcome::Updated => updated += 1,
            }
        }
    }

    store
        .record_run(
            kind,
            &source.params_snapshot(),
            i64::from(pages_fetched),
            total_returned as i64,
        )
        .await?;
    let total_in_store = store.count(kind).await?;
    info!(
        kind = %kind,
        pages_fetched,
        total_returned,
        inserted,
        updated,
        total_in_store,
        "ingest finished"
    );
    Ok(IngestSummary {
        ran_at,
        kind,
        pages_fetched,
        total_returned,
        inserted,
        updated,
        total_in_store,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub ingest: IngestSummary,
    pub shortlist: ShortlistOutcome,
}

/// Ingest followed by shortlist in one motion, the everyday refresh.
pub async fn run_pipeline(
    store: &RecordStore,
    source: &dyn RecordSource,
    config: &IngestConfig,
    shortlist: &ShortlistRequest,
) -> Result<PipelineSummary, SyncError> {
    let ingest = run_ingest(store, source, config).await?;
    let shortlist = store.shortlist(source.kind(), shortlist).await?;
    Ok(PipelineSummary { ingest, shortlist })
}

/// Description backfill tuning.
#[derive(Debug, Clone)]
pub struct DescribeRunConfig {
    pub limit: i64,
    pub call_delay: Duration,
}

impl Default for DescribeRunConfig {
    fn default() -> Self {
        Self {
            limit: 25,
            call_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescribeRunSummary {
    pub considered: usize,
    pub described: u64,
    pub skipped: u64,
}

/// Backfills descriptions for jobs that arrived without one. A fetch
/// failure or an empty body skips the record; the row stays NEW for a
/// later pass.
pub async fn run_describe_batch(
    store: &RecordStore,
    provider: &dyn DescriptionProvider,
    config: &DescribeRunConfig,
) -> Result<DescribeRunSummary, SyncError> {
    let rows = store
        .query(
            RecordKind::Job,
            &QueryRequest {
                states: vec![RecordState::New],
                limit: config.limit,
                ..QueryRequest::default()
            },
        )
        .await?;

    let mut described = 0u64;
    let mut skipped = 0u64;
    for (index, record) in rows.iter().enumerate() {
        if index > 0 && !config.call_delay.is_zero() {
            sleep(config.call_delay).await;
        }
        let DomainFields::Job(job) = &record.fields else {
            skipped += 1;
            continue;
        };
        let Some(url) = job.redirect_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            skipped += 1;
            continue;
        };
        match provider.describe(url).await {
            Ok(text) if !text.trim().is_empty() => {
                store
                    .update_description(&record.key, &text, "fetched")
                    .await?;
                described += 1;
            }
            Ok(_) => {
                warn!(key = %record.key, "fetched description was empty");
                skipped += 1;
            }
            Err(err) => {
                warn!(key = %record.key, error = %err, "description fetch skipped a record");
                skipped += 1;
            }
        }
    }
    info!(considered = rows.len(), described, skipped, "describe run finished");
    Ok(DescribeRunSummary {
        considered: rows.len(),
        described,
        skipped,
    })
}

/// Collaborator scoring tuning.
#[derive(Debug, Clone)]
pub struct ScoreRunConfig {
    pub tag: String,
    pub only_unscored: bool,
    pub limit: i64,
    pub instructions: String,
    pub call_delay: Duration,
}

impl Default for ScoreRunConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            only_unscored: true,
            limit: 50,
            instructions: "Rate how attractive this posting is for an owner-operator."
                .to_string(),
            call_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreRunSummary {
    pub tag: String,
    pub considered: usize,
    pub scored: u64,
    pub skipped: u64,
}

/// Scores every row carrying the tag through the collaborator. A failure on
/// one record skips that record and keeps going; the row keeps NULL and a
/// later run picks it up again.
pub async fn run_score_batch(
    store: &RecordStore,
    kind: RecordKind,
    collaborator: &dyn ScoreCollaborator,
    config: &ScoreRunConfig,
) -> Result<ScoreRunSummary, SyncError> {
    let tag = config.tag.trim();
    if tag.is_empty() {
        return Err(SyncError::Store(StoreError::MissingTag));
    }
    let rows = store
        .query(
            kind,
            &QueryRequest {
                tag: Some(tag.to_string()),
                only_unscored: config.only_unscored,
                limit: config.limit,
                ..QueryRequest::default()
            },
        )
        .await?;

    let mut scored = 0u64;
    let mut skipped = 0u64;
    for (index, record) in rows.iter().enumerate() {
        if index > 0 && !config.call_delay.is_zero() {
            sleep(config.call_delay).await;
        }
        match collaborator.score(&config.instructions, record).await {
            Ok(value) => {
                store.update_score(&record.key, value).await?;
                scored += 1;
            }
            Err(err) => {
                warn!(key = %record.key, error = %err, "scoring skipped a record");
                skipped += 1;
            }
        }
    }
    info!(kind = %kind, tag, considered = rows.len(), scored, skipped, "score run finished");
    Ok(ScoreRunSummary {
        tag: tag.to_string(),
        considered: rows.len(),
        scored,
        skipped,
    })
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loadhunt_adapters::ScoreError;
    use loadhunt_core::{DomainFields, LoadFields, Record, RecordDraft, RecordState};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn draft(origin: &str, rate: &str) -> RecordDraft {
        RecordDraft::new(
            DomainFields::Load(LoadFields {
                origin_city: Some(origin.to_string()),
                origin_state: Some("TX".to_string()),
                rate: Some(rate.to_string()),
                distance: Some(500),
                company: Some("Acme Freight".to_string()),
                ..LoadFields::default()
            }),
            json!({"O-City": origin}),
        )
    }

    struct FakeSource {
        pages: Mutex<Vec<Result<Vec<RecordDraft>, ()>>>,
    }

    impl FakeSource {
        fn new(pages: Vec<Result<Vec<RecordDraft>, ()>>) -> Self {
            Self {
                pages: Mutex::new(pages),
            }
        }
    }

    #[async_trait]
    impl RecordSource for FakeSource {
        fn kind(&self) -> RecordKind {
            RecordKind::Load
        }

        fn params_snapshot(&self) -> serde_json::Value {
            json!({"source": "fake"})
        }

        async fn fetch_page(&self, _page: u32) -> Result<Vec<RecordDraft>, SourceError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(Vec::new());
            }
            pages
                .remove(0)
                .map_err(|_| SourceError::Config("page unavailable".to_string()))
        }
    }

    struct FlakyScorer {
        fail_key: String,
    }

    #[async_trait]
    impl ScoreCollaborator for FlakyScorer {
        async fn score(&self, _instructions: &str, record: &Record) -> Result<f64, ScoreError> {
            if record.key == self.fail_key {
                Err(ScoreError::EmptyReply)
            } else {
                Ok(7.5)
            }
        }
    }

    fn quick_config() -> IngestConfig {
        IngestConfig {
            page_delay: Duration::ZERO,
            ..IngestConfig::default()
        }
    }

    async fn open_store(dir: &TempDir) -> RecordStore {
        RecordStore::open(dir.path().join("board.db")).await.unwrap()
    }

    #[tokio::test]
    async fn ingest_walks_pages_until_empty_and_counts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.upsert(&draft("Dallas", "1800")).await.unwrap();

        let source = FakeSource::new(vec![
            Ok(vec![draft("Dallas", "1800"), draft("Tulsa", "2100")]),
            Ok(vec![draft("Laredo", "950")]),
        ]);
        let summary = run_ingest(&store, &source, &quick_config()).await.unwrap();
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.total_returned, 3);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.total_in_store, 3);
    }

    #[tokio::test]
    async fn ingest_aborts_on_fetch_failure_keeping_earlier_pages() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let source = FakeSource::new(vec![Ok(vec![draft("Dallas", "1800")]), Err(())]);

        let err = run_ingest(&store, &source, &quick_config()).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { page: 2, .. }));
        assert_eq!(store.count(RecordKind::Load).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overwrite_ingest_clears_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.upsert(&draft("Stale", "100")).await.unwrap();

        let source = FakeSource::new(vec![Ok(vec![draft("Dallas", "1800")])]);
        let config = IngestConfig {
            overwrite: true,
            ..quick_config()
        };
        let summary = run_ingest(&store, &source, &config).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.total_in_store, 1);
        assert!(store.get(&draft("Stale", "100").key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pipeline_ingests_then_tags() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let source = FakeSource::new(vec![Ok(vec![draft("Dallas", "1800"), draft("Tulsa", "2100")])]);

        let summary = run_pipeline(
            &store,
            &source,
            &quick_config(),
            &ShortlistRequest {
                tag: "fresh".to_string(),
                limit: 10,
                ..ShortlistRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(summary.ingest.inserted, 2);
        assert_eq!(summary.shortlist.marked, 2);
        assert_eq!(summary.shortlist.tag, "fresh");
    }

    #[tokio::test]
    async fn score_run_skips_failures_and_promotes_the_rest() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.upsert(&draft("Dallas", "1800")).await.unwrap();
        store.upsert(&draft("Tulsa", "2100")).await.unwrap();
        store
            .shortlist(
                RecordKind::Load,
                &ShortlistRequest {
                    tag: "runs".to_string(),
                    limit: 10,
                    ..ShortlistRequest::default()
                },
            )
            .await
            .unwrap();

        let scorer = FlakyScorer {
            fail_key: draft("Tulsa", "2100").key(),
        };
        let config = ScoreRunConfig {
            tag: "runs".to_string(),
            call_delay: Duration::ZERO,
            ..ScoreRunConfig::default()
        };
        let summary = run_score_batch(&store, RecordKind::Load, &scorer, &config)
            .await
            .unwrap();
        assert_eq!(summary.considered, 2);
        assert_eq!(summary.scored, 1);
        assert_eq!(summary.skipped, 1);

        let dallas = store.get(&draft("Dallas", "1800").key()).await.unwrap().unwrap();
        assert_eq!(dallas.state, RecordState::Scored);
        assert_eq!(dallas.match_score, Some(7.5));
        let tulsa = store.get(&draft("Tulsa", "2100").key()).await.unwrap().unwrap();
        assert_eq!(tulsa.match_score, None);

        // A rerun only touches what is still unscored.
        let summary = run_score_batch(&store, RecordKind::Load, &scorer, &config)
            .await
            .unwrap();
        assert_eq!(summary.considered, 1);
    }

    #[tokio::test]
    async fn score_run_requires_a_tag() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let err = run_score_batch(
            &store,
            RecordKind::Load,
            &MockFine,
            &ScoreRunConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::MissingTag)));
    }

    struct MockFine;

    #[async_trait]
    impl ScoreCollaborator for MockFine {
        async fn score(&self, _i: &str, _r: &Record) -> Result<f64, ScoreError> {
            Ok(5.0)
        }
    }

    fn job_draft(id: &str, url: Option<&str>) -> RecordDraft {
        RecordDraft::new(
            DomainFields::Job(loadhunt_core::JobFields {
                source_id: Some(id.to_string()),
                title: Some("Driver".to_string()),
                redirect_url: url.map(str::to_string),
                ..loadhunt_core::JobFields::default()
            }),
            json!({"id": id}),
        )
    }

    struct CannedDescriptions {
        fail_url: String,
    }

    #[async_trait]
    impl DescriptionProvider for CannedDescriptions {
        async fn describe(&self, url: &str) -> Result<String, SourceError> {
            if url == self.fail_url {
                Err(SourceError::Config("unreachable".to_string()))
            } else {
                Ok(format!("Plain text for {url}"))
            }
        }
    }

    #[tokio::test]
    async fn describe_run_fills_new_jobs_and_skips_failures() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.upsert(&job_draft("1", Some("https://example.com/j/1"))).await.unwrap();
        store.upsert(&job_draft("2", Some("https://example.com/j/2"))).await.unwrap();
        store.upsert(&job_draft("3", None)).await.unwrap();

        let provider = CannedDescriptions {
            fail_url: "https://example.com/j/2".to_string(),
        };
        let config = DescribeRunConfig {
            call_delay: Duration::ZERO,
            ..DescribeRunConfig::default()
        };
        let summary = run_describe_batch(&store, &provider, &config).await.unwrap();
        assert_eq!(summary.considered, 3);
        assert_eq!(summary.described, 1);
        assert_eq!(summary.skipped, 2);

        let described = store.get("adzuna:1").await.unwrap().unwrap();
        assert_eq!(described.state, RecordState::Ready);
        let failed = store.get("adzuna:2").await.unwrap().unwrap();
        assert_eq!(failed.state, RecordState::New);

        // The described row leaves the NEW pool; only failures remain.
        let summary = run_describe_batch(&store, &provider, &config).await.unwrap();
        assert_eq!(summary.considered, 2);
        assert_eq!(summary.described, 0);
    }
}
