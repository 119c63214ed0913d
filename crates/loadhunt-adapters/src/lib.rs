//! Boundary collaborators: the paginated job-search API client, the
//! sample-file load source, the HTML description fetcher, and the scoring
//! collaborators (LLM-delegated and deterministic mock).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use loadhunt_core::{
    mock_score_for_key, normalize_pickup, parse_int_loose, parse_score_reply, DomainFields,
    JobFields, LoadFields, NoScoreInReply, Record, RecordDraft, RecordKind,
};
use scraper::{ElementRef, Html};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "loadhunt-adapters";

/// Fetched descriptions are truncated to this many chars before storage.
pub const DESCRIPTION_CHAR_BUDGET: usize = 20_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Config(String),
}

/// A paginated feed of record drafts. Page numbers start at 1; an empty
/// page means the feed is exhausted.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn kind(&self) -> RecordKind;
    /// Parameters worth keeping in the runs audit table.
    fn params_snapshot(&self) -> Value;
    async fn fetch_page(&self, page: u32) -> Result<Vec<RecordDraft>, SourceError>;
}

// ---------------------------------------------------------------------------
// Job search API

#[derive(Debug, Clone)]
pub struct JobSearchConfig {
    pub app_id: String,
    pub app_key: String,
    pub country: String,
    pub what: String,
    pub where_text: String,
    pub results_per_page: u32,
    pub timeout: Duration,
}

impl Default for JobSearchConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_key: String::new(),
            country: "us".to_string(),
            what: "cdl driver".to_string(),
            where_text: String::new(),
            results_per_page: 50,
            timeout: Duration::from_secs(20),
        }
    }
}

impl JobSearchConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            app_id: env_or("ADZUNA_APP_ID", &base.app_id),
            app_key: env_or("ADZUNA_APP_KEY", &base.app_key),
            country: env_or("ADZUNA_COUNTRY", &base.country),
            what: env_or("LOADHUNT_JOB_WHAT", &base.what),
            where_text: env_or("LOADHUNT_JOB_WHERE", &base.where_text),
            results_per_page: std::env::var("LOADHUNT_JOB_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.results_per_page),
            timeout: base.timeout,
        }
    }
}

/// Adzuna-shaped search client.
#[derive(Debug)]
pub struct JobSearchClient {
    client: reqwest::Client,
    config: JobSearchConfig,
}

impl JobSearchClient {
    pub fn new(config: JobSearchConfig) -> Result<Self, SourceError> {
        if config.app_id.trim().is_empty() || config.app_key.trim().is_empty() {
            return Err(SourceError::Config(
                "job search credentials are not configured (ADZUNA_APP_ID / ADZUNA_APP_KEY)"
                    .to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RecordSource for JobSearchClient {
    fn kind(&self) -> RecordKind {
        RecordKind::Job
    }

    fn params_snapshot(&self) -> Value {
        json!({
            "country": self.config.country,
            "what": self.config.what,
            "where": self.config.where_text,
            "results_per_page": self.config.results_per_page,
        })
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<RecordDraft>, SourceError> {
        let url = format!(
            "https://api.adzuna.com/v1/api/jobs/{}/search/{page}",
            self.config.country
        );
        let mut request = self
            .client
            .get(&url)
            .query(&[
                ("app_id", self.config.app_id.as_str()),
                ("app_key", self.config.app_key.as_str()),
                ("what", self.config.what.as_str()),
            ])
            .query(&[("results_per_page", self.config.results_per_page)]);
        if !self.config.where_text.trim().is_empty() {
            request = request.query(&[("where", self.config.where_text.as_str())]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body: Value = response.json().await?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(page, count = results.len(), "job search page fetched");
        Ok(results.iter().map(job_draft_from_api).collect())
    }
}

/// Maps one job-search result payload into a draft. Ids arrive as either
/// strings or numbers depending on the feed.
pub fn job_draft_from_api(value: &Value) -> RecordDraft {
    let description = text_field(value, "description").filter(|d| !d.is_empty());
    let fields = JobFields {
        source_id: loose_text(value.get("id")),
        title: text_field(value, "title"),
        company: value
            .get("company")
            .and_then(|c| text_field(c, "display_name")),
        location: value
            .get("location")
            .and_then(|l| text_field(l, "display_name")),
        created: text_field(value, "created"),
        redirect_url: text_field(value, "redirect_url"),
        description_source: description.as_ref().map(|_| "api".to_string()),
        description_text: description,
    };
    RecordDraft::new(DomainFields::Job(fields), value.clone())
}

// ---------------------------------------------------------------------------
// Sample-file load source

/// Reads load rows from a JSON array on disk, the capture format the load
/// board exports. Everything fits on one page.
pub struct SampleFileSource {
    path: PathBuf,
}

impl SampleFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for SampleFileSource {
    fn kind(&self) -> RecordKind {
        RecordKind::Load
    }

    fn params_snapshot(&self) -> Value {
        json!({ "sample_path": self.path.display().to_string() })
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<RecordDraft>, SourceError> {
        if page > 1 {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let rows: Vec<Value> =
            serde_json::from_str(&text).map_err(|source| SourceError::Json {
                context: self.path.display().to_string(),
                source,
            })?;
        debug!(path = %self.path.display(), count = rows.len(), "sample loads read");
        Ok(rows.iter().map(load_draft_from_sample).collect())
    }
}

/// Maps one captured load row into a draft, normalizing the pickup date and
/// the comma-grouped numerics on the way in.
pub fn load_draft_from_sample(value: &Value) -> RecordDraft {
    let pickup_raw = text_field(value, "Pickup");
    let fields = LoadFields {
        origin_city: text_field(value, "O-City"),
        origin_state: text_field(value, "O-State"),
        dest_city: text_field(value, "D-City"),
        dest_state: text_field(value, "D-State"),
        origin_deadhead: loose_int(value.get("O-DH")),
        dest_deadhead: loose_int(value.get("D-DH")),
        distance: loose_int(value.get("Distance")),
        rate: loose_text(value.get("Rate")),
        rate_per_mile: loose_text(value.get("RPM")),
        weight: loose_int(value.get("Weight")),
        length: loose_int(value.get("Length")),
        equipment: text_field(value, "Equip"),
        mode: text_field(value, "Mode"),
        pickup_date: Some(normalize_pickup(pickup_raw.as_deref())),
        pickup: pickup_raw,
        company: text_field(value, "Company"),
        updated: text_field(value, "Updated"),
        deadhead_to_pickup: loose_text(value.get("D2P")),
    };
    RecordDraft::new(DomainFields::Load(fields), value.clone())
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Strings stay strings, numbers render as text; anything else is absent.
fn loose_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn loose_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_int_loose(s),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Description fetching

/// Turns a posting URL into plain description text.
#[async_trait]
pub trait DescriptionProvider: Send + Sync {
    async fn describe(&self, url: &str) -> Result<String, SourceError>;
}

/// Fetches a posting page and reduces it to plain text within the char
/// budget.
pub struct DescriptionFetcher {
    client: reqwest::Client,
    char_budget: usize,
}

impl DescriptionFetcher {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            char_budget: DESCRIPTION_CHAR_BUDGET,
        })
    }
}

#[async_trait]
impl DescriptionProvider for DescriptionFetcher {
    async fn describe(&self, url: &str) -> Result<String, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        Ok(extract_plain_text(&body, self.char_budget))
    }
}

/// Strips markup, collapses whitespace, truncates to `budget` chars.
/// Script and style subtrees are dropped entirely; their text is code,
/// not description.
pub fn extract_plain_text(html: &str, budget: usize) -> String {
    let document = Html::parse_document(html);
    let mut joined = String::new();
    collect_content_text(document.root_element(), &mut joined);
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(budget).collect()
}

fn collect_content_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            scraper::Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            scraper::Node::Element(el) if !matches!(el.name(), "script" | "style") => {
                if let Some(child_ref) = ElementRef::wrap(child) {
                    collect_content_text(child_ref, out);
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring collaborators

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("scoring call failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Malformed(#[from] NoScoreInReply),
    #[error("scoring reply carried no content")]
    EmptyReply,
    #[error("{0}")]
    Config(String),
}

/// Something that can judge one record against an instruction, yielding a
/// score in [0, 10].
#[async_trait]
pub trait ScoreCollaborator: Send + Sync {
    async fn score(&self, instructions: &str, record: &Record) -> Result<f64, ScoreError>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            endpoint: env_or("LOADHUNT_LLM_ENDPOINT", &base.endpoint),
            api_key: env_or("OPENAI_API_KEY", &base.api_key),
            model: env_or("LOADHUNT_LLM_MODEL", &base.model),
            timeout: base.timeout,
        }
    }
}

/// Chat-completions scorer. The reply must contain a bare number; replies
/// without one fail that record rather than defaulting.
pub struct LlmScorer {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmScorer {
    pub fn new(config: LlmConfig) -> Result<Self, ScoreError> {
        if config.api_key.trim().is_empty() {
            return Err(ScoreError::Config(
                "LLM scoring requires OPENAI_API_KEY".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ScoreCollaborator for LlmScorer {
    async fn score(&self, instructions: &str, record: &Record) -> Result<f64, ScoreError> {
        let payload = json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "{instructions}\nReply with a single number from 0 to 10. No words."
                    ),
                },
                { "role": "user", "content": record_prompt(record) },
            ],
        });
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(ScoreError::EmptyReply)?;
        Ok(parse_score_reply(content)?)
    }
}

/// Renders a record as the field lines a scoring prompt sees.
pub fn record_prompt(record: &Record) -> String {
    let line = |label: &str, value: &Option<String>| {
        format!("{label}: {}\n", value.as_deref().unwrap_or("-"))
    };
    match &record.fields {
        DomainFields::Job(job) => {
            let mut text = String::new();
            text.push_str(&line("Title", &job.title));
            text.push_str(&line("Company", &job.company));
            text.push_str(&line("Location", &job.location));
            text.push_str(&line("Posted", &job.created));
            text.push_str(&line("Description", &job.description_text));
            text
        }
        DomainFields::Load(load) => {
            let mut text = String::new();
            text.push_str(&format!(
                "Route: {}, {} -> {}, {}\n",
                load.origin_city.as_deref().unwrap_or("-"),
                load.origin_state.as_deref().unwrap_or("-"),
                load.dest_city.as_deref().unwrap_or("-"),
                load.dest_state.as_deref().unwrap_or("-"),
            ));
            text.push_str(&format!(
                "Pickup: {}\n",
                load.pickup_date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
            ));
            text.push_str(&line("Rate", &load.rate));
            text.push_str(&line("Rate/mile", &load.rate_per_mile));
            text.push_str(&format!(
                "Distance: {}\n",
                load.distance.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
            ));
            text.push_str(&line("Deadhead to pickup", &load.deadhead_to_pickup));
            text.push_str(&line("Equipment", &load.equipment));
            text.push_str(&line("Company", &load.company));
            text
        }
    }
}

/// Offline scorer: a stable hash of the record key, spread over 0.0-10.0.
pub struct MockScorer;

#[async_trait]
impl ScoreCollaborator for MockScorer {
    async fn score(&self, _instructions: &str, record: &Record) -> Result<f64, ScoreError> {
        Ok(mock_score_for_key(&record.key))
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loadhunt_core::RecordState;
    use serde_json::json;

    fn record(key: &str, fields: DomainFields) -> Record {
        Record {
            key: key.to_string(),
            fields,
            state: RecordState::Ready,
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            shortlist_tag: None,
            shortlisted_at: None,
            match_score: None,
            raw: Value::Null,
        }
    }

    #[test]
    fn job_draft_reads_nested_names_and_numeric_ids() {
        let payload = json!({
            "id": 4242,
            "title": "CDL-A Driver",
            "company": {"display_name": "Acme Logistics"},
            "location": {"display_name": "Dallas, TX"},
            "created": "2025-03-01T00:00:00Z",
            "redirect_url": "https://example.com/j/4242",
            "description": "  Regional runs, home weekends.  ",
        });
        let draft = job_draft_from_api(&payload);
        let DomainFields::Job(fields) = &draft.fields else {
            panic!("expected job fields");
        };
        assert_eq!(fields.source_id.as_deref(), Some("4242"));
        assert_eq!(fields.company.as_deref(), Some("Acme Logistics"));
        assert_eq!(
            fields.description_text.as_deref(),
            Some("Regional runs, home weekends.")
        );
        assert_eq!(fields.description_source.as_deref(), Some("api"));
        assert_eq!(draft.key(), "adzuna:4242");
    }

    #[test]
    fn job_draft_without_description_leaves_source_unset() {
        let draft = job_draft_from_api(&json!({
            "id": "9",
            "title": "Dispatcher",
            "redirect_url": "https://example.com/j/9",
        }));
        let DomainFields::Job(fields) = &draft.fields else {
            panic!("expected job fields");
        };
        assert_eq!(fields.description_text, None);
        assert_eq!(fields.description_source, None);
    }

    #[test]
    fn load_draft_handles_grouped_numbers_and_pickup() {
        let payload = json!({
            "O-City": "Dallas",
            "O-State": "TX",
            "D-City": "Atlanta",
            "D-State": "GA",
            "O-DH": "1,025",
            "Distance": 780,
            "Rate": "$1,850",
            "Weight": "44,000",
            "Pickup": "TODAY",
            "Company": "Acme Freight",
            "D2P": 12.5,
        });
        let draft = load_draft_from_sample(&payload);
        let DomainFields::Load(fields) = &draft.fields else {
            panic!("expected load fields");
        };
        assert_eq!(fields.origin_deadhead, Some(1025));
        assert_eq!(fields.weight, Some(44_000));
        assert_eq!(fields.rate.as_deref(), Some("$1,850"));
        assert_eq!(fields.deadhead_to_pickup.as_deref(), Some("12.5"));
        assert_eq!(fields.pickup.as_deref(), Some("TODAY"));
        assert_eq!(fields.pickup_date, Some(Utc::now().date_naive()));
        assert!(draft.key().starts_with("load:"));
    }

    #[test]
    fn plain_text_extraction_strips_and_collapses() {
        let html = "<html><head><style>p { color: red; }</style></head>\
                    <body><h1>CDL Driver</h1>\n<p>Home   weekends.\n\
                    <b>Apply</b> today.</p><script>var x = 1;</script></body></html>";
        let text = extract_plain_text(html, 10_000);
        assert_eq!(text, "CDL Driver Home weekends. Apply today.");
        assert!(!text.contains("var x"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn plain_text_truncates_on_char_boundaries() {
        let html = format!("<p>{}</p>", "é".repeat(50));
        let text = extract_plain_text(&html, 10);
        assert_eq!(text.chars().count(), 10);
    }

    #[tokio::test]
    async fn mock_scorer_is_stable_per_key() {
        let a = record(
            "load:abcdef",
            DomainFields::Load(LoadFields::default()),
        );
        let first = MockScorer.score("anything", &a).await.unwrap();
        let second = MockScorer.score("else", &a).await.unwrap();
        assert_eq!(first, second);
        assert!((0.0..=10.0).contains(&first));
    }

    #[test]
    fn prompt_renders_both_kinds() {
        let job = record(
            "adzuna:1",
            DomainFields::Job(JobFields {
                title: Some("Dispatcher".to_string()),
                ..JobFields::default()
            }),
        );
        assert!(record_prompt(&job).contains("Title: Dispatcher"));

        let load = record(
            "load:1",
            DomainFields::Load(LoadFields {
                origin_city: Some("Dallas".to_string()),
                dest_city: Some("Atlanta".to_string()),
                ..LoadFields::default()
            }),
        );
        let text = record_prompt(&load);
        assert!(text.contains("Dallas"));
        assert!(text.contains("Atlanta"));
    }

    #[test]
    fn client_construction_requires_credentials() {
        let err = JobSearchClient::new(JobSearchConfig::default()).unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
        assert!(LlmScorer::new(LlmConfig::default()).is_err());
    }

    #[tokio::test]
    async fn sample_source_is_single_page() {
        let source = SampleFileSource::new("/nonexistent/sample.json");
        assert!(source.fetch_page(2).await.unwrap().is_empty());
        assert!(matches!(
            source.fetch_page(1).await.unwrap_err(),
            SourceError::Io { .. }
        ));
    }
}
