//! JSON API over the record store: ingest, shortlist, query, point updates,
//! batch scoring, and the combined pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use loadhunt_adapters::{
    DescriptionFetcher, JobSearchClient, JobSearchConfig, LlmConfig, LlmScorer, MockScorer,
    RecordSource, SampleFileSource, ScoreCollaborator, SourceError,
};
use loadhunt_core::{RecordFilter, RecordKind, RecordState, ScoreConfig};
use loadhunt_store::{
    QueryRequest, RecordStore, ShortlistRequest, StoreError,
};
use loadhunt_sync::{
    run_describe_batch, run_ingest, run_pipeline, run_score_batch, DescribeRunConfig,
    IngestConfig, ScoreRunConfig, SyncError,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

pub const CRATE_NAME: &str = "loadhunt-web";

/// Server-wide defaults. Every request may override the database path.
#[derive(Debug, Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub sample_loads_path: PathBuf,
    pub score: ScoreConfig,
}

impl AppState {
    pub fn from_env() -> Self {
        Self {
            db_path: PathBuf::from(env_or("LOADHUNT_DB_PATH", "loadhunt.db")),
            sample_loads_path: PathBuf::from(env_or(
                "LOADHUNT_SAMPLE_LOADS",
                "sample_loads.json",
            )),
            score: ScoreConfig::default(),
        }
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/shortlist", post(shortlist))
        .route("/query", post(query))
        .route("/records/describe", post(describe))
        .route("/records/describe-batch", post(describe_batch))
        .route("/records/score", post(score))
        .route("/records/state", post(set_state))
        .route("/records/score-batch", post(score_batch))
        .route("/pipeline", post(pipeline))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Errors

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Upstream(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Upstream(detail) => (StatusCode::BAD_GATEWAY, detail),
            ApiError::Internal(err) => {
                error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ApiError::NotFound(format!("record not found: {key}")),
            err @ (StoreError::MissingTag | StoreError::InvalidTransition { .. }) => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Config(detail) => ApiError::BadRequest(detail),
            err @ (SourceError::Io { .. } | SourceError::Json { .. }) => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(inner) => inner.into(),
            err @ SyncError::Fetch { .. } => ApiError::Upstream(err.to_string()),
        }
    }
}

async fn open_store(state: &AppState, db_path: &Option<String>) -> Result<RecordStore, ApiError> {
    let path = db_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.db_path.clone());
    Ok(RecordStore::open(path).await?)
}

fn build_source(
    state: &AppState,
    kind: RecordKind,
    sample_path: &Option<String>,
) -> Result<Box<dyn RecordSource>, ApiError> {
    match kind {
        RecordKind::Load => {
            let path = sample_path
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| state.sample_loads_path.clone());
            Ok(Box::new(SampleFileSource::new(path)))
        }
        RecordKind::Job => Ok(Box::new(JobSearchClient::new(JobSearchConfig::from_env())?)),
    }
}

// ---------------------------------------------------------------------------
// Handlers

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct IngestBody {
    kind: RecordKind,
    db_path: Option<String>,
    sample_path: Option<String>,
    overwrite: Option<bool>,
    max_pages: Option<u32>,
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let source = build_source(&state, body.kind, &body.sample_path)?;
    let mut config = IngestConfig::from_env();
    if let Some(pages) = body.max_pages {
        config.max_pages = pages;
    }
    config.overwrite = body.overwrite.unwrap_or(false);
    let summary = run_ingest(&store, source.as_ref(), &config).await?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct ShortlistBody {
    kind: RecordKind,
    db_path: Option<String>,
    tag: Option<String>,
    #[serde(flatten)]
    filter: RecordFilter,
    replace: Option<bool>,
    limit: Option<i64>,
    only_unscored: Option<bool>,
}

async fn shortlist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ShortlistBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let mut filter = body.filter;
    // Job shortlists default to the last week unless told otherwise.
    if body.kind == RecordKind::Job && filter.days.is_none() {
        filter.days = Some(7);
    }
    let request = ShortlistRequest {
        tag: body.tag.unwrap_or_default(),
        filter,
        replace: body.replace.unwrap_or(false),
        limit: body.limit.unwrap_or(25),
        only_unscored: body.only_unscored.unwrap_or(false),
    };
    let outcome = store.shortlist(body.kind, &request).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct QueryBody {
    kind: RecordKind,
    db_path: Option<String>,
    tag: Option<String>,
    #[serde(flatten)]
    filter: RecordFilter,
    states: Option<Vec<String>>,
    only_unscored: Option<bool>,
    require_description: Option<bool>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let mut states = Vec::new();
    for text in body.states.unwrap_or_default() {
        let state = RecordState::parse(&text)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown state {text:?}")))?;
        states.push(state);
    }
    let request = QueryRequest {
        tag: body.tag,
        filter: body.filter,
        states,
        only_unscored: body.only_unscored.unwrap_or(false),
        require_description: body.require_description.unwrap_or(false),
        limit: body.limit.unwrap_or(200),
        offset: body.offset.unwrap_or(0),
    };
    let rows = store.query(body.kind, &request).await?;
    Ok(Json(json!({ "count": rows.len(), "results": rows })))
}

#[derive(Deserialize)]
struct DescribeBody {
    db_path: Option<String>,
    key: String,
    description_text: String,
    description_source: Option<String>,
}

async fn describe(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DescribeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let source = body.description_source.as_deref().unwrap_or("manual");
    let outcome = store
        .update_description(&body.key, &body.description_text, source)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct DescribeBatchBody {
    db_path: Option<String>,
    limit: Option<i64>,
}

async fn describe_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DescribeBatchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let fetcher = DescriptionFetcher::new(std::time::Duration::from_secs(20))?;
    let mut config = DescribeRunConfig::default();
    if let Some(limit) = body.limit {
        config.limit = limit;
    }
    let summary = run_describe_batch(&store, &fetcher, &config).await?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct ScoreBody {
    db_path: Option<String>,
    key: String,
    match_score: f64,
}

async fn score(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScoreBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !(0.0..=10.0).contains(&body.match_score) {
        return Err(ApiError::BadRequest(format!(
            "match_score must be within 0..=10, got {}",
            body.match_score
        )));
    }
    let store = open_store(&state, &body.db_path).await?;
    let new_state = store.update_score(&body.key, body.match_score).await?;
    Ok(Json(json!({
        "key": body.key,
        "state": new_state,
        "match_score": body.match_score,
    })))
}

#[derive(Deserialize)]
struct StateBody {
    db_path: Option<String>,
    key: String,
    state: String,
}

async fn set_state(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let target = RecordState::parse(&body.state)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown state {:?}", body.state)))?;
    let store = open_store(&state, &body.db_path).await?;
    let new_state = store.update_state(&body.key, target).await?;
    Ok(Json(json!({ "key": body.key, "state": new_state })))
}

#[derive(Deserialize)]
struct ScoreBatchBody {
    kind: RecordKind,
    db_path: Option<String>,
    tag: String,
    only_unscored: Option<bool>,
    limit: Option<i64>,
    strategy: Option<String>,
    instructions: Option<String>,
}

async fn score_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScoreBatchBody>,
) -> Result<Response, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let only_unscored = body.only_unscored.unwrap_or(true);
    let limit = body.limit.unwrap_or(50);
    let strategy = body.strategy.unwrap_or_else(|| {
        match body.kind {
            RecordKind::Load => "formula",
            RecordKind::Job => "llm",
        }
        .to_string()
    });

    match strategy.as_str() {
        "formula" => {
            let outcome = store
                .score_shortlisted(body.kind, &body.tag, only_unscored, limit, &state.score)
                .await?;
            Ok(Json(outcome).into_response())
        }
        "mock" | "llm" => {
            let collaborator: Box<dyn ScoreCollaborator> = match strategy.as_str() {
                "mock" => Box::new(MockScorer),
                _ => Box::new(
                    LlmScorer::new(LlmConfig::from_env())
                        .map_err(|err| ApiError::BadRequest(err.to_string()))?,
                ),
            };
            let mut config = ScoreRunConfig {
                tag: body.tag,
                only_unscored,
                limit,
                ..ScoreRunConfig::default()
            };
            if let Some(instructions) = body.instructions {
                config.instructions = instructions;
            }
            let summary =
                run_score_batch(&store, body.kind, collaborator.as_ref(), &config).await?;
            Ok(Json(summary).into_response())
        }
        other => Err(ApiError::BadRequest(format!(
            "unknown scoring strategy {other:?}"
        ))),
    }
}

#[derive(Deserialize)]
struct PipelineBody {
    kind: RecordKind,
    db_path: Option<String>,
    sample_path: Option<String>,
    overwrite: Option<bool>,
    max_pages: Option<u32>,
    tag: Option<String>,
    #[serde(flatten)]
    filter: RecordFilter,
    replace: Option<bool>,
    shortlist_limit: Option<i64>,
    only_unscored: Option<bool>,
}

async fn pipeline(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PipelineBody>,
) -> Result<impl IntoResponse, ApiError> {
    let store = open_store(&state, &body.db_path).await?;
    let source = build_source(&state, body.kind, &body.sample_path)?;
    let mut config = IngestConfig::from_env();
    if let Some(pages) = body.max_pages {
        config.max_pages = pages;
    }
    config.overwrite = body.overwrite.unwrap_or(false);
    let mut filter = body.filter;
    if body.kind == RecordKind::Job && filter.days.is_none() {
        filter.days = Some(7);
    }
    let shortlist = ShortlistRequest {
        tag: body.tag.unwrap_or_default(),
        filter,
        replace: body.replace.unwrap_or(false),
        limit: body.shortlist_limit.unwrap_or(25),
        only_unscored: body.only_unscored.unwrap_or(false),
    };
    let summary = run_pipeline(&store, source.as_ref(), &config, &shortlist).await?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn sample_loads() -> Value {
        json!([
            {
                "O-City": "Dallas", "O-State": "TX",
                "D-City": "Atlanta", "D-State": "GA",
                "Rate": "$1,500", "Distance": 780,
                "Pickup": "2025-03-15", "Company": "Acme Freight",
            },
            {
                "O-City": "Laredo", "O-State": "TX",
                "D-City": "Memphis", "D-State": "TN",
                "Rate": "3000", "Distance": 900, "D2P": "0",
                "Pickup": "2025-03-16", "Company": "Blue Line",
            },
        ])
    }

    fn harness() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let sample = dir.path().join("sample_loads.json");
        std::fs::write(&sample, sample_loads().to_string()).unwrap();
        let state = Arc::new(AppState {
            db_path: dir.path().join("board.db"),
            sample_loads_path: sample,
            score: ScoreConfig::default(),
        });
        (dir, router(state))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn ingest_sample(app: &Router) {
        let (status, body) = send(app, post_json("/ingest", json!({ "kind": "load" }))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["inserted"], 2);
    }

    #[tokio::test]
    async fn health_answers() {
        let (_dir, app) = harness();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ingest_then_query_round_trip() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;

        let (status, body) = send(
            &app,
            post_json("/query", json!({ "kind": "load", "origin_state": "TX" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["results"][0]["state"], "READY");

        let (status, body) = send(
            &app,
            post_json("/query", json!({ "kind": "load", "origin_city": "laredo" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["results"][0]["fields"]["origin_city"], "Laredo");
    }

    #[tokio::test]
    async fn reingest_updates_instead_of_duplicating() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;
        let (status, body) = send(&app, post_json("/ingest", json!({ "kind": "load" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 0);
        assert_eq!(body["updated"], 2);
        assert_eq!(body["total_in_store"], 2);
    }

    #[tokio::test]
    async fn shortlist_and_formula_batch() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;

        let (status, body) = send(
            &app,
            post_json("/shortlist", json!({ "kind": "load", "tag": "monday" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["marked"], 2);
        assert_eq!(body["total_tagged"], 2);

        let (status, body) = send(
            &app,
            post_json(
                "/records/score-batch",
                json!({ "kind": "load", "tag": "monday" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scored"], 2);

        // Best score leads once scoring has run.
        let (_, body) = send(
            &app,
            post_json("/query", json!({ "kind": "load", "tag": "monday" })),
        )
        .await;
        assert_eq!(body["results"][0]["match_score"], 10.0);
        assert_eq!(body["results"][0]["state"], "SCORED");
        assert_eq!(body["results"][1]["match_score"], 1.5);
    }

    #[tokio::test]
    async fn score_batch_requires_tag_and_known_strategy() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;

        let (status, _) = send(
            &app,
            post_json("/records/score-batch", json!({ "kind": "load", "tag": " " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            post_json(
                "/records/score-batch",
                json!({ "kind": "load", "tag": "t", "strategy": "vibes" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mock_strategy_scores_offline() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;
        send(
            &app,
            post_json("/shortlist", json!({ "kind": "load", "tag": "m" })),
        )
        .await;
        let (status, body) = send(
            &app,
            post_json(
                "/records/score-batch",
                json!({ "kind": "load", "tag": "m", "strategy": "mock" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scored"], 2);
        assert_eq!(body["skipped"], 0);
    }

    #[tokio::test]
    async fn describe_point_update() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;
        let (_, body) = send(&app, post_json("/query", json!({ "kind": "load" }))).await;
        let key = body["results"][0]["key"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            post_json(
                "/records/describe",
                json!({ "key": key, "description_text": "Broker notes." }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wrote"], true);

        let (status, _) = send(
            &app,
            post_json(
                "/records/describe",
                json!({ "key": "load:missing", "description_text": "x" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn score_point_update_validates() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;
        let (_, body) = send(&app, post_json("/query", json!({ "kind": "load" }))).await;
        let key = body["results"][0]["key"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            post_json("/records/score", json!({ "key": key, "match_score": 11.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            post_json("/records/score", json!({ "key": key, "match_score": 7.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "SCORED");

        let (status, _) = send(
            &app,
            post_json(
                "/records/score",
                json!({ "key": "load:missing", "match_score": 5.0 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn state_endpoint_enforces_forward_motion() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;
        let (_, body) = send(&app, post_json("/query", json!({ "kind": "load" }))).await;
        let key = body["results"][0]["key"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            post_json("/records/state", json!({ "key": key, "state": "ignored" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "IGNORED");

        let (status, _) = send(
            &app,
            post_json("/records/state", json!({ "key": key, "state": "NEW" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            post_json("/records/state", json!({ "key": key, "state": "MAYBE" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn describe_batch_with_no_new_jobs_is_a_noop() {
        let (_dir, app) = harness();
        ingest_sample(&app).await;
        let (status, body) = send(
            &app,
            post_json("/records/describe-batch", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["considered"], 0);
        assert_eq!(body["described"], 0);
    }

    #[tokio::test]
    async fn pipeline_ingests_and_tags() {
        let (_dir, app) = harness();
        let (status, body) = send(
            &app,
            post_json("/pipeline", json!({ "kind": "load", "tag": "fresh" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["ingest"]["inserted"], 2);
        assert_eq!(body["shortlist"]["marked"], 2);
        assert_eq!(body["shortlist"]["tag"], "fresh");
    }
}
