//! SQLite-backed record store: schema migrations, the upsert reconciler,
//! shortlist selection, the query service, and point updates.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use loadhunt_core::{
    formula_score, normalize_date_filter_on, parse_d2p, parse_rate, round_score, DomainFields,
    JobFields, LoadFields, Record, RecordDraft, RecordFilter, RecordKind, RecordState,
    ScoreConfig, DEFAULT_SHORTLIST_TAG,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "loadhunt-store";

const SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("a shortlist tag is required")]
    MissingTag,
    #[error("cannot move state backward from {from} to {to}")]
    InvalidTransition { from: RecordState, to: RecordState },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Shortlist request: which rows to stamp with a tag.
#[derive(Debug, Clone)]
pub struct ShortlistRequest {
    pub tag: String,
    pub filter: RecordFilter,
    pub replace: bool,
    pub limit: i64,
    pub only_unscored: bool,
}

impl Default for ShortlistRequest {
    fn default() -> Self {
        Self {
            tag: String::new(),
            filter: RecordFilter::default(),
            replace: false,
            limit: 25,
            only_unscored: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortlistOutcome {
    pub tag: String,
    pub marked: u64,
    pub total_tagged: i64,
}

/// Read-only query over stored records.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub tag: Option<String>,
    pub filter: RecordFilter,
    pub states: Vec<RecordState>,
    pub only_unscored: bool,
    pub require_description: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            tag: None,
            filter: RecordFilter::default(),
            states: Vec::new(),
            only_unscored: false,
            require_description: false,
            limit: 200,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescribeOutcome {
    pub key: String,
    pub state: RecordState,
    /// False when an earlier description already owned the slot.
    pub wrote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormulaRunOutcome {
    pub considered: usize,
    pub scored: u64,
}

pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Opens (creating if needed) the database at `path` and brings the
    /// schema up to the current version.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        debug!(path = %path.display(), "opened record store");
        Ok(Self { pool })
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    // -- reconciliation ----------------------------------------------------

    pub async fn upsert(&self, draft: &RecordDraft) -> Result<UpsertOutcome, StoreError> {
        self.upsert_at(draft, Utc::now()).await
    }

    /// Reconciles one incoming draft against the store. Identity comes from
    /// the derived key; human progress (state, description, score, tag) is
    /// never regressed by an ingest.
    pub async fn upsert_at(
        &self,
        draft: &RecordDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = draft.key();
        let kind = draft.kind();
        let flat = FlatFields::from_domain(&draft.fields);
        let raw_json = serde_json::to_string(&draft.raw)?;
        let now_text = format_ts(now);

        let existing = sqlx::query(
            "SELECT state, description_text, description_source FROM records WHERE record_key = ?1",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = existing else {
            let state = initial_state(kind, flat.description_text.as_deref());
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO records (record_key, kind, state, first_seen_at, last_seen_at, raw_json, ",
            );
            qb.push(FlatFields::COLUMNS);
            qb.push(") VALUES (");
            {
                let mut values = qb.separated(", ");
                values.push_bind(&key);
                values.push_bind(kind.as_str());
                values.push_bind(state.as_str());
                values.push_bind(&now_text);
                values.push_bind(&now_text);
                values.push_bind(&raw_json);
                flat.push_values(&mut values);
            }
            qb.push(")");
            qb.build().execute(&self.pool).await?;
            return Ok(UpsertOutcome::Inserted);
        };

        let state_text: String = row.try_get("state")?;
        let current = RecordState::parse(&state_text)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown state {state_text:?}")))?;
        let stored_desc: Option<String> = row.try_get("description_text")?;
        let stored_desc = stored_desc.filter(|d| !d.trim().is_empty());
        let stored_source: Option<String> = row.try_get("description_source")?;

        let incoming_desc = flat
            .description_text
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        // First write wins: an existing description and its source tag are
        // kept even when the feed sends fresher text.
        let (final_desc, final_source) = match (&stored_desc, &incoming_desc) {
            (Some(_), _) => (stored_desc.clone(), stored_source),
            (None, Some(d)) => (Some(d.clone()), flat.description_source.clone()),
            (None, None) => (None, stored_source),
        };
        let next = next_state_on_ingest(kind, current, stored_desc.is_some(), incoming_desc.is_some());

        let mut refreshed = flat;
        refreshed.description_text = final_desc;
        refreshed.description_source = final_source;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE records SET state = ");
        qb.push_bind(next.as_str());
        qb.push(", last_seen_at = ");
        qb.push_bind(&now_text);
        qb.push(", raw_json = ");
        qb.push_bind(&raw_json);
        refreshed.push_assignments(&mut qb);
        qb.push(" WHERE record_key = ");
        qb.push_bind(&key);
        qb.build().execute(&self.pool).await?;
        Ok(UpsertOutcome::Updated)
    }

    /// Deletes every record of a kind. Used by overwrite-mode ingests.
    pub async fn clear_kind(&self, kind: RecordKind) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE kind = ?1")
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- shortlist and query -----------------------------------------------

    pub async fn shortlist(
        &self,
        kind: RecordKind,
        request: &ShortlistRequest,
    ) -> Result<ShortlistOutcome, StoreError> {
        let tag = {
            let trimmed = request.tag.trim();
            if trimmed.is_empty() {
                DEFAULT_SHORTLIST_TAG.to_string()
            } else {
                trimmed.to_string()
            }
        };
        let now = Utc::now();
        let now_text = format_ts(now);

        if request.replace {
            sqlx::query(
                "UPDATE records SET shortlist_tag = NULL, shortlisted_at = NULL \
                 WHERE kind = ?1 AND shortlist_tag = ?2",
            )
            .bind(kind.as_str())
            .bind(&tag)
            .execute(&self.pool)
            .await?;
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT record_key FROM records WHERE kind = ");
        qb.push_bind(kind.as_str());
        qb.push(" AND state NOT IN ('APPLIED', 'IGNORED')");
        push_filter_clauses(&mut qb, &request.filter, now);
        if request.only_unscored {
            qb.push(" AND match_score IS NULL");
        }
        qb.push(
            " ORDER BY CASE state WHEN 'READY' THEN 0 WHEN 'NEW' THEN 1 ELSE 2 END, \
             first_seen_at DESC LIMIT ",
        );
        qb.push_bind(request.limit.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut marked = 0u64;
        for row in &rows {
            let key: String = row.try_get("record_key")?;
            let result = sqlx::query(
                "UPDATE records SET shortlist_tag = ?1, shortlisted_at = ?2 WHERE record_key = ?3",
            )
            .bind(&tag)
            .bind(&now_text)
            .bind(&key)
            .execute(&self.pool)
            .await?;
            marked += result.rows_affected();
        }

        let total_tagged: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records WHERE kind = ?1 AND shortlist_tag = ?2",
        )
        .bind(kind.as_str())
        .bind(&tag)
        .fetch_one(&self.pool)
        .await?;

        debug!(kind = %kind, tag = %tag, marked, total_tagged, "shortlist updated");
        Ok(ShortlistOutcome {
            tag,
            marked,
            total_tagged,
        })
    }

    /// Filtered, paginated read. Scored rows come first (best score on
    /// top), unscored rows trail in working-state/recency order.
    pub async fn query(
        &self,
        kind: RecordKind,
        request: &QueryRequest,
    ) -> Result<Vec<Record>, StoreError> {
        let now = Utc::now();
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM records WHERE kind = ");
        qb.push_bind(kind.as_str());
        if let Some(tag) = request
            .tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            qb.push(" AND shortlist_tag = ");
            qb.push_bind(tag.to_string());
        }
        if !request.states.is_empty() {
            qb.push(" AND state IN (");
            {
                let mut states = qb.separated(", ");
                for state in &request.states {
                    states.push_bind(state.as_str());
                }
            }
            qb.push(")");
        }
        push_filter_clauses(&mut qb, &request.filter, now);
        if request.only_unscored {
            qb.push(" AND match_score IS NULL");
        }
        if request.require_description {
            qb.push(" AND description_text IS NOT NULL AND TRIM(description_text) <> ''");
        }
        qb.push(
            " ORDER BY CASE WHEN match_score IS NULL THEN 1 ELSE 0 END, match_score DESC, \
             CASE state WHEN 'READY' THEN 0 WHEN 'NEW' THEN 1 ELSE 2 END, first_seen_at DESC \
             LIMIT ",
        );
        qb.push_bind(request.limit.max(0));
        qb.push(" OFFSET ");
        qb.push_bind(request.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE record_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn count(&self, kind: RecordKind) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE kind = ?1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // -- point updates -----------------------------------------------------

    /// Writes a description for one record. First write wins; a later call
    /// against a described record is a no-op that reports `wrote: false`.
    pub async fn update_description(
        &self,
        key: &str,
        text: &str,
        source: &str,
    ) -> Result<DescribeOutcome, StoreError> {
        let row = sqlx::query("SELECT state, description_text FROM records WHERE record_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let state_text: String = row.try_get("state")?;
        let current = RecordState::parse(&state_text)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown state {state_text:?}")))?;
        let stored: Option<String> = row.try_get("description_text")?;
        let already_described = stored.is_some_and(|d| !d.trim().is_empty());
        let incoming = text.trim();

        if already_described || incoming.is_empty() {
            return Ok(DescribeOutcome {
                key: key.to_string(),
                state: current,
                wrote: false,
            });
        }

        let next = if current == RecordState::New {
            RecordState::Ready
        } else {
            current
        };
        sqlx::query(
            "UPDATE records SET description_text = ?1, description_source = ?2, state = ?3 \
             WHERE record_key = ?4",
        )
        .bind(incoming)
        .bind(source)
        .bind(next.as_str())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(DescribeOutcome {
            key: key.to_string(),
            state: next,
            wrote: true,
        })
    }

    /// Writes a score for one record, clamped to [0, 10] and rounded to one
    /// decimal. Non-terminal rows advance to SCORED; terminal rows keep
    /// their state but still take the score.
    pub async fn update_score(&self, key: &str, score: f64) -> Result<RecordState, StoreError> {
        let row = sqlx::query("SELECT state FROM records WHERE record_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let state_text: String = row.try_get("state")?;
        let current = RecordState::parse(&state_text)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown state {state_text:?}")))?;
        let next = if current.is_terminal() {
            current
        } else {
            RecordState::Scored
        };
        sqlx::query("UPDATE records SET match_score = ?1, state = ?2 WHERE record_key = ?3")
            .bind(round_score(score.clamp(0.0, 10.0)))
            .bind(next.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(next)
    }

    /// Human-driven state change. Forward moves and terminal marks are
    /// allowed; backward moves are rejected.
    pub async fn update_state(
        &self,
        key: &str,
        target: RecordState,
    ) -> Result<RecordState, StoreError> {
        let row = sqlx::query("SELECT state FROM records WHERE record_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let state_text: String = row.try_get("state")?;
        let current = RecordState::parse(&state_text)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown state {state_text:?}")))?;
        if state_rank(target) < state_rank(current) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: target,
            });
        }
        sqlx::query("UPDATE records SET state = ?1 WHERE record_key = ?2")
            .bind(target.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(target)
    }

    /// Formula-scores every row carrying the tag. Pure arithmetic, so the
    /// whole batch runs without external calls.
    pub async fn score_shortlisted(
        &self,
        kind: RecordKind,
        tag: &str,
        only_unscored: bool,
        limit: i64,
        config: &ScoreConfig,
    ) -> Result<FormulaRunOutcome, StoreError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(StoreError::MissingTag);
        }
        let rows = self
            .query(
                kind,
                &QueryRequest {
                    tag: Some(tag.to_string()),
                    only_unscored,
                    limit,
                    ..QueryRequest::default()
                },
            )
            .await?;
        let mut scored = 0u64;
        for record in &rows {
            let (rate, d2p) = match &record.fields {
                DomainFields::Load(load) => (
                    load.rate.as_deref().and_then(parse_rate),
                    load.deadhead_to_pickup.as_deref().and_then(parse_d2p),
                ),
                DomainFields::Job(_) => (None, None),
            };
            self.update_score(&record.key, formula_score(rate, d2p, config))
                .await?;
            scored += 1;
        }
        Ok(FormulaRunOutcome {
            considered: rows.len(),
            scored,
        })
    }

    // -- audit -------------------------------------------------------------

    /// Appends one row to the runs audit table, returning its id.
    pub async fn record_run(
        &self,
        kind: RecordKind,
        params: &serde_json::Value,
        pages_fetched: i64,
        result_count: i64,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO runs (ran_at, kind, params_json, pages_fetched, result_count) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(format_ts(Utc::now()))
        .bind(kind.as_str())
        .bind(serde_json::to_string(params)?)
        .bind(pages_fetched)
        .bind(result_count)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

fn state_rank(state: RecordState) -> u8 {
    match state {
        RecordState::New => 0,
        RecordState::Ready => 1,
        RecordState::Scored => 2,
        RecordState::Applied | RecordState::Ignored => 3,
    }
}

fn initial_state(kind: RecordKind, description: Option<&str>) -> RecordState {
    match kind {
        // Loads arrive data-complete and are immediately workable.
        RecordKind::Load => RecordState::Ready,
        RecordKind::Job => {
            if description.is_some_and(|d| !d.trim().is_empty()) {
                RecordState::Ready
            } else {
                RecordState::New
            }
        }
    }
}

fn next_state_on_ingest(
    kind: RecordKind,
    current: RecordState,
    had_description: bool,
    has_incoming_description: bool,
) -> RecordState {
    if current.survives_reingest() {
        return current;
    }
    match kind {
        RecordKind::Load => RecordState::Ready,
        RecordKind::Job => {
            if !had_description && has_incoming_description {
                RecordState::Ready
            } else {
                current
            }
        }
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp {text:?}: {err}")))
}

/// Appends the shared filter predicates to a records query.
fn push_filter_clauses(
    qb: &mut QueryBuilder<'_, Sqlite>,
    filter: &RecordFilter,
    now: DateTime<Utc>,
) {
    if let Some(date) = normalize_date_filter_on(filter.pickup_date.as_deref(), now.date_naive()) {
        qb.push(" AND pickup_date = ");
        qb.push_bind(date.to_string());
    }
    let places = [
        ("origin_city", &filter.origin_city),
        ("origin_state", &filter.origin_state),
        ("dest_city", &filter.dest_city),
        ("dest_state", &filter.dest_state),
    ];
    for (column, value) in places {
        if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            qb.push(format!(" AND UPPER({column}) = UPPER("));
            qb.push_bind(v.to_string());
            qb.push(")");
        }
    }
    if let Some(max) = filter.origin_deadhead_max {
        qb.push(" AND origin_deadhead <= ");
        qb.push_bind(max);
    }
    if let Some(max) = filter.dest_deadhead_max {
        qb.push(" AND dest_deadhead <= ");
        qb.push_bind(max);
    }
    if let Some(location) = filter
        .location
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        qb.push(" AND location LIKE ");
        qb.push_bind(format!("%{location}%"));
    }
    for keyword in &filter.keywords {
        let keyword = keyword.trim();
        if !keyword.is_empty() {
            qb.push(" AND title LIKE ");
            qb.push_bind(format!("%{keyword}%"));
        }
    }
    if let Some(days) = filter.days {
        let cutoff = now - chrono::Duration::days(days.max(0));
        qb.push(" AND first_seen_at >= ");
        qb.push_bind(format_ts(cutoff));
    }
}

/// Superset of both kinds' domain columns, flattened for binding.
#[derive(Debug, Default, Clone)]
struct FlatFields {
    source_id: Option<String>,
    title: Option<String>,
    company: Option<String>,
    location: Option<String>,
    created: Option<String>,
    redirect_url: Option<String>,
    description_text: Option<String>,
    description_source: Option<String>,
    origin_city: Option<String>,
    origin_state: Option<String>,
    dest_city: Option<String>,
    dest_state: Option<String>,
    origin_deadhead: Option<i64>,
    dest_deadhead: Option<i64>,
    distance: Option<i64>,
    rate: Option<String>,
    rate_per_mile: Option<String>,
    weight: Option<i64>,
    length: Option<i64>,
    equipment: Option<String>,
    mode: Option<String>,
    pickup: Option<String>,
    pickup_date: Option<String>,
    updated: Option<String>,
    deadhead_to_pickup: Option<String>,
}

impl FlatFields {
    const COLUMNS: &'static str = "source_id, title, company, location, created, redirect_url, \
        description_text, description_source, origin_city, origin_state, dest_city, dest_state, \
        origin_deadhead, dest_deadhead, distance, rate, rate_per_mile, weight, length, \
        equipment, mode, pickup, pickup_date, updated, deadhead_to_pickup";

    fn from_domain(fields: &DomainFields) -> Self {
        match fields {
            DomainFields::Job(job) => Self {
                source_id: job.source_id.clone(),
                title: job.title.clone(),
                company: job.company.clone(),
                location: job.location.clone(),
                created: job.created.clone(),
                redirect_url: job.redirect_url.clone(),
                description_text: job.description_text.clone(),
                description_source: job.description_source.clone(),
                ..Self::default()
            },
            DomainFields::Load(load) => Self {
                company: load.company.clone(),
                origin_city: load.origin_city.clone(),
                origin_state: load.origin_state.clone(),
                dest_city: load.dest_city.clone(),
                dest_state: load.dest_state.clone(),
                origin_deadhead: load.origin_deadhead,
                dest_deadhead: load.dest_deadhead,
                distance: load.distance,
                rate: load.rate.clone(),
                rate_per_mile: load.rate_per_mile.clone(),
                weight: load.weight,
                length: load.length,
                equipment: load.equipment.clone(),
                mode: load.mode.clone(),
                pickup: load.pickup.clone(),
                pickup_date: load.pickup_date.map(|d| d.to_string()),
                updated: load.updated.clone(),
                deadhead_to_pickup: load.deadhead_to_pickup.clone(),
                ..Self::default()
            },
        }
    }

    fn push_values(&self, values: &mut sqlx::query_builder::Separated<'_, '_, Sqlite, &'static str>) {
        values.push_bind(self.source_id.clone());
        values.push_bind(self.title.clone());
        values.push_bind(self.company.clone());
        values.push_bind(self.location.clone());
        values.push_bind(self.created.clone());
        values.push_bind(self.redirect_url.clone());
        values.push_bind(self.description_text.clone());
        values.push_bind(self.description_source.clone());
        values.push_bind(self.origin_city.clone());
        values.push_bind(self.origin_state.clone());
        values.push_bind(self.dest_city.clone());
        values.push_bind(self.dest_state.clone());
        values.push_bind(self.origin_deadhead);
        values.push_bind(self.dest_deadhead);
        values.push_bind(self.distance);
        values.push_bind(self.rate.clone());
        values.push_bind(self.rate_per_mile.clone());
        values.push_bind(self.weight);
        values.push_bind(self.length);
        values.push_bind(self.equipment.clone());
        values.push_bind(self.mode.clone());
        values.push_bind(self.pickup.clone());
        values.push_bind(self.pickup_date.clone());
        values.push_bind(self.updated.clone());
        values.push_bind(self.deadhead_to_pickup.clone());
    }

    fn push_assignments(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        macro_rules! assign {
            ($column:literal, $value:expr) => {
                qb.push(concat!(", ", $column, " = "));
                qb.push_bind($value);
            };
        }
        assign!("source_id", self.source_id.clone());
        assign!("title", self.title.clone());
        assign!("company", self.company.clone());
        assign!("location", self.location.clone());
        assign!("created", self.created.clone());
        assign!("redirect_url", self.redirect_url.clone());
        assign!("description_text", self.description_text.clone());
        assign!("description_source", self.description_source.clone());
        assign!("origin_city", self.origin_city.clone());
        assign!("origin_state", self.origin_state.clone());
        assign!("dest_city", self.dest_city.clone());
        assign!("dest_state", self.dest_state.clone());
        assign!("origin_deadhead", self.origin_deadhead);
        assign!("dest_deadhead", self.dest_deadhead);
        assign!("distance", self.distance);
        assign!("rate", self.rate.clone());
        assign!("rate_per_mile", self.rate_per_mile.clone());
        assign!("weight", self.weight);
        assign!("length", self.length.clone());
        assign!("equipment", self.equipment.clone());
        assign!("mode", self.mode.clone());
        assign!("pickup", self.pickup.clone());
        assign!("pickup_date", self.pickup_date.clone());
        assign!("updated", self.updated.clone());
        assign!("deadhead_to_pickup", self.deadhead_to_pickup.clone());
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let kind_text: String = row.try_get("kind")?;
    let kind = RecordKind::parse(&kind_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown kind {kind_text:?}")))?;
    let state_text: String = row.try_get("state")?;
    let state = RecordState::parse(&state_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown state {state_text:?}")))?;

    let fields = match kind {
        RecordKind::Job => DomainFields::Job(JobFields {
            source_id: row.try_get("source_id")?,
            title: row.try_get("title")?,
            company: row.try_get("company")?,
            location: row.try_get("location")?,
            created: row.try_get("created")?,
            redirect_url: row.try_get("redirect_url")?,
            description_text: row.try_get("description_text")?,
            description_source: row.try_get("description_source")?,
        }),
        RecordKind::Load => DomainFields::Load(LoadFields {
            origin_city: row.try_get("origin_city")?,
            origin_state: row.try_get("origin_state")?,
            dest_city: row.try_get("dest_city")?,
            dest_state: row.try_get("dest_state")?,
            origin_deadhead: row.try_get("origin_deadhead")?,
            dest_deadhead: row.try_get("dest_deadhead")?,
            distance: row.try_get("distance")?,
            rate: row.try_get("rate")?,
            rate_per_mile: row.try_get("rate_per_mile")?,
            weight: row.try_get("weight")?,
            length: row.try_get("length")?,
            equipment: row.try_get("equipment")?,
            mode: row.try_get("mode")?,
            pickup: row.try_get("pickup")?,
            pickup_date: row
                .try_get::<Option<String>, _>("pickup_date")?
                .and_then(|t| NaiveDate::parse_from_str(&t, "%Y-%m-%d").ok()),
            company: row.try_get("company")?,
            updated: row.try_get("updated")?,
            deadhead_to_pickup: row.try_get("deadhead_to_pickup")?,
        }),
    };

    let first_seen: String = row.try_get("first_seen_at")?;
    let last_seen: String = row.try_get("last_seen_at")?;
    let shortlisted_at: Option<String> = row.try_get("shortlisted_at")?;
    let raw_text: Option<String> = row.try_get("raw_json")?;
    let raw = match raw_text {
        Some(text) if !text.is_empty() => serde_json::from_str(&text)?,
        _ => serde_json::Value::Null,
    };

    Ok(Record {
        key: row.try_get("record_key")?,
        fields,
        state,
        first_seen_at: parse_ts(&first_seen)?,
        last_seen_at: parse_ts(&last_seen)?,
        shortlist_tag: row.try_get("shortlist_tag")?,
        shortlisted_at: shortlisted_at.as_deref().map(parse_ts).transpose()?,
        match_score: row.try_get("match_score")?,
        raw,
    })
}

// -- migrations ------------------------------------------------------------

async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (\
            version INTEGER PRIMARY KEY, \
            applied_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;
    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);
    if current < 1 {
        migrate_v1(pool).await?;
        mark_version(pool, 1).await?;
    }
    if current < 2 {
        migrate_v2(pool).await?;
        mark_version(pool, 2).await?;
    }
    if current < SCHEMA_VERSION {
        debug!(from = current, to = SCHEMA_VERSION, "schema migrated");
    }
    Ok(())
}

async fn mark_version(pool: &SqlitePool, version: i64) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
        .bind(version)
        .bind(format_ts(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool, StoreError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// v1: the records and runs tables as originally shipped.
async fn migrate_v1(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS records (\
            record_key TEXT PRIMARY KEY, \
            kind TEXT NOT NULL, \
            state TEXT NOT NULL, \
            first_seen_at TEXT NOT NULL, \
            last_seen_at TEXT NOT NULL, \
            raw_json TEXT, \
            source_id TEXT, \
            title TEXT, \
            company TEXT, \
            location TEXT, \
            created TEXT, \
            redirect_url TEXT, \
            description_text TEXT, \
            description_source TEXT, \
            origin_city TEXT, \
            origin_state TEXT, \
            dest_city TEXT, \
            dest_state TEXT, \
            origin_deadhead INTEGER, \
            dest_deadhead INTEGER, \
            distance INTEGER, \
            rate TEXT, \
            rate_per_mile TEXT, \
            weight INTEGER, \
            length INTEGER, \
            equipment TEXT, \
            mode TEXT, \
            pickup TEXT, \
            pickup_date TEXT, \
            updated TEXT, \
            deadhead_to_pickup TEXT)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS runs (\
            run_id INTEGER PRIMARY KEY AUTOINCREMENT, \
            ran_at TEXT NOT NULL, \
            kind TEXT NOT NULL, \
            params_json TEXT NOT NULL, \
            pages_fetched INTEGER NOT NULL, \
            result_count INTEGER NOT NULL)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind_state ON records (kind, state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_pickup ON records (pickup_date)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_first_seen ON records (first_seen_at)")
        .execute(pool)
        .await?;
    Ok(())
}

/// v2: shortlist and scoring columns, added after the board grew curation.
async fn migrate_v2(pool: &SqlitePool) -> Result<(), StoreError> {
    let additions = [
        ("shortlist_tag", "TEXT"),
        ("shortlisted_at", "TEXT"),
        ("match_score", "REAL"),
    ];
    for (column, decl) in additions {
        if !column_exists(pool, "records", column).await? {
            sqlx::query(&format!("ALTER TABLE records ADD COLUMN {column} {decl}"))
                .execute(pool)
                .await?;
        }
    }
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_tag ON records (shortlist_tag)")
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
