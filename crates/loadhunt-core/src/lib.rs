//! Domain model for the load/job hunt board: record kinds and fields,
//! lifecycle states, stable key derivation, field normalization, and the
//! formula scorer. Pure logic, no I/O.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "loadhunt-core";

/// Source name prefixing keys of jobs that carry an external id.
pub const JOB_SOURCE: &str = "adzuna";

/// Hex chars kept from the sha256 digest in derived keys. 96 bits is far
/// below the collision horizon for a single-user store.
pub const KEY_DIGEST_HEX_LEN: usize = 24;

/// Tag applied when a shortlist request leaves the tag blank.
pub const DEFAULT_SHORTLIST_TAG: &str = "DEFAULT";

// ---------------------------------------------------------------------------
// Kinds and states

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Job,
    Load,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Job => "job",
            RecordKind::Load => "load",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "job" | "jobs" => Some(RecordKind::Job),
            "load" | "loads" => Some(RecordKind::Load),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. Records only move forward (NEW -> READY -> SCORED) or
/// sideways into a terminal state set by a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordState {
    New,
    Ready,
    Scored,
    Applied,
    Ignored,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::New => "NEW",
            RecordState::Ready => "READY",
            RecordState::Scored => "SCORED",
            RecordState::Applied => "APPLIED",
            RecordState::Ignored => "IGNORED",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "NEW" => Some(RecordState::New),
            "READY" => Some(RecordState::Ready),
            "SCORED" => Some(RecordState::Scored),
            "APPLIED" => Some(RecordState::Applied),
            "IGNORED" => Some(RecordState::Ignored),
            _ => None,
        }
    }

    /// Terminal states are set by a human and block every automated change.
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Applied | RecordState::Ignored)
    }

    /// States that re-ingest must not regress.
    pub fn survives_reingest(self) -> bool {
        matches!(
            self,
            RecordState::Scored | RecordState::Applied | RecordState::Ignored
        )
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Domain fields

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFields {
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub created: Option<String>,
    pub redirect_url: Option<String>,
    pub description_text: Option<String>,
    pub description_source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadFields {
    pub origin_city: Option<String>,
    pub origin_state: Option<String>,
    pub dest_city: Option<String>,
    pub dest_state: Option<String>,
    pub origin_deadhead: Option<i64>,
    pub dest_deadhead: Option<i64>,
    pub distance: Option<i64>,
    pub rate: Option<String>,
    pub rate_per_mile: Option<String>,
    pub weight: Option<i64>,
    pub length: Option<i64>,
    pub equipment: Option<String>,
    pub mode: Option<String>,
    /// Pickup text as the feed sent it; part of the identity key.
    pub pickup: Option<String>,
    pub pickup_date: Option<NaiveDate>,
    pub company: Option<String>,
    pub updated: Option<String>,
    pub deadhead_to_pickup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DomainFields {
    Job(JobFields),
    Load(LoadFields),
}

impl DomainFields {
    pub fn kind(&self) -> RecordKind {
        match self {
            DomainFields::Job(_) => RecordKind::Job,
            DomainFields::Load(_) => RecordKind::Load,
        }
    }
}

/// An incoming record before reconciliation: normalized fields plus the raw
/// payload it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub fields: DomainFields,
    pub raw: serde_json::Value,
}

impl RecordDraft {
    pub fn new(fields: DomainFields, raw: serde_json::Value) -> Self {
        Self { fields, raw }
    }

    pub fn kind(&self) -> RecordKind {
        self.fields.kind()
    }

    pub fn key(&self) -> String {
        derive_key(&self.fields)
    }
}

/// A stored record with its lifecycle columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub fields: DomainFields,
    pub state: RecordState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub shortlist_tag: Option<String>,
    pub shortlisted_at: Option<DateTime<Utc>>,
    pub match_score: Option<f64>,
    pub raw: serde_json::Value,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        self.fields.kind()
    }
}

/// Optional predicates shared by the shortlist selector and the query
/// service. Absent fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFilter {
    /// Pickup-date equality, accepted in any format `normalize_pickup` takes.
    #[serde(alias = "date")]
    pub pickup_date: Option<String>,
    pub origin_city: Option<String>,
    pub origin_state: Option<String>,
    pub dest_city: Option<String>,
    pub dest_state: Option<String>,
    pub origin_deadhead_max: Option<i64>,
    pub dest_deadhead_max: Option<i64>,
    /// Case-insensitive substring match on job location.
    pub location: Option<String>,
    /// Each keyword must appear as a substring of the job title.
    pub keywords: Vec<String>,
    /// Only records first seen within this many days.
    pub days: Option<i64>,
}

// ---------------------------------------------------------------------------
// Key derivation

fn digest_prefix(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hex = hex::encode(hasher.finalize());
    hex[..KEY_DIGEST_HEX_LEN].to_string()
}

/// Derives the stable identity key for a record. Pure: the same fields
/// always produce the same key.
///
/// Jobs with an external id use `"<source>:<id>"`; jobs without one hash
/// the redirect URL. Loads hash the route/pickup/company/rate/distance
/// tuple, absent fields rendered as empty strings. The pickup goes in as
/// raw text, not the normalized date: relative values like `TODAY` must
/// keep the same key no matter which day the feed is fetched.
pub fn derive_key(fields: &DomainFields) -> String {
    match fields {
        DomainFields::Job(job) => {
            if let Some(id) = job
                .source_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
            {
                return format!("{JOB_SOURCE}:{id}");
            }
            let url = job.redirect_url.as_deref().unwrap_or("").trim();
            format!("job:{}", digest_prefix(url))
        }
        DomainFields::Load(load) => {
            let text = |value: &Option<String>| value.as_deref().unwrap_or("").trim().to_string();
            let parts = [
                text(&load.origin_city),
                text(&load.origin_state),
                text(&load.dest_city),
                text(&load.dest_state),
                text(&load.pickup),
                text(&load.company),
                text(&load.rate),
                load.distance.map(|d| d.to_string()).unwrap_or_default(),
            ];
            format!("load:{}", digest_prefix(&parts.join("|")))
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization

/// Normalizes a raw pickup value to a date. `TODAY` (any case), empty,
/// absent, and unparseable values all fall back to `today`; `%m/%d` assumes
/// the current year.
pub fn normalize_pickup_on(value: Option<&str>, today: NaiveDate) -> NaiveDate {
    let Some(text) = value.map(str::trim).filter(|t| !t.is_empty()) else {
        return today;
    };
    if text.eq_ignore_ascii_case("today") {
        return today;
    }
    let parts: Vec<&str> = text.split('/').collect();
    if parts.len() == 2 {
        if let (Ok(month), Ok(day)) = (parts[0].parse::<u32>(), parts[1].parse::<u32>()) {
            if let Some(date) = NaiveDate::from_ymd_opt(today.year(), month, day) {
                return date;
            }
        }
    }
    for format in ["%m/%d/%y", "%m/%d/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date;
        }
    }
    today
}

/// `normalize_pickup_on` against the current UTC date.
pub fn normalize_pickup(value: Option<&str>) -> NaiveDate {
    normalize_pickup_on(value, Utc::now().date_naive())
}

/// Date filter: absent or blank means "no constraint", anything else is
/// normalized like a pickup value.
pub fn normalize_date_filter_on(value: Option<&str>, today: NaiveDate) -> Option<NaiveDate> {
    let text = value.map(str::trim).filter(|t| !t.is_empty())?;
    Some(normalize_pickup_on(Some(text), today))
}

pub fn normalize_date_filter(value: Option<&str>) -> Option<NaiveDate> {
    normalize_date_filter_on(value, Utc::now().date_naive())
}

/// Integer parse tolerating thousands separators (`"1,234"` -> 1234).
pub fn parse_int_loose(value: &str) -> Option<i64> {
    let cleaned = value.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Rate parse: strips `$` and thousands separators.
pub fn parse_rate(value: &str) -> Option<f64> {
    let cleaned = value.trim().replace(['$', ','], "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Deadhead-to-pickup parse: plain float, tolerant of padding.
pub fn parse_d2p(value: &str) -> Option<f64> {
    let cleaned = value.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

// ---------------------------------------------------------------------------
// Scoring

/// Formula-scorer weights and bounds. The defaults match the tuning the
/// board has always shipped with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreConfig {
    pub rate_floor: f64,
    pub rate_ceiling: f64,
    pub d2p_floor: f64,
    pub d2p_ceiling: f64,
    pub rate_weight: f64,
    pub d2p_weight: f64,
    /// Subtracted (on the 0-10 scale) when deadhead-to-pickup is unknown.
    pub missing_d2p_penalty: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            rate_floor: 0.0,
            rate_ceiling: 3000.0,
            d2p_floor: 0.0,
            d2p_ceiling: 40.0,
            rate_weight: 0.7,
            d2p_weight: 0.3,
            missing_d2p_penalty: 2.0,
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Rounds to one decimal place, the precision every score in the system
/// carries.
pub fn round_score(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Blends normalized rate (higher is better) and deadhead-to-pickup
/// (lower is better) into a 0-10 score. Missing rate contributes zero;
/// missing D2P contributes zero and additionally costs the configured
/// penalty.
pub fn formula_score(rate: Option<f64>, d2p: Option<f64>, config: &ScoreConfig) -> f64 {
    let rate_norm = rate
        .map(|r| clamp_unit((r - config.rate_floor) / (config.rate_ceiling - config.rate_floor)))
        .unwrap_or(0.0);
    let (d2p_norm, d2p_missing) = match d2p {
        Some(v) => (
            clamp_unit(1.0 - (v - config.d2p_floor) / (config.d2p_ceiling - config.d2p_floor)),
            false,
        ),
        None => (0.0, true),
    };
    let mut score = (config.rate_weight * rate_norm + config.d2p_weight * d2p_norm) * 10.0;
    if d2p_missing {
        score -= config.missing_d2p_penalty;
    }
    round_score(score.clamp(0.0, 10.0))
}

#[derive(Debug, Error, PartialEq)]
#[error("no numeric score found in reply: {reply:?}")]
pub struct NoScoreInReply {
    pub reply: String,
}

static SCORE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d+)?").expect("score pattern compiles")
});

/// Extracts the first decimal number from a scoring reply and clamps it
/// into [0, 10]. Replies with no number at all are an error, never a
/// default score.
pub fn parse_score_reply(reply: &str) -> Result<f64, NoScoreInReply> {
    let matched = SCORE_PATTERN.find(reply).ok_or_else(|| NoScoreInReply {
        reply: reply.trim().to_string(),
    })?;
    let value: f64 = matched
        .as_str()
        .parse()
        .map_err(|_| NoScoreInReply {
            reply: reply.trim().to_string(),
        })?;
    Ok(round_score(value.clamp(0.0, 10.0)))
}

/// Deterministic stand-in score for offline runs: the first 8 hex chars of
/// the key's sha256, taken modulo 101, spread over 0.0-10.0.
pub fn mock_score_for_key(key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hex = hex::encode(hasher.finalize());
    let nibble = u32::from_str_radix(&hex[..8], 16).unwrap_or(0);
    round_score(f64::from(nibble % 101) / 10.0)
}

// ---------------------------------------------------------------------------
