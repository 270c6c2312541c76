//! Core domain types for adaptcrawl jobs, patterns, and records.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AdaptError, ErrorKind};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of one crawl job (UUID v7, time-sortable).
    JobId
);
uuid_id!(
    /// Identifier of a learned extraction pattern.
    PatternId
);
uuid_id!(
    /// Identifier of a sub-task dispatched to an agent worker.
    TaskId
);

// ---------------------------------------------------------------------------
// Field schema
// ---------------------------------------------------------------------------

/// Expected shape of a field value, used for validation when scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Url,
    Date,
    Number,
}

/// Date layouts accepted by [`FieldKind::Date`] in addition to RFC 3339/2822.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

impl FieldKind {
    /// Shape check for a single extracted value.
    pub fn accepts(&self, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        match self {
            Self::Text => true,
            Self::Url => {
                value.starts_with('/')
                    || url::Url::parse(value)
                        .map(|u| matches!(u.scheme(), "http" | "https"))
                        .unwrap_or(false)
            }
            Self::Number => {
                let cleaned: String = value
                    .chars()
                    .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | '¥' | '%') && !c.is_whitespace())
                    .collect();
                cleaned.parse::<f64>().is_ok()
            }
            Self::Date => {
                DateTime::parse_from_rfc3339(value).is_ok()
                    || DateTime::parse_from_rfc2822(value).is_ok()
                    || DATE_FORMATS
                        .iter()
                        .any(|f| NaiveDate::parse_from_str(value, f).is_ok())
                    || DATETIME_FORMATS
                        .iter()
                        .any(|f| NaiveDateTime::parse_from_str(value, f).is_ok())
            }
        }
    }
}

/// One field a job wants extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Ordered set of fields to extract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema {
    pub fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Field values and extraction results
// ---------------------------------------------------------------------------

/// A single extracted value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Iterate over every raw value, flattening lists.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::Single(s) => std::slice::from_ref(s),
            Self::List(v) => v,
        };
        slice.iter().map(String::as_str)
    }

    /// True when no value carries non-whitespace content.
    pub fn is_blank(&self) -> bool {
        self.iter().all(|v| v.trim().is_empty())
    }

    pub fn first(&self) -> Option<&str> {
        self.iter().next()
    }

    fn normalized(&self) -> Self {
        match self {
            Self::Single(s) => Self::Single(s.trim().to_lowercase()),
            Self::List(v) => Self::List(v.iter().map(|s| s.trim().to_lowercase()).collect()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Single(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Single(s)
    }
}

/// Field values of one extracted item, keyed by field name.
pub type Item = BTreeMap<String, FieldValue>;

/// The extraction strategies, declared in ascending cost order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Deterministic,
    RenderedDom,
    Semantic,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::RenderedDom => "rendered_dom",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = AdaptError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deterministic" => Ok(Self::Deterministic),
            "rendered_dom" => Ok(Self::RenderedDom),
            "semantic" => Ok(Self::Semantic),
            other => Err(AdaptError::validation(format!("unknown strategy '{other}'"))),
        }
    }
}

/// A candidate extraction for one page.
///
/// `fields` is the page-level view: a single item's values, or for list pages
/// every field collapsed into a list across items. `items` keeps the per-item
/// breakdown that becomes individual records.
///
/// `confidence` and `missing_required` are only meaningful after the result
/// has been assessed by the confidence scorer; strategies produce results via
/// [`ExtractionResult::from_items`], which leaves both unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: Item,
    pub items: Vec<Item>,
    pub missing_required: Vec<String>,
    pub confidence: f64,
    pub strategy_used: StrategyKind,
    pub raw_item_count: usize,
}

impl ExtractionResult {
    /// Build an unscored result from per-item values.
    pub fn from_items(strategy: StrategyKind, items: Vec<Item>) -> Self {
        let items: Vec<Item> = items
            .into_iter()
            .map(|item| item.into_iter().filter(|(_, v)| !v.is_blank()).collect::<Item>())
            .filter(|item| !item.is_empty())
            .collect();

        let fields = match items.as_slice() {
            [] => Item::new(),
            [single] => single.clone(),
            many => {
                let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for item in many {
                    for (name, value) in item {
                        merged
                            .entry(name.clone())
                            .or_default()
                            .extend(value.iter().map(str::to_string));
                    }
                }
                merged
                    .into_iter()
                    .map(|(k, v)| (k, FieldValue::List(v)))
                    .collect()
            }
        };

        Self {
            raw_item_count: items.len(),
            fields,
            items,
            missing_required: Vec::new(),
            confidence: 0.0,
            strategy_used: strategy,
        }
    }

    /// An empty result, used when a strategy fails outright.
    pub fn empty(strategy: StrategyKind) -> Self {
        Self::from_items(strategy, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(FieldValue::is_blank)
    }
}

// ---------------------------------------------------------------------------
// Selector specs and patterns
// ---------------------------------------------------------------------------

/// Locates one field inside an item (or the whole page when no item selector).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldLocator {
    pub field: String,
    /// CSS selector relative to the item element.
    pub selector: String,
    /// Attribute to read instead of the element text (e.g. `href`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
}

/// An ordered field→locator mapping, optionally scoped by a repeated item selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldLocator>,
}

impl SelectorSpec {
    pub fn locator(&self, field: &str) -> Option<&FieldLocator> {
        self.fields.iter().find(|l| l.field == field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A stored extraction recipe with usage statistics.
///
/// Confidence is always derived from the counters with Laplace smoothing and
/// has no setter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    pub id: PatternId,
    pub fingerprint: String,
    pub selector_spec: SelectorSpec,
    confidence: f64,
    success_count: u64,
    use_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<PatternId>,
}

impl Pattern {
    /// Create a pattern from its first observed use.
    pub fn first_use(fingerprint: impl Into<String>, selector_spec: SelectorSpec, success: bool) -> Self {
        let now = Utc::now();
        let success_count = u64::from(success);
        Self {
            id: PatternId::new(),
            fingerprint: fingerprint.into(),
            selector_spec,
            confidence: smoothed_confidence(success_count, 1),
            success_count,
            use_count: 1,
            created_at: now,
            updated_at: now,
            superseded_by: None,
        }
    }

    /// Rebuild a pattern from persisted counters. Confidence is recomputed.
    ///
    /// `success_count` is clamped to `use_count`.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: PatternId,
        fingerprint: String,
        selector_spec: SelectorSpec,
        success_count: u64,
        use_count: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        superseded_by: Option<PatternId>,
    ) -> Self {
        let success_count = success_count.min(use_count);
        Self {
            id,
            fingerprint,
            selector_spec,
            confidence: smoothed_confidence(success_count, use_count),
            success_count,
            use_count,
            created_at,
            updated_at,
            superseded_by,
        }
    }

    /// Tally one more use and recompute confidence.
    pub fn record_use(&mut self, success: bool) {
        self.use_count += 1;
        if success {
            self.success_count += 1;
        }
        self.confidence = smoothed_confidence(self.success_count, self.use_count);
        self.updated_at = Utc::now();
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// `(successes + 1) / (uses + 2)`: strictly inside (0, 1) for any counts.
pub fn smoothed_confidence(success_count: u64, use_count: u64) -> f64 {
    (success_count as f64 + 1.0) / (use_count as f64 + 2.0)
}

// ---------------------------------------------------------------------------
// Fetch types
// ---------------------------------------------------------------------------

/// Credentials forwarded verbatim to the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Per-request fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Ask for a browser-rendered DOM instead of the raw document.
    pub render: bool,
    pub credentials: Option<Credentials>,
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub rendered: bool,
    pub fetched_at: DateTime<Utc>,
}

impl RawPage {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            body: body.into(),
            rendered: false,
            fetched_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One persisted item, deduplicated by `content_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub content_hash: String,
    pub job_id: JobId,
    pub source_url: String,
    pub fields: Item,
    pub confidence: f64,
    pub strategy: StrategyKind,
    /// Set when no strategy cleared the acceptance threshold.
    pub low_confidence: bool,
    pub extracted_at: DateTime<Utc>,
}

impl Record {
    pub fn new(
        job_id: JobId,
        source_url: impl Into<String>,
        fields: Item,
        confidence: f64,
        strategy: StrategyKind,
        low_confidence: bool,
    ) -> Self {
        Self {
            content_hash: content_hash(&fields),
            job_id,
            source_url: source_url.into(),
            fields,
            confidence,
            strategy,
            low_confidence,
            extracted_at: Utc::now(),
        }
    }
}

/// SHA-256 over the trimmed, lowercased, key-sorted JSON form of an item.
pub fn content_hash(fields: &Item) -> String {
    let normalized: Item = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.normalized()))
        .collect();
    let json = serde_json::to_string(&normalized).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Workflow phases of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Init,
    Crawl,
    Parse,
    Store,
    Notify,
    Done,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Crawl => "crawl",
            Self::Parse => "parse",
            Self::Store => "store",
            Self::Notify => "notify",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error recorded against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub phase: JobPhase,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(phase: JobPhase, error: &AdaptError, url: Option<&str>) -> Self {
        Self {
            phase,
            kind: error.kind(),
            message: error.to_string(),
            url: url.map(str::to_string),
            at: Utc::now(),
        }
    }
}

/// One strategy attempt on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub url: String,
    pub strategy: StrategyKind,
    pub confidence: f64,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// A pending write-back to the pattern store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternOutcome {
    /// The reused pattern, or `None` for a newly learned spec.
    pub pattern_id: Option<PatternId>,
    pub selector_spec: SelectorSpec,
    pub success: bool,
}

/// Parameter suggestions produced by the optimizer worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    /// Per-job cap applied on top of the executor's global limit during Parse.
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// The full mutable state of one job, owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub name: String,
    pub fingerprint: String,
    pub phase: JobPhase,
    /// Raw pages fetched during Crawl, awaiting Parse.
    pub pending_items: Vec<RawPage>,
    /// Records produced by Parse, consumed by Store.
    pub accepted_items: Vec<Record>,
    /// Records Store found to be previously unseen.
    pub new_item_count: usize,
    pub errors: Vec<JobError>,
    pub error_budget: usize,
    pub attempt_log: Vec<StrategyAttempt>,
    /// The pattern reused for this job's fingerprint, if any.
    pub active_pattern: Option<PatternId>,
    pub pattern_outcomes: Vec<PatternOutcome>,
    pub suggested_spec: Option<SelectorSpec>,
    pub tuning: Option<Tuning>,
    pub failure_reason: Option<String>,
    pub notified: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new(
        job_id: JobId,
        name: impl Into<String>,
        fingerprint: impl Into<String>,
        error_budget: usize,
    ) -> Self {
        Self {
            job_id,
            name: name.into(),
            fingerprint: fingerprint.into(),
            phase: JobPhase::Init,
            pending_items: Vec::new(),
            accepted_items: Vec::new(),
            new_item_count: 0,
            errors: Vec::new(),
            error_budget,
            attempt_log: Vec::new(),
            active_pattern: None,
            pattern_outcomes: Vec::new(),
            suggested_spec: None,
            tuning: None,
            failure_reason: None,
            notified: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Errors still tolerated before the job is forced to `Failed`.
    pub fn error_budget_remaining(&self) -> usize {
        self.error_budget.saturating_sub(self.errors.len())
    }

    pub fn budget_exceeded(&self) -> bool {
        self.errors.len() > self.error_budget
    }

    pub fn record_error(&mut self, error: &AdaptError, url: Option<&str>) {
        self.errors.push(JobError::new(self.phase, error, url));
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary::from(self)
    }
}

/// Compact, user-facing outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub fingerprint: String,
    pub phase: JobPhase,
    pub pages_fetched: usize,
    pub accepted: usize,
    pub new_items: usize,
    pub low_confidence: usize,
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobState> for JobSummary {
    fn from(state: &JobState) -> Self {
        Self {
            job_id: state.job_id,
            name: state.name.clone(),
            fingerprint: state.fingerprint.clone(),
            phase: state.phase,
            pages_fetched: state.pending_items.len(),
            accepted: state.accepted_items.len(),
            new_items: state.new_item_count,
            low_confidence: state.accepted_items.iter().filter(|r| r.low_confidence).count(),
            error_count: state.errors.len(),
            failure_reason: state.failure_reason.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pairs: &[(&str, &str)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect()
    }

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn field_kind_validation() {
        assert!(FieldKind::Date.accepts("2024-03-01"));
        assert!(FieldKind::Date.accepts("March 13, 2024"));
        assert!(FieldKind::Date.accepts("2024-03-01T10:00:00Z"));
        assert!(!FieldKind::Date.accepts("yesterday"));
        assert!(FieldKind::Url.accepts("/posts/1"));
        assert!(FieldKind::Url.accepts("https://example.com/a"));
        assert!(!FieldKind::Url.accepts("mailto:a@b.c"));
        assert!(FieldKind::Number.accepts("$1,299.00"));
        assert!(!FieldKind::Number.accepts("n/a"));
        assert!(FieldKind::Text.accepts("x"));
        assert!(!FieldKind::Text.accepts("   "));
    }

    #[test]
    fn strategy_kinds_are_cost_ordered() {
        assert!(StrategyKind::Deterministic < StrategyKind::RenderedDom);
        assert!(StrategyKind::RenderedDom < StrategyKind::Semantic);
        let parsed: StrategyKind = "rendered_dom".parse().expect("parse");
        assert_eq!(parsed, StrategyKind::RenderedDom);
    }

    #[test]
    fn field_value_untagged_serde() {
        let single: FieldValue = serde_json::from_str("\"a\"").expect("single");
        assert_eq!(single, FieldValue::Single("a".into()));
        let list: FieldValue = serde_json::from_str("[\"a\",\"b\"]").expect("list");
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn from_items_collapses_list_pages() {
        let items = vec![
            item(&[("title", "One"), ("date", "2024-01-01")]),
            item(&[("title", "Two"), ("date", " ")]),
            Item::new(),
        ];
        let result = ExtractionResult::from_items(StrategyKind::Deterministic, items);
        assert_eq!(result.raw_item_count, 2);
        assert_eq!(
            result.fields["title"],
            FieldValue::List(vec!["One".into(), "Two".into()])
        );
        assert_eq!(result.fields["date"], FieldValue::List(vec!["2024-01-01".into()]));
        assert!(!result.items[1].contains_key("date"));
    }

    #[test]
    fn single_item_keeps_scalar_fields() {
        let result =
            ExtractionResult::from_items(StrategyKind::Semantic, vec![item(&[("title", "Only")])]);
        assert_eq!(result.fields["title"], FieldValue::Single("Only".into()));
        assert!(!result.is_empty());
        assert!(ExtractionResult::empty(StrategyKind::Semantic).is_empty());
    }

    #[test]
    fn content_hash_ignores_case_and_padding() {
        let a = item(&[("title", "Hello World"), ("url", "/a")]);
        let b = item(&[("url", "/a "), ("title", "  hello world")]);
        let c = item(&[("title", "Hello World"), ("url", "/b")]);
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&c));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn pattern_confidence_is_smoothed() {
        let mut p = Pattern::first_use("site-A/list", SelectorSpec::default(), true);
        assert_eq!(p.use_count(), 1);
        assert_eq!(p.success_count(), 1);
        assert!((p.confidence() - 2.0 / 3.0).abs() < 1e-9);

        p.record_use(false);
        assert!((p.confidence() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn restore_clamps_successes() {
        let now = Utc::now();
        let p = Pattern::restore(
            PatternId::new(),
            "fp".into(),
            SelectorSpec::default(),
            9,
            3,
            now,
            now,
            None,
        );
        assert_eq!(p.success_count(), 3);
        assert!((p.confidence() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn budget_accounting() {
        let mut state = JobState::new(JobId::new(), "job", "fp", 2);
        assert_eq!(state.error_budget_remaining(), 2);
        for _ in 0..3 {
            state.record_error(&AdaptError::parse("bad"), None);
        }
        assert!(state.budget_exceeded());
        assert_eq!(state.error_budget_remaining(), 0);
        assert_eq!(state.errors[0].kind, ErrorKind::Parse);
    }

    #[test]
    fn summary_counts_low_confidence() {
        let mut state = JobState::new(JobId::new(), "job", "fp", 10);
        state.accepted_items.push(Record::new(
            state.job_id,
            "https://a",
            item(&[("title", "x")]),
            0.4,
            StrategyKind::Semantic,
            true,
        ));
        let summary = state.summary();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.low_confidence, 1);
    }
}
