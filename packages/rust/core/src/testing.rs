//! In-memory doubles and fixtures for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use adaptcrawl_shared::{
    AdaptError, FetchOptions, Fetcher, FieldKind, FieldLocator, FieldSchema, FieldSpec, Item,
    JobArchive, JobPhase, JobState, JobSummary, Notifier, RawPage, Record, RecordStore, Result,
    SelectorSpec, SemanticExtractor, SemanticOutput,
};

use crate::progress::ProgressReporter;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const NEWS: &str = r#"<html><body>
  <nav><a href="/">Home</a><a href="/about">About</a></nav>
  <div class="news">
    <article class="entry"><h3><a href="/a/1">Rates rise again</a></h3><span class="date">2024-05-01</span><p>The central bank raised rates.</p></article>
    <article class="entry"><h3><a href="/a/2">Markets rally</a></h3><span class="date">2024-05-02</span><p>Stocks closed higher.</p></article>
    <article class="entry"><h3><a href="/a/3">New bridge opens</a></h3><span class="date">2024-05-03</span><p>Traffic should ease.</p></article>
  </div>
</body></html>"#;

pub fn news_page() -> String {
    NEWS.to_string()
}

/// A page holding exactly one story.
pub fn article_page(n: usize) -> String {
    format!(
        r#"<html><body><article class="entry"><h3><a href="/a/{n}">Story number {n}</a></h3><span class="date">2024-05-{:02}</span></article></body></html>"#,
        n % 28 + 1
    )
}

/// Three stories with titles and links but no dates.
pub fn undated_page() -> String {
    let entries: String = (1..=3)
        .map(|n| format!(r#"<article class="entry"><h3><a href="/a/{n}">Story number {n}</a></h3></article>"#))
        .collect();
    format!(r#"<html><body><div class="news">{entries}</div></body></html>"#)
}

pub const BROKEN: &str = "<html><body><p>down for maintenance</p></body></html>";

pub fn news_schema() -> FieldSchema {
    FieldSchema::new(vec![
        FieldSpec::required("title", FieldKind::Text),
        FieldSpec::required("date", FieldKind::Date),
        FieldSpec::optional("url", FieldKind::Url),
    ])
}

fn locator(field: &str, selector: &str, attr: Option<&str>) -> FieldLocator {
    FieldLocator {
        field: field.into(),
        selector: selector.into(),
        attr: attr.map(str::to_string),
    }
}

pub fn news_spec() -> SelectorSpec {
    SelectorSpec {
        item: Some("article.entry".into()),
        fields: vec![
            locator("title", "h3", None),
            locator("date", "span.date", None),
            locator("url", "h3 a", Some("href")),
        ],
    }
}

/// Like [`news_spec`] but with a date selector that matches nothing.
pub fn spec_missing_date() -> SelectorSpec {
    SelectorSpec {
        item: Some("article.entry".into()),
        fields: vec![
            locator("title", "h3", None),
            locator("date", "span.published", None),
            locator("url", "h3 a", Some("href")),
        ],
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MockResponse {
    Html(String),
    Status(u16),
    Transient,
}

/// Canned responses per URL; unknown URLs get a 404.
#[derive(Debug)]
pub struct MockFetcher {
    pages: HashMap<String, MockResponse>,
    fallback: MockResponse,
    delay: Duration,
    calls: AtomicUsize,
    render_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            fallback: MockResponse::Status(404),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            render_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), MockResponse::Html(html.into()));
        self
    }

    pub fn status(mut self, url: &str, status: u16) -> Self {
        self.pages.insert(url.to_string(), MockResponse::Status(status));
        self
    }

    pub fn transient(mut self, url: &str) -> Self {
        self.pages.insert(url.to_string(), MockResponse::Transient);
        self
    }

    pub fn with_fallback_html(mut self, html: impl Into<String>) -> Self {
        self.fallback = MockResponse::Html(html.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<RawPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if options.render {
            self.render_calls.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.pages.get(url).unwrap_or(&self.fallback) {
            MockResponse::Html(html) => {
                let mut page = RawPage::new(url, 200, html.clone());
                page.rendered = options.render;
                Ok(page)
            }
            MockResponse::Status(status) => {
                Err(AdaptError::permanent(url, Some(*status), "mock status"))
            }
            MockResponse::Transient => Err(AdaptError::transient(url, "connection reset")),
        }
    }
}

// ---------------------------------------------------------------------------
// Semantic extractor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockSemantic {
    items: Vec<Item>,
    self_reported: f64,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockSemantic {
    pub fn empty() -> Self {
        Self::returning(Vec::new(), 0.0)
    }

    pub fn returning(items: Vec<Item>, self_reported: f64) -> Self {
        Self {
            items,
            self_reported,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticExtractor for MockSemantic {
    async fn extract(&self, _text: &str, _schema: &FieldSchema) -> Result<SemanticOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(SemanticOutput {
            items: self.items.clone(),
            self_reported_confidence: self.self_reported,
        })
    }
}

// ---------------------------------------------------------------------------
// Stores and sinks
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryRecordStore {
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn exists(&self, content_hash: &str) -> Result<bool> {
        Ok(self.records.lock().unwrap().contains_key(content_hash))
    }

    async fn batch_upsert(&self, records: &[Record]) -> Result<usize> {
        let mut stored = self.records.lock().unwrap();
        let mut inserted = 0;
        for record in records {
            if !stored.contains_key(&record.content_hash) {
                stored.insert(record.content_hash.clone(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    fail: bool,
    sent: Mutex<Vec<JobSummary>>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<JobSummary> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, summary: &JobSummary) -> Result<()> {
        self.sent.lock().unwrap().push(summary.clone());
        if self.fail {
            return Err(AdaptError::transient("https://hooks.example/", "webhook down"));
        }
        Ok(())
    }
}

/// Keeps the page callbacks a job made.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    fetched: Mutex<Vec<(String, usize)>>,
    parsed: AtomicUsize,
}

impl RecordingProgress {
    /// `(url, total)` per `page_fetched` call.
    pub fn fetched(&self) -> Vec<(String, usize)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn parsed(&self) -> usize {
        self.parsed.load(Ordering::SeqCst)
    }
}

impl ProgressReporter for RecordingProgress {
    fn phase(&self, _job: &str, _phase: JobPhase) {}

    fn page_fetched(&self, url: &str, _current: usize, total: usize) {
        self.fetched.lock().unwrap().push((url.to_string(), total));
    }

    fn page_parsed(&self, _url: &str, _current: usize, _total: usize) {
        self.parsed.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self, _summary: &JobSummary) {}
}

#[derive(Debug, Default)]
pub struct MemoryArchive {
    jobs: Mutex<Vec<JobState>>,
}

impl MemoryArchive {
    pub fn jobs(&self) -> Vec<JobState> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobArchive for MemoryArchive {
    async fn archive_job(&self, state: &JobState) -> Result<()> {
        self.jobs.lock().unwrap().push(state.clone());
        Ok(())
    }
}
