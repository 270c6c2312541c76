//! Job workflow: `Init → Crawl → Parse → Store → Notify → Done`.
//!
//! Each phase handler takes the [`JobState`] by value and returns the next
//! value; [`transition`] decides where the job goes from there. The driver
//! loop is the only place that changes `phase`, writes pattern outcomes back
//! to the [`PatternStore`], and publishes snapshots for status queries.
//!
//! `Failed` is reachable from every phase: once a job has recorded more
//! errors than its budget allows, or when it is cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use adaptcrawl_crawler::fingerprint_for;
use adaptcrawl_shared::{
    AdaptError, AppConfig, FetchOptions, Fetcher, FieldSchema, JobArchive, JobConfig, JobId,
    JobPhase, JobState, JobSummary, Notifier, PatternOutcome, RawPage, Record, RecordStore,
    Result, SelectorSpec, SemanticExtractor, StrategyKind,
};

use crate::agents::Supervisor;
use crate::executor::{ErrorBudget, RetryPolicy, TaskExecutor, TaskOutcome};
use crate::patterns::PatternStore;
use crate::progress::ProgressReporter;
use crate::strategy::{LadderOutcome, StrategyInput, StrategyLadder};

/// External capabilities a job runs against.
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub semantic: Option<Arc<dyn SemanticExtractor>>,
    pub records: Arc<dyn RecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub archive: Option<Arc<dyn JobArchive>>,
    pub progress: Arc<dyn ProgressReporter>,
}

struct JobEntry {
    state: JobState,
    cancel: CancellationToken,
}

/// Per-job immutable context shared by the phase handlers.
struct JobContext {
    job: JobConfig,
    schema: Arc<FieldSchema>,
    fetch_options: Arc<FetchOptions>,
    ladder: Arc<StrategyLadder>,
    cancel: CancellationToken,
}

/// Runs jobs against a shared executor, pattern store, and record store.
pub struct Orchestrator {
    config: AppConfig,
    patterns: Arc<PatternStore>,
    collaborators: Collaborators,
    executor: TaskExecutor,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, patterns: Arc<PatternStore>, collaborators: Collaborators) -> Self {
        let executor = TaskExecutor::new(&config.executor);
        Self {
            config,
            patterns,
            collaborators,
            executor,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn patterns(&self) -> &Arc<PatternStore> {
        &self.patterns
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Validate `job` and start it in the background.
    ///
    /// Configuration errors are returned here and the job never starts.
    pub async fn submit_job(self: &Arc<Self>, job: JobConfig) -> Result<JobId> {
        let (state, ctx) = self.prepare_job(job)?;
        let job_id = state.job_id;
        self.register(&state, &ctx).await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(state, ctx).await;
        });
        Ok(job_id)
    }

    /// Validate `job` and run it to a terminal phase.
    pub async fn run_job(&self, job: JobConfig) -> Result<JobState> {
        let (state, ctx) = self.prepare_job(job)?;
        self.register(&state, &ctx).await;
        Ok(self.drive(state, ctx).await)
    }

    /// Latest snapshot of a job's state.
    pub async fn get_status(&self, job_id: JobId) -> Option<JobState> {
        self.jobs.read().await.get(&job_id).map(|e| e.state.clone())
    }

    /// Records accepted so far.
    pub async fn get_result(&self, job_id: JobId) -> Option<Vec<Record>> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|e| e.state.accepted_items.clone())
    }

    pub async fn job_summary(&self, job_id: JobId) -> Option<JobSummary> {
        self.jobs.read().await.get(&job_id).map(|e| e.state.summary())
    }

    /// Request cancellation. Returns `false` for unknown or finished jobs.
    pub async fn cancel_job(&self, job_id: JobId) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(&job_id) {
            Some(entry) if !entry.state.phase.is_terminal() => {
                info!(%job_id, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn prepare_job(&self, job: JobConfig) -> Result<(JobState, JobContext)> {
        job.validate()?;
        let credentials = job.credentials.resolve()?;

        let fingerprint = match &job.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => {
                let first = job
                    .urls
                    .first()
                    .ok_or_else(|| AdaptError::config("job has no urls"))?;
                let url = Url::parse(first)
                    .map_err(|e| AdaptError::config(format!("invalid url '{first}': {e}")))?;
                fingerprint_for(&url)
            }
        };

        let mut ladder = StrategyLadder::new(
            &self.config,
            self.collaborators.fetcher.clone(),
            self.collaborators.semantic.clone(),
        );
        if let Some(threshold) = job.accept_threshold {
            ladder = ladder.with_accept_threshold(threshold);
        }

        let state = JobState::new(
            JobId::new(),
            job.name.clone(),
            fingerprint,
            self.config.orchestrator.error_budget,
        );
        let ctx = JobContext {
            schema: Arc::new(job.schema.clone()),
            fetch_options: Arc::new(FetchOptions {
                render: job.render,
                credentials,
            }),
            ladder: Arc::new(ladder),
            cancel: CancellationToken::new(),
            job,
        };
        Ok((state, ctx))
    }

    async fn register(&self, state: &JobState, ctx: &JobContext) {
        self.jobs.write().await.insert(
            state.job_id,
            JobEntry {
                state: state.clone(),
                cancel: ctx.cancel.clone(),
            },
        );
    }

    async fn publish(&self, state: &JobState) {
        if let Some(entry) = self.jobs.write().await.get_mut(&state.job_id) {
            entry.state = state.clone();
        }
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(job_id = %state.job_id, job = %state.name))]
    async fn drive(&self, mut state: JobState, ctx: JobContext) -> JobState {
        info!(
            urls = ctx.job.urls.len(),
            fingerprint = %state.fingerprint,
            complex = ctx.job.complex,
            "job started"
        );
        let mut supervisor = ctx.job.complex.then(|| {
            Supervisor::spawn(&self.config)
                .with_accept_threshold(ctx.ladder.accept_threshold())
        });

        while !state.phase.is_terminal() {
            if ctx.cancel.is_cancelled() {
                warn!(phase = %state.phase, "job cancelled");
                state.record_error(&AdaptError::Cancelled, None);
                state.failure_reason = Some("cancelled".into());
                state.phase = JobPhase::Failed;
                break;
            }

            let phase = state.phase;
            self.collaborators.progress.phase(&state.name, phase);
            state = match phase {
                JobPhase::Init => self.init(state).await,
                JobPhase::Crawl => {
                    let crawled = self.crawl(state, &ctx).await;
                    match supervisor.as_mut() {
                        Some(supervisor) if transition(&crawled) == JobPhase::Parse => {
                            let hint = self.candidate_spec(&crawled, &ctx).await;
                            supervisor.prepare(crawled, &ctx.schema, hint.as_ref()).await
                        }
                        _ => crawled,
                    }
                }
                JobPhase::Parse => {
                    let parsed = self.parse(state, &ctx).await;
                    match supervisor.as_mut() {
                        Some(supervisor) => supervisor.validate(parsed, &ctx.schema).await,
                        None => parsed,
                    }
                }
                JobPhase::Store => {
                    let mut stored = self.store(state).await;
                    self.write_back_patterns(&mut stored).await;
                    stored
                }
                JobPhase::Notify => self.notify(state).await,
                JobPhase::Done | JobPhase::Failed => break,
            };

            let next = transition(&state);
            if next == JobPhase::Failed && state.failure_reason.is_none() {
                state.failure_reason = Some(failure_reason(&state));
            }
            info!(from = %phase, to = %next, errors = state.errors.len(), "phase transition");
            state.phase = next;
            self.publish(&state).await;
        }

        state.finished_at = Some(Utc::now());
        if let Some(archive) = &self.collaborators.archive {
            if let Err(e) = archive.archive_job(&state).await {
                warn!(error = %e, "failed to archive job");
            }
        }
        // `finished_at` becomes visible only once the job is archived.
        self.publish(&state).await;

        let summary = state.summary();
        match state.phase {
            JobPhase::Failed => warn!(
                reason = summary.failure_reason.as_deref().unwrap_or("unknown"),
                errors = summary.error_count,
                "job failed"
            ),
            _ => info!(
                accepted = summary.accepted,
                new_items = summary.new_items,
                errors = summary.error_count,
                "job finished"
            ),
        }
        self.collaborators.progress.done(&summary);
        state
    }

    /// Best known selectors for the job: reused pattern, agent suggestion,
    /// then the job's own selectors.
    async fn candidate_spec(&self, state: &JobState, ctx: &JobContext) -> Option<SelectorSpec> {
        let active = match state.active_pattern {
            Some(id) => self.patterns.get(id).await,
            None => None,
        };
        active
            .map(|p| p.selector_spec)
            .or_else(|| state.suggested_spec.clone())
            .or_else(|| ctx.job.selectors.clone())
    }

    async fn write_back_patterns(&self, state: &mut JobState) {
        let outcomes = state.pattern_outcomes.clone();
        for outcome in outcomes {
            let written = self
                .patterns
                .record_outcome(
                    outcome.pattern_id,
                    &state.fingerprint,
                    outcome.selector_spec,
                    outcome.success,
                )
                .await;
            match written {
                Ok(pattern) => debug!(
                    pattern_id = %pattern.id,
                    confidence = pattern.confidence(),
                    "pattern updated"
                ),
                Err(e) => {
                    warn!(error = %e, "pattern write-back failed");
                    state.record_error(&e, None);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase handlers
    // -----------------------------------------------------------------------

    /// Look up a reusable pattern for the job's fingerprint.
    async fn init(&self, mut state: JobState) -> JobState {
        match self
            .patterns
            .retrieve(&state.fingerprint, self.config.patterns.retrieve_k)
            .await
        {
            Ok(hits) => {
                let best = hits
                    .iter()
                    .find(|hit| hit.pattern.fingerprint == state.fingerprint)
                    .or_else(|| hits.first());
                state.active_pattern = best.map(|hit| hit.pattern.id);
                if let Some(hit) = best {
                    info!(
                        pattern_id = %hit.pattern.id,
                        confidence = hit.pattern.confidence(),
                        similarity = hit.similarity,
                        "reusing pattern"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "pattern retrieval failed, continuing without one");
                state.active_pattern = None;
            }
        }
        state
    }

    /// Fetch every job URL. Stops issuing fetches once the error budget is spent.
    async fn crawl(&self, mut state: JobState, ctx: &JobContext) -> JobState {
        state.errors.retain(|e| e.phase != JobPhase::Crawl);
        let urls = ctx.job.urls.clone();
        let total = urls.len();
        let budget = ErrorBudget::new(state.error_budget, state.errors.len());

        let fetcher = self.collaborators.fetcher.clone();
        let options = ctx.fetch_options.clone();
        let progress = self.collaborators.progress.clone();
        let fetched = Arc::new(AtomicUsize::new(0));
        let outcomes = self
            .executor
            .run_batch(urls.clone(), &ctx.cancel, Some(&budget), move |url: String| {
                let fetcher = fetcher.clone();
                let options = options.clone();
                let progress = progress.clone();
                let fetched = fetched.clone();
                async move {
                    let page = fetcher.fetch(&url, &options).await?;
                    let current = fetched.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.page_fetched(&url, current, total);
                    Ok(page)
                }
            })
            .await;

        let mut pages = Vec::with_capacity(total);
        let mut skipped = 0usize;
        for (url, outcome) in urls.iter().zip(outcomes) {
            match outcome {
                TaskOutcome::Succeeded { value, attempts } => {
                    debug!(url = %url, attempts, "page fetched");
                    pages.push(value);
                }
                TaskOutcome::Failed { error, attempts } => {
                    warn!(url = %url, attempts, error = %error, "fetch failed");
                    state.record_error(&error, Some(url.as_str()));
                }
                TaskOutcome::Skipped => skipped += 1,
            }
        }
        if skipped > 0 {
            info!(skipped, "fetches not issued");
        }
        info!(fetched = pages.len(), total, "crawl finished");
        state.pending_items = pages;
        state
    }

    /// Run the strategy ladder on every fetched page.
    async fn parse(&self, mut state: JobState, ctx: &JobContext) -> JobState {
        state.errors.retain(|e| e.phase != JobPhase::Parse);
        state.accepted_items.clear();
        state.attempt_log.clear();
        state.pattern_outcomes.clear();

        let active = match state.active_pattern {
            Some(id) => self.patterns.get(id).await,
            None => None,
        };
        let candidate = self.candidate_spec(&state, ctx).await;
        // Only a pattern learned for this very fingerprint is tallied on reuse.
        let reused = active
            .as_ref()
            .filter(|p| p.fingerprint == state.fingerprint)
            .map(|p| (p.id, p.selector_spec.clone()));

        let executor = match state.tuning.as_ref().and_then(|t| t.max_concurrency) {
            Some(limit) => self.executor.narrowed(limit),
            None => self.executor.clone(),
        }
        .with_retry(RetryPolicy::none());

        let pages = state.pending_items.clone();
        let total = pages.len();
        let ladder = ctx.ladder.clone();
        let schema = ctx.schema.clone();
        let options = ctx.fetch_options.clone();
        let shared_candidate = Arc::new(candidate.clone());
        let persist_low = self.config.ladder.persist_low_confidence;
        let job_id = state.job_id;
        let budget = ErrorBudget::new(state.error_budget, state.errors.len());
        let charged = budget.clone();
        let outcomes = executor
            .run_batch(pages.clone(), &ctx.cancel, Some(&budget), move |page: RawPage| {
                let ladder = ladder.clone();
                let schema = schema.clone();
                let options = options.clone();
                let candidate = shared_candidate.clone();
                let charged = charged.clone();
                async move {
                    let input = StrategyInput {
                        page: &page,
                        schema: &schema,
                        candidate: (*candidate).as_ref(),
                        fetch_options: &options,
                    };
                    let outcome = ladder.run(&input).await;
                    let parsed = parse_page(job_id, &page, outcome, persist_low, &schema);
                    for _ in &parsed.errors {
                        charged.record_failure();
                    }
                    Ok::<ParsedPage, AdaptError>(parsed)
                }
            })
            .await;

        let mut reuse_hits = 0usize;
        let mut reuse_misses = 0usize;
        let mut learned: Vec<SelectorSpec> = Vec::new();

        for (index, (page, outcome)) in pages.iter().zip(outcomes).enumerate() {
            self.collaborators
                .progress
                .page_parsed(&page.url, index + 1, total);
            let ParsedPage {
                outcome,
                records,
                errors,
            } = match outcome {
                TaskOutcome::Succeeded { value, .. } => value,
                TaskOutcome::Failed { error, .. } => {
                    state.record_error(&error, Some(page.url.as_str()));
                    continue;
                }
                TaskOutcome::Skipped => continue,
            };
            for error in &errors {
                state.record_error(error, Some(page.url.as_str()));
            }
            state.accepted_items.extend(records);
            state.attempt_log.extend(outcome.attempts.iter().cloned());

            if let Some((_, spec)) = &reused {
                let hit = outcome.accepted
                    && outcome.result.strategy_used == StrategyKind::Deterministic
                    && outcome.selector_spec.as_ref() == Some(spec);
                if hit {
                    reuse_hits += 1;
                } else {
                    reuse_misses += 1;
                }
            }
            if outcome.accepted {
                if let Some(spec) = &outcome.selector_spec {
                    let is_reuse = reused.as_ref().is_some_and(|(_, s)| s == spec);
                    if !is_reuse && !learned.contains(spec) {
                        learned.push(spec.clone());
                    }
                }
            }
        }

        if let Some((id, spec)) = reused {
            if reuse_hits + reuse_misses > 0 {
                state.pattern_outcomes.push(PatternOutcome {
                    pattern_id: Some(id),
                    selector_spec: spec,
                    success: reuse_hits > 0 && reuse_hits >= reuse_misses,
                });
            }
        }
        state
            .pattern_outcomes
            .extend(learned.into_iter().map(|spec| PatternOutcome {
                pattern_id: None,
                selector_spec: spec,
                success: true,
            }));

        info!(
            pages = total,
            accepted = state.accepted_items.len(),
            low_confidence = state.accepted_items.iter().filter(|r| r.low_confidence).count(),
            "parse finished"
        );
        state
    }

    /// Persist records not seen before. Safe to repeat: known hashes are skipped.
    async fn store(&self, mut state: JobState) -> JobState {
        state.errors.retain(|e| e.phase != JobPhase::Store);
        let records = &self.collaborators.records;

        let mut seen = HashSet::new();
        let mut fresh: Vec<Record> = Vec::new();
        let mut failures: Vec<(AdaptError, String)> = Vec::new();
        for record in &state.accepted_items {
            if !seen.insert(record.content_hash.as_str()) {
                continue;
            }
            match records.exists(&record.content_hash).await {
                Ok(true) => {}
                Ok(false) => fresh.push(record.clone()),
                Err(e) => failures.push((e, record.source_url.clone())),
            }
        }

        let mut inserted = 0usize;
        for chunk in fresh.chunks(self.config.orchestrator.store_batch_size.max(1)) {
            match records.batch_upsert(chunk).await {
                Ok(count) => inserted += count,
                Err(e) => {
                    let url = chunk
                        .first()
                        .map(|r| r.source_url.clone())
                        .unwrap_or_default();
                    failures.push((e, url));
                }
            }
        }

        for (error, url) in &failures {
            warn!(error = %error, "store failed");
            state.record_error(error, Some(url.as_str()));
        }
        info!(
            candidates = fresh.len(),
            inserted,
            duplicates = state.accepted_items.len() - fresh.len(),
            "store finished"
        );
        state.new_item_count = inserted;
        state
    }

    /// Best-effort delivery of the job summary.
    async fn notify(&self, mut state: JobState) -> JobState {
        if state.notified {
            return state;
        }
        match self.collaborators.notifier.notify(&state.summary()).await {
            Ok(()) => state.notified = true,
            Err(e) => {
                warn!(error = %e, "notification failed, continuing");
                state.record_error(&e, None);
            }
        }
        state
    }
}

/// What one page yielded after the ladder ran.
struct ParsedPage {
    outcome: LadderOutcome,
    records: Vec<Record>,
    errors: Vec<AdaptError>,
}

/// Turn one page's ladder outcome into records plus the parse errors it owes.
fn parse_page(
    job_id: JobId,
    page: &RawPage,
    outcome: LadderOutcome,
    persist_low: bool,
    schema: &FieldSchema,
) -> ParsedPage {
    let mut errors = Vec::new();
    let mut records = Vec::new();
    let result = &outcome.result;
    if result.items.is_empty() {
        errors.push(AdaptError::parse("no items extracted"));
    } else if !outcome.accepted && !persist_low {
        errors.push(AdaptError::parse(format!(
            "best confidence {:.2} is below the accept threshold",
            result.confidence
        )));
    } else {
        for item in &result.items {
            let has_required = schema
                .required()
                .any(|spec| item.get(&spec.name).is_some_and(|v| !v.is_blank()));
            if !has_required {
                errors.push(AdaptError::parse("item has none of the required fields"));
                continue;
            }
            records.push(Record::new(
                job_id,
                page.url.clone(),
                item.clone(),
                result.confidence,
                result.strategy_used,
                !outcome.accepted,
            ));
        }
    }
    ParsedPage {
        outcome,
        records,
        errors,
    }
}

/// The phase that follows `state.phase`.
///
/// - terminal phases stay put
/// - more errors than the budget allows ⇒ `Failed`, from any phase
/// - `Crawl` with nothing fetched ⇒ `Failed`
/// - `Store` with no previously unseen record skips `Notify`
pub fn transition(state: &JobState) -> JobPhase {
    if state.phase.is_terminal() {
        return state.phase;
    }
    if state.budget_exceeded() {
        return JobPhase::Failed;
    }
    match state.phase {
        JobPhase::Init => JobPhase::Crawl,
        JobPhase::Crawl if state.pending_items.is_empty() => JobPhase::Failed,
        JobPhase::Crawl => JobPhase::Parse,
        JobPhase::Parse => JobPhase::Store,
        JobPhase::Store if state.new_item_count > 0 => JobPhase::Notify,
        JobPhase::Store => JobPhase::Done,
        JobPhase::Notify => JobPhase::Done,
        JobPhase::Done | JobPhase::Failed => state.phase,
    }
}

fn failure_reason(state: &JobState) -> String {
    if state.budget_exceeded() {
        format!(
            "error budget exceeded in {} ({} errors, budget {})",
            state.phase,
            state.errors.len(),
            state.error_budget
        )
    } else if state.phase == JobPhase::Crawl && state.pending_items.is_empty() {
        "no data".to_string()
    } else {
        format!("failed in {}", state.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use adaptcrawl_shared::{CredentialsConfig, ErrorKind, FieldValue, Item, JobError};

    use crate::progress::SilentProgress;
    use crate::testing::{
        BROKEN, MemoryArchive, MemoryRecordStore, MockFetcher, MockSemantic, RecordingNotifier,
        RecordingProgress, article_page, news_page, news_schema, news_spec, spec_missing_date,
        undated_page,
    };

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        fetcher: Arc<MockFetcher>,
        semantic: Arc<MockSemantic>,
        records: Arc<MemoryRecordStore>,
        notifier: Arc<RecordingNotifier>,
        archive: Arc<MemoryArchive>,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.executor.max_retries = 0;
        config.executor.base_delay_ms = 1;
        config.executor.jitter = false;
        config
    }

    fn harness(config: AppConfig, fetcher: MockFetcher, notifier: RecordingNotifier) -> Harness {
        harness_with_progress(config, fetcher, notifier, Arc::new(SilentProgress))
    }

    fn harness_with_progress(
        config: AppConfig,
        fetcher: MockFetcher,
        notifier: RecordingNotifier,
        progress: Arc<dyn ProgressReporter>,
    ) -> Harness {
        let fetcher = Arc::new(fetcher);
        let semantic = Arc::new(MockSemantic::empty());
        let records = Arc::new(MemoryRecordStore::default());
        let notifier = Arc::new(notifier);
        let archive = Arc::new(MemoryArchive::default());
        let patterns = Arc::new(PatternStore::in_memory(&config.patterns));
        let collaborators = Collaborators {
            fetcher: fetcher.clone(),
            semantic: Some(semantic.clone()),
            records: records.clone(),
            notifier: notifier.clone(),
            archive: Some(archive.clone()),
            progress,
        };
        Harness {
            orchestrator: Arc::new(Orchestrator::new(config, patterns, collaborators)),
            fetcher,
            semantic,
            records,
            notifier,
            archive,
        }
    }

    fn job(urls: Vec<String>, selectors: Option<SelectorSpec>) -> JobConfig {
        JobConfig {
            name: "site-a".into(),
            urls,
            fingerprint: Some("site-A/list".into()),
            schema: news_schema(),
            selectors,
            complex: false,
            render: false,
            accept_threshold: None,
            credentials: CredentialsConfig::default(),
        }
    }

    const LIST_URL: &str = "https://site-a.example/list";

    #[tokio::test]
    async fn error_budget_stops_fetching() {
        let mut config = test_config();
        config.executor.max_concurrency = 1;
        let h = harness(config, MockFetcher::new(), RecordingNotifier::default());
        let urls = (0..20)
            .map(|i| format!("https://site-a.example/missing/{i}"))
            .collect();

        let state = h.orchestrator.run_job(job(urls, Some(news_spec()))).await.unwrap();

        assert_eq!(state.phase, JobPhase::Failed);
        assert_eq!(h.fetcher.calls(), 11);
        assert_eq!(state.errors.len(), 11);
        assert!(state.errors.iter().all(|e| e.kind == ErrorKind::PermanentFetch));
        assert!(state.failure_reason.as_deref().unwrap().contains("error budget"));
        assert_eq!(h.archive.jobs().len(), 1);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn error_budget_stops_the_ladder_during_parse() {
        let mut config = test_config();
        config.executor.max_concurrency = 1;
        config.orchestrator.error_budget = 10;
        let fetcher = MockFetcher::new().with_fallback_html(BROKEN);
        let h = harness(config, fetcher, RecordingNotifier::default());
        let urls = (0..30)
            .map(|i| format!("https://site-a.example/down/{i}"))
            .collect();

        let state = h.orchestrator.run_job(job(urls, Some(news_spec()))).await.unwrap();

        assert_eq!(state.phase, JobPhase::Failed);
        assert_eq!(h.fetcher.calls() - h.fetcher.render_calls(), 30);
        assert!(h.fetcher.render_calls() <= 11, "{}", h.fetcher.render_calls());
        assert!(h.semantic.calls() <= 11, "{}", h.semantic.calls());
        assert_eq!(state.errors.len(), 11);
        assert!(state.errors.iter().all(|e| e.phase == JobPhase::Parse));
        assert_eq!(h.records.len(), 0);
    }

    #[tokio::test]
    async fn low_confidence_items_are_kept_and_flagged() {
        let fetcher = MockFetcher::new().page(LIST_URL, undated_page());
        let h = harness(test_config(), fetcher, RecordingNotifier::default());

        let state = h
            .orchestrator
            .run_job(job(vec![LIST_URL.into()], Some(news_spec())))
            .await
            .unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        assert!(state.attempt_log.iter().all(|a| !a.accepted));
        assert_eq!(state.accepted_items.len(), 3);
        assert!(state.accepted_items.iter().all(|r| r.low_confidence));
        assert!(state.errors.is_empty());
        let summary = state.summary();
        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.low_confidence, 3);
        assert_eq!(h.records.len(), 3);
    }

    #[tokio::test]
    async fn low_confidence_items_are_dropped_when_not_persisted() {
        let mut config = test_config();
        config.ladder.persist_low_confidence = false;
        let fetcher = MockFetcher::new().page(LIST_URL, undated_page());
        let h = harness(config, fetcher, RecordingNotifier::default());

        let state = h
            .orchestrator
            .run_job(job(vec![LIST_URL.into()], Some(news_spec())))
            .await
            .unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        assert!(state.accepted_items.is_empty());
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].phase, JobPhase::Parse);
        assert!(state.errors[0].message.contains("below the accept threshold"));
        assert_eq!(h.records.len(), 0);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn crawl_respects_the_concurrency_cap() {
        let mut config = test_config();
        config.executor.max_concurrency = 5;
        let fetcher = MockFetcher::new()
            .with_fallback_html(news_page())
            .with_delay(Duration::from_millis(10));
        let h = harness(config, fetcher, RecordingNotifier::default());
        let urls = (0..50).map(|i| format!("https://site-a.example/p/{i}")).collect();

        let state = h.orchestrator.run_job(job(urls, Some(news_spec()))).await.unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        assert_eq!(h.fetcher.calls(), 50);
        assert!(h.fetcher.peak() <= 5, "peak {}", h.fetcher.peak());
        assert!(h.fetcher.peak() > 1);
    }

    #[tokio::test]
    async fn progress_counts_only_fetched_pages() {
        let progress = Arc::new(RecordingProgress::default());
        let fetcher = MockFetcher::new()
            .page("https://site-a.example/p/0", article_page(0))
            .page("https://site-a.example/p/1", article_page(1));
        let h = harness_with_progress(
            test_config(),
            fetcher,
            RecordingNotifier::default(),
            progress.clone(),
        );
        let urls = (0..3).map(|i| format!("https://site-a.example/p/{i}")).collect();

        h.orchestrator.run_job(job(urls, Some(news_spec()))).await.unwrap();

        let mut fetched = progress.fetched();
        fetched.sort();
        assert_eq!(
            fetched,
            vec![
                ("https://site-a.example/p/0".to_string(), 2),
                ("https://site-a.example/p/1".to_string(), 2),
            ]
        );
        assert_eq!(progress.parsed(), 2);
    }

    #[tokio::test]
    async fn one_broken_page_does_not_lose_the_rest() {
        let mut fetcher = MockFetcher::new();
        let mut urls = Vec::new();
        for i in 1..=10 {
            let url = format!("https://site-a.example/story/{i}");
            fetcher = if i == 5 {
                fetcher.page(&url, BROKEN)
            } else {
                fetcher.page(&url, article_page(i))
            };
            urls.push(url);
        }
        let h = harness(test_config(), fetcher, RecordingNotifier::default());

        let state = h.orchestrator.run_job(job(urls, Some(news_spec()))).await.unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        assert_eq!(state.accepted_items.len(), 9);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].kind, ErrorKind::Parse);
        assert_eq!(state.errors[0].url.as_deref(), Some("https://site-a.example/story/5"));
        assert_eq!(state.new_item_count, 9);
        assert_eq!(h.records.len(), 9);
    }

    #[tokio::test]
    async fn store_twice_writes_no_duplicates() {
        let h = harness(test_config(), MockFetcher::new(), RecordingNotifier::default());
        let job_id = JobId::new();
        let mut state = JobState::new(job_id, "site-a", "site-A/list", 10);
        state.phase = JobPhase::Store;
        for title in ["One", "Two", "one "] {
            let mut fields = Item::new();
            fields.insert("title".into(), FieldValue::from(title));
            fields.insert("date".into(), FieldValue::from("2024-05-01"));
            state.accepted_items.push(Record::new(
                job_id,
                LIST_URL,
                fields,
                0.9,
                StrategyKind::Deterministic,
                false,
            ));
        }

        let first = h.orchestrator.store(state.clone()).await;
        assert_eq!(first.new_item_count, 2);
        assert_eq!(transition(&first), JobPhase::Notify);

        let second = h.orchestrator.store(state).await;
        assert_eq!(second.new_item_count, 0);
        assert_eq!(transition(&second), JobPhase::Done);
        assert_eq!(h.records.len(), 2);
    }

    #[tokio::test]
    async fn low_confidence_deterministic_escalates_and_learns() {
        let fetcher = MockFetcher::new().page(LIST_URL, news_page());
        let h = harness(test_config(), fetcher, RecordingNotifier::default());

        let state = h
            .orchestrator
            .run_job(job(vec![LIST_URL.into()], Some(spec_missing_date())))
            .await
            .unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        let log = &state.attempt_log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].strategy, StrategyKind::Deterministic);
        assert!(!log[0].accepted);
        assert!((log[0].confidence - 0.44).abs() < 1e-9, "{}", log[0].confidence);
        assert_eq!(log[1].strategy, StrategyKind::RenderedDom);
        assert!(log[1].accepted);
        assert_eq!(h.semantic.calls(), 0);
        assert_eq!(h.fetcher.render_calls(), 1);
        assert_eq!(state.accepted_items.len(), 3);

        let patterns = h.orchestrator.patterns().list().await;
        assert_eq!(patterns.len(), 1);
        let learned = &patterns[0];
        assert_eq!(learned.fingerprint, "site-A/list");
        assert_eq!(learned.use_count(), 1);
        assert_eq!(learned.success_count(), 1);
        assert!((learned.confidence() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn learned_pattern_is_reused_on_the_next_run() {
        let fetcher = MockFetcher::new().page(LIST_URL, news_page());
        let h = harness(test_config(), fetcher, RecordingNotifier::default());
        let run = || job(vec![LIST_URL.into()], Some(spec_missing_date()));

        h.orchestrator.run_job(run()).await.unwrap();
        let second = h.orchestrator.run_job(run()).await.unwrap();

        assert!(second.active_pattern.is_some());
        assert_eq!(second.attempt_log.len(), 1);
        assert!(second.attempt_log[0].accepted);
        assert_eq!(h.fetcher.render_calls(), 1);
        // Nothing new the second time round, so no notification.
        assert_eq!(second.new_item_count, 0);
        assert_eq!(h.notifier.sent().len(), 1);

        let patterns = h.orchestrator.patterns().list().await;
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].use_count(), 2);
        assert!((patterns[0].confidence() - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn notification_failure_is_not_fatal() {
        let fetcher = MockFetcher::new().page(LIST_URL, news_page());
        let h = harness(test_config(), fetcher, RecordingNotifier::failing());

        let state = h
            .orchestrator
            .run_job(job(vec![LIST_URL.into()], Some(news_spec())))
            .await
            .unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        assert!(!state.notified);
        assert_eq!(h.notifier.sent().len(), 1);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].phase, JobPhase::Notify);
    }

    #[tokio::test]
    async fn complex_job_uses_agent_suggestion() {
        let fetcher = MockFetcher::new().page(LIST_URL, news_page());
        let h = harness(test_config(), fetcher, RecordingNotifier::default());
        let mut config = job(vec![LIST_URL.into()], None);
        config.complex = true;

        let state = h.orchestrator.run_job(config).await.unwrap();

        assert_eq!(state.phase, JobPhase::Done);
        assert!(state.suggested_spec.is_some());
        assert!(state.tuning.is_some());
        assert_eq!(state.accepted_items.len(), 3);
        assert_eq!(state.attempt_log[0].strategy, StrategyKind::Deterministic);
        assert!(state.attempt_log[0].accepted);
        assert_eq!(h.fetcher.render_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_job_fails_without_finishing_the_crawl() {
        let mut config = test_config();
        config.executor.max_concurrency = 1;
        let fetcher = MockFetcher::new()
            .with_fallback_html(news_page())
            .with_delay(Duration::from_millis(200));
        let h = harness(config, fetcher, RecordingNotifier::default());
        let urls = (0..3).map(|i| format!("https://site-a.example/p/{i}")).collect();

        let job_id = h.orchestrator.submit_job(job(urls, Some(news_spec()))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.orchestrator.cancel_job(job_id).await);

        let mut status = None;
        for _ in 0..100 {
            let snapshot = h.orchestrator.get_status(job_id).await.unwrap();
            if snapshot.phase.is_terminal() {
                status = Some(snapshot);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let state = status.expect("job reached a terminal phase");

        assert_eq!(state.phase, JobPhase::Failed);
        assert_eq!(state.failure_reason.as_deref(), Some("cancelled"));
        assert!(h.fetcher.calls() < 3);
        assert!(!h.orchestrator.cancel_job(job_id).await);
    }

    #[tokio::test]
    async fn invalid_job_is_rejected_before_start() {
        let h = harness(test_config(), MockFetcher::new(), RecordingNotifier::default());

        let err = h.orchestrator.submit_job(job(Vec::new(), None)).await.unwrap_err();
        assert!(matches!(err, AdaptError::Config { .. }));

        let mut missing_secret = job(vec![LIST_URL.into()], None);
        missing_secret.credentials.bearer_token_env =
            Some("ADAPTCRAWL_TEST_TOKEN_THAT_IS_NOT_SET".into());
        let err = h.orchestrator.run_job(missing_secret).await.unwrap_err();
        assert!(matches!(err, AdaptError::Config { .. }));

        assert_eq!(h.fetcher.calls(), 0);
        assert!(h.archive.jobs().is_empty());
    }

    #[tokio::test]
    async fn status_and_result_are_published() {
        let fetcher = MockFetcher::new().page(LIST_URL, news_page());
        let h = harness(test_config(), fetcher, RecordingNotifier::default());

        let state = h
            .orchestrator
            .run_job(job(vec![LIST_URL.into()], Some(news_spec())))
            .await
            .unwrap();

        let status = h.orchestrator.get_status(state.job_id).await.unwrap();
        assert_eq!(status.phase, JobPhase::Done);
        assert!(status.finished_at.is_some());
        let records = h.orchestrator.get_result(state.job_id).await.unwrap();
        assert_eq!(records.len(), 3);
        let summary = h.orchestrator.job_summary(state.job_id).await.unwrap();
        assert_eq!(summary.new_items, 3);
        assert!(h.orchestrator.get_status(JobId::new()).await.is_none());
    }

    #[test]
    fn transition_rules() {
        let mut state = JobState::new(JobId::new(), "t", "fp", 2);
        assert_eq!(transition(&state), JobPhase::Crawl);

        state.phase = JobPhase::Crawl;
        assert_eq!(transition(&state), JobPhase::Failed);
        assert_eq!(failure_reason(&state), "no data");
        state.pending_items.push(RawPage::new(LIST_URL, 200, "<html></html>"));
        assert_eq!(transition(&state), JobPhase::Parse);

        state.phase = JobPhase::Parse;
        assert_eq!(transition(&state), JobPhase::Store);
        state.phase = JobPhase::Store;
        assert_eq!(transition(&state), JobPhase::Done);
        state.new_item_count = 1;
        assert_eq!(transition(&state), JobPhase::Notify);
        state.phase = JobPhase::Notify;
        assert_eq!(transition(&state), JobPhase::Done);

        // The budget breaker wins over every other rule.
        state.phase = JobPhase::Parse;
        let err = AdaptError::parse("bad item");
        for _ in 0..3 {
            state.errors.push(JobError::new(JobPhase::Parse, &err, None));
        }
        assert_eq!(transition(&state), JobPhase::Failed);

        state.phase = JobPhase::Done;
        assert_eq!(transition(&state), JobPhase::Done);
    }
}
