//! The strategy ladder: cheap extraction first, escalate only when needed.
//!
//! Strategies form a closed set ([`ExtractionStrategy`]), each variant
//! wrapping a struct that implements [`Strategy`]. The ladder runs them in
//! [`StrategyKind`] cost order, scores every result with the
//! [`ConfidenceScorer`], and stops at the first one that clears the accept
//! threshold. A strategy that errors or times out scores 0.0 and the ladder
//! moves on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use adaptcrawl_crawler::{apply_spec, detect_structure, page_text};
use adaptcrawl_shared::{
    AdaptError, AppConfig, ExtractionResult, FetchOptions, Fetcher, FieldSchema, RawPage, Result,
    SelectorSpec, SemanticExtractor, StrategyAttempt, StrategyKind,
};

use crate::scorer::ConfidenceScorer;

/// What a strategy gets to work with for one page.
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    /// The page as fetched during Crawl.
    pub page: &'a RawPage,
    pub schema: &'a FieldSchema,
    /// Best known selectors for this page (learned pattern or job selectors).
    pub candidate: Option<&'a SelectorSpec>,
    pub fetch_options: &'a FetchOptions,
}

/// Unscored output of one strategy.
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub result: ExtractionResult,
    /// The selectors that produced `result`, when the strategy is selector based.
    pub selector_spec: Option<SelectorSpec>,
}

/// One rung of the ladder.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn attempt(&self, input: &StrategyInput<'_>) -> Result<StrategyOutput>;
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Applies known selectors to the fetched document. No network access.
#[derive(Debug, Default)]
pub struct DeterministicStrategy;

#[async_trait]
impl Strategy for DeterministicStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Deterministic
    }

    async fn attempt(&self, input: &StrategyInput<'_>) -> Result<StrategyOutput> {
        let spec = input
            .candidate
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdaptError::parse("no selectors known for this page"))?;
        let items = apply_spec(&input.page.body, spec)?;
        Ok(StrategyOutput {
            result: ExtractionResult::from_items(self.kind(), items),
            selector_spec: Some(spec.clone()),
        })
    }
}

/// Fetches the rendered DOM and detects the item structure on it.
pub struct RenderedDomStrategy {
    fetcher: Arc<dyn Fetcher>,
}

impl RenderedDomStrategy {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Strategy for RenderedDomStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RenderedDom
    }

    async fn attempt(&self, input: &StrategyInput<'_>) -> Result<StrategyOutput> {
        let rendered;
        let page = if input.page.rendered {
            input.page
        } else {
            let options = FetchOptions {
                render: true,
                ..input.fetch_options.clone()
            };
            rendered = self.fetcher.fetch(&input.page.url, &options).await?;
            &rendered
        };

        let detected = detect_structure(&page.body, input.schema, input.candidate)
            .ok_or_else(|| AdaptError::parse("no repeated structure or field locators found"))?;
        let items = apply_spec(&page.body, &detected.spec)?;
        Ok(StrategyOutput {
            result: ExtractionResult::from_items(self.kind(), items),
            selector_spec: Some(detected.spec),
        })
    }
}

/// Hands page text to the semantic extraction backend.
pub struct SemanticStrategy {
    extractor: Arc<dyn SemanticExtractor>,
    max_chars: usize,
}

impl SemanticStrategy {
    pub fn new(extractor: Arc<dyn SemanticExtractor>, max_chars: usize) -> Self {
        Self {
            extractor,
            max_chars,
        }
    }
}

#[async_trait]
impl Strategy for SemanticStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    async fn attempt(&self, input: &StrategyInput<'_>) -> Result<StrategyOutput> {
        let text = page_text(&input.page.body, self.max_chars)?;
        if text.is_empty() {
            return Err(AdaptError::parse("page has no text content"));
        }
        let output = self.extractor.extract(&text, input.schema).await?;
        debug!(
            self_reported = output.self_reported_confidence,
            items = output.items.len(),
            "semantic extractor returned"
        );
        Ok(StrategyOutput {
            result: ExtractionResult::from_items(self.kind(), output.items),
            selector_spec: None,
        })
    }
}

/// The closed set of ladder rungs.
pub enum ExtractionStrategy {
    Deterministic(DeterministicStrategy),
    RenderedDom(RenderedDomStrategy),
    Semantic(SemanticStrategy),
}

impl ExtractionStrategy {
    fn as_strategy(&self) -> &dyn Strategy {
        match self {
            Self::Deterministic(s) => s,
            Self::RenderedDom(s) => s,
            Self::Semantic(s) => s,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.as_strategy().kind()
    }

    pub async fn attempt(&self, input: &StrategyInput<'_>) -> Result<StrategyOutput> {
        self.as_strategy().attempt(input).await
    }
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

/// Result of running the ladder on one page.
#[derive(Debug, Clone)]
pub struct LadderOutcome {
    /// Accepted result, or the best low-confidence one.
    pub result: ExtractionResult,
    pub accepted: bool,
    /// Selectors behind `result`, if it came from a selector-based rung.
    pub selector_spec: Option<SelectorSpec>,
    /// Every attempt made, in order.
    pub attempts: Vec<StrategyAttempt>,
}

impl LadderOutcome {
    /// Whether `kind` was run for this page.
    pub fn ran(&self, kind: StrategyKind) -> bool {
        self.attempts.iter().any(|a| a.strategy == kind)
    }
}

/// Ordered strategies plus the acceptance policy.
pub struct StrategyLadder {
    strategies: Vec<ExtractionStrategy>,
    scorer: ConfidenceScorer,
    accept_threshold: f64,
    attempt_timeout: Duration,
}

impl StrategyLadder {
    /// Build the standard ladder. The semantic rung is present only when an
    /// extractor is supplied.
    pub fn new(
        config: &AppConfig,
        fetcher: Arc<dyn Fetcher>,
        semantic: Option<Arc<dyn SemanticExtractor>>,
    ) -> Self {
        let mut strategies = vec![
            ExtractionStrategy::Deterministic(DeterministicStrategy),
            ExtractionStrategy::RenderedDom(RenderedDomStrategy::new(fetcher)),
        ];
        if let Some(extractor) = semantic {
            strategies.push(ExtractionStrategy::Semantic(SemanticStrategy::new(
                extractor,
                config.ladder.semantic_max_chars,
            )));
        }
        Self::from_strategies(
            strategies,
            ConfidenceScorer::new(config.scoring.clone()),
            config.ladder.accept_threshold,
            Duration::from_secs(config.ladder.strategy_timeout_secs),
        )
    }

    /// Build from explicit rungs; they are sorted into cost order.
    pub fn from_strategies(
        mut strategies: Vec<ExtractionStrategy>,
        scorer: ConfidenceScorer,
        accept_threshold: f64,
        attempt_timeout: Duration,
    ) -> Self {
        strategies.sort_by_key(ExtractionStrategy::kind);
        Self {
            strategies,
            scorer,
            accept_threshold,
            attempt_timeout,
        }
    }

    pub fn with_accept_threshold(mut self, threshold: f64) -> Self {
        self.accept_threshold = threshold;
        self
    }

    pub fn accept_threshold(&self) -> f64 {
        self.accept_threshold
    }

    pub fn scorer(&self) -> &ConfidenceScorer {
        &self.scorer
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(ExtractionStrategy::kind).collect()
    }

    /// Run the ladder on one page.
    #[instrument(skip_all, fields(url = %input.page.url))]
    pub async fn run(&self, input: &StrategyInput<'_>) -> LadderOutcome {
        let mut attempts = Vec::with_capacity(self.strategies.len());
        let mut best: Option<(ExtractionResult, Option<SelectorSpec>)> = None;

        for strategy in &self.strategies {
            let kind = strategy.kind();
            let started = Instant::now();
            let raw = match tokio::time::timeout(self.attempt_timeout, strategy.attempt(input)).await
            {
                Ok(result) => result,
                Err(_) => Err(AdaptError::timeout(
                    format!("{kind} strategy"),
                    self.attempt_timeout,
                )),
            };

            let (result, spec, error) = match raw {
                Ok(output) => (
                    self.scorer.assess(output.result, input.schema),
                    output.selector_spec,
                    None,
                ),
                Err(e) => {
                    warn!(strategy = %kind, error = %e, "strategy failed, scoring 0");
                    (
                        self.scorer.assess(ExtractionResult::empty(kind), input.schema),
                        None,
                        Some(e.to_string()),
                    )
                }
            };

            let accepted = result.confidence >= self.accept_threshold;
            attempts.push(StrategyAttempt {
                url: input.page.url.clone(),
                strategy: kind,
                confidence: result.confidence,
                accepted,
                error,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            debug!(strategy = %kind, confidence = result.confidence, accepted, "strategy scored");

            if accepted {
                info!(strategy = %kind, confidence = result.confidence, "extraction accepted");
                return LadderOutcome {
                    result,
                    accepted: true,
                    selector_spec: spec,
                    attempts,
                };
            }
            if best
                .as_ref()
                .is_none_or(|(b, _)| result.confidence > b.confidence)
            {
                best = Some((result, spec));
            }
        }

        let (result, selector_spec) = best.unwrap_or_else(|| {
            (
                self.scorer
                    .assess(ExtractionResult::empty(StrategyKind::Deterministic), input.schema),
                None,
            )
        });
        debug!(
            confidence = result.confidence,
            strategy = %result.strategy_used,
            "ladder exhausted below threshold"
        );
        LadderOutcome {
            result,
            accepted: false,
            selector_spec,
            attempts,
        }
    }
}
