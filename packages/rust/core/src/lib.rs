//! Adaptive extraction orchestration for adaptcrawl.
//!
//! This crate ties fetching, the strategy ladder, pattern learning, and
//! storage together into crawl jobs driven by a phase state machine
//! ([`Orchestrator`]), with a multi-agent escalation layer for complex jobs.

pub mod agents;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod patterns;
pub mod progress;
pub mod scorer;
pub mod semantic;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use agents::{Supervisor, SupervisorReport, TaskFailure, WorkerMetrics};
pub use executor::{ErrorBudget, RetryPolicy, TaskExecutor, TaskOutcome};
pub use notify::{LogNotifier, WebhookNotifier, notifier_from_config};
pub use orchestrator::{Collaborators, Orchestrator, transition};
pub use patterns::{HashedTrigramIndex, PatternStore, ScoredPattern};
pub use progress::{ProgressReporter, SilentProgress};
pub use scorer::ConfidenceScorer;
pub use semantic::HttpSemanticExtractor;
pub use strategy::{ExtractionStrategy, LadderOutcome, Strategy, StrategyInput, StrategyLadder};
