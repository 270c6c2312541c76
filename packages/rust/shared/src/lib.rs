//! Shared types, error model, capability traits, and configuration for adaptcrawl.
//!
//! This crate is the foundation depended on by all other adaptcrawl crates.
//! It provides:
//! - [`AdaptError`]: the unified error type
//! - Domain types ([`Pattern`], [`ExtractionResult`], [`JobState`], [`Record`])
//! - Capability traits ([`Fetcher`], [`SemanticExtractor`], [`RecordStore`], ...)
//! - Configuration ([`AppConfig`], [`JobConfig`], config loading)

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentConfig, AppConfig, CredentialsConfig, ExecutorConfig, FetchConfig, FetchPolicyConfig,
    JobConfig, LadderConfig, NotifyConfig, OrchestratorConfig, PatternConfig, ScoringConfig,
    SemanticConfig, StorageConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_config,
};
pub use error::{AdaptError, ErrorKind, Result};
pub use traits::{
    Fetcher, JobArchive, Notifier, PatternRepository, RecordStore, SemanticExtractor,
    SemanticOutput, SimilarityIndex,
};
pub use types::{
    Credentials, ExtractionResult, FetchOptions, FieldKind, FieldLocator, FieldSchema, FieldSpec,
    FieldValue, Item, JobError, JobId, JobPhase, JobState, JobSummary, Pattern, PatternId,
    PatternOutcome, RawPage, Record, SelectorSpec, StrategyAttempt, StrategyKind, TaskId, Tuning,
    content_hash, smoothed_confidence,
};
