//! Application and job configuration for adaptcrawl.
//!
//! User config lives at `~/.adaptcrawl/adaptcrawl.toml`.
//! CLI flags override config file values, which override defaults.
//! Jobs are described separately by a [`JobConfig`] TOML file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AdaptError, Result};
use crate::types::{Credentials, FieldSchema, SelectorSpec};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "adaptcrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".adaptcrawl";

// ---------------------------------------------------------------------------
// Config structs (matching adaptcrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ladder: LadderConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub patterns: PatternConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub agents: AgentConfig,

    #[serde(default)]
    pub fetch: FetchPolicyConfig,

    #[serde(default)]
    pub semantic: SemanticConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[ladder]` section: escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderConfig {
    /// Minimum score at which a strategy result is accepted and escalation stops.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,

    /// Per-strategy attempt timeout.
    #[serde(default = "default_strategy_timeout")]
    pub strategy_timeout_secs: u64,

    /// Keep best-effort results that never cleared the threshold (flagged).
    #[serde(default = "default_true")]
    pub persist_low_confidence: bool,

    /// Page text sent to the semantic extractor is truncated to this length.
    #[serde(default = "default_semantic_max_chars")]
    pub semantic_max_chars: usize,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            strategy_timeout_secs: default_strategy_timeout(),
            persist_low_confidence: true,
            semantic_max_chars: default_semantic_max_chars(),
        }
    }
}

fn default_accept_threshold() -> f64 {
    0.7
}
fn default_strategy_timeout() -> u64 {
    30
}
fn default_semantic_max_chars() -> usize {
    50_000
}
fn default_true() -> bool {
    true
}

/// `[scoring]` section: confidence scorer weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Subtracted once per missing required field.
    #[serde(default = "default_missing_penalty")]
    pub missing_required_penalty: f64,

    /// Bonus per repeated item beyond the first.
    #[serde(default = "default_repetition_bonus")]
    pub repetition_bonus_per_item: f64,

    /// Cap on the total repetition bonus.
    #[serde(default = "default_max_repetition_bonus")]
    pub max_repetition_bonus: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            missing_required_penalty: default_missing_penalty(),
            repetition_bonus_per_item: default_repetition_bonus(),
            max_repetition_bonus: default_max_repetition_bonus(),
        }
    }
}

fn default_missing_penalty() -> f64 {
    0.6
}
fn default_repetition_bonus() -> f64 {
    0.02
}
fn default_max_repetition_bonus() -> f64 {
    0.1
}

/// `[patterns]` section: pattern reuse policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Patterns below this confidence are never offered for reuse.
    #[serde(default = "default_min_reuse_confidence")]
    pub min_reuse_confidence: f64,

    /// How many candidates `retrieve` returns.
    #[serde(default = "default_retrieve_k")]
    pub retrieve_k: usize,

    /// Dimension of the built-in fingerprint embedding.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_reuse_confidence: default_min_reuse_confidence(),
            retrieve_k: default_retrieve_k(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

fn default_min_reuse_confidence() -> f64 {
    0.5
}
fn default_retrieve_k() -> usize {
    5
}
fn default_embedding_dim() -> usize {
    64
}

/// `[executor]` section: concurrency and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries after the first attempt, for transient failures only.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Apply ±25% random jitter to backoff delays.
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Batch inputs are processed in chunks of this size.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Per-attempt fetch timeout.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: true,
            chunk_size: default_chunk_size(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_max_concurrency() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    60_000
}
fn default_chunk_size() -> usize {
    100
}
fn default_fetch_timeout() -> u64 {
    30
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// A job fails once it has accumulated more errors than this.
    #[serde(default = "default_error_budget")]
    pub error_budget: usize,

    /// Records per `batch_upsert` call.
    #[serde(default = "default_chunk_size")]
    pub store_batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            error_budget: default_error_budget(),
            store_batch_size: default_chunk_size(),
        }
    }
}

fn default_error_budget() -> usize {
    10
}

/// `[agents]` section: multi-agent escalation for complex jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// A worker busy longer than this is force-reset.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,

    /// Pages handed to the explorer and analyst.
    #[serde(default = "default_sample_pages")]
    pub sample_pages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            worker_timeout_secs: default_worker_timeout(),
            sample_pages: default_sample_pages(),
        }
    }
}

fn default_worker_timeout() -> u64 {
    30
}
fn default_sample_pages() -> usize {
    5
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPolicyConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Minimum ms between two requests to the same host.
    #[serde(default)]
    pub rate_limit_ms: u64,

    /// Rendering service accepting `POST {"url": ...}` and returning HTML.
    /// Job credentials travel in the payload for the service to replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_endpoint: Option<String>,

    /// Permit loopback and private-network hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for FetchPolicyConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            rate_limit_ms: 0,
            render_endpoint: None,
            allow_private_hosts: false,
        }
    }
}

fn default_user_agent() -> String {
    concat!("adaptcrawl/", env!("CARGO_PKG_VERSION")).into()
}

/// `[semantic]` section: optional external semantic extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    /// Extraction endpoint; the semantic strategy is disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            model: None,
        }
    }
}

fn default_api_key_env() -> String {
    "ADAPTCRAWL_SEMANTIC_API_KEY".into()
}

/// `[notify]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// POST job summaries here; log-only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.adaptcrawl/adaptcrawl.db".into()
}

impl StorageConfig {
    /// Database path with a leading `~` expanded to the home directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.database_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| AdaptError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.database_path)),
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch config (runtime, merged from config sections)
// ---------------------------------------------------------------------------

/// Runtime fetcher configuration, merged from `[fetch]` and `[executor]`.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub rate_limit_ms: u64,
    pub render_endpoint: Option<String>,
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.fetch.user_agent.clone(),
            timeout_secs: config.executor.fetch_timeout_secs,
            rate_limit_ms: config.fetch.rate_limit_ms,
            render_endpoint: config.fetch.render_endpoint.clone(),
            allow_private_hosts: config.fetch.allow_private_hosts,
        }
    }
}

// ---------------------------------------------------------------------------
// Job config
// ---------------------------------------------------------------------------

/// Credentials section of a job file. Secrets are read from env vars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_password_env: Option<String>,
}

impl CredentialsConfig {
    /// Resolve env-var references into concrete credentials.
    pub fn resolve(&self) -> Result<Option<Credentials>> {
        if let Some(var) = &self.bearer_token_env {
            let token = std::env::var(var)
                .map_err(|_| AdaptError::config(format!("bearer token env var {var} is not set")))?;
            return Ok(Some(Credentials::Bearer(token)));
        }
        if let Some(username) = &self.basic_username {
            let password = match &self.basic_password_env {
                Some(var) => std::env::var(var).map_err(|_| {
                    AdaptError::config(format!("password env var {var} is not set"))
                })?,
                None => String::new(),
            };
            return Ok(Some(Credentials::Basic {
                username: username.clone(),
                password,
            }));
        }
        Ok(None)
    }
}

/// One crawl job: what to fetch and what to extract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    pub urls: Vec<String>,

    /// Overrides the fingerprint derived from the first URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    pub schema: FieldSchema,

    /// Hand-written selectors tried when no learned pattern exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<SelectorSpec>,

    /// Run the multi-agent explore/optimize/validate passes.
    #[serde(default)]
    pub complex: bool,

    /// Fetch through the rendering service during Crawl.
    #[serde(default)]
    pub render: bool,

    /// Per-job override of `[ladder] accept_threshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_threshold: Option<f64>,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl JobConfig {
    /// Load a job description from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AdaptError::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| AdaptError::config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Check the job is runnable. Errors here are fatal before any fetch.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AdaptError::config("job name must not be empty"));
        }
        if self.urls.is_empty() {
            return Err(AdaptError::config("job has no urls"));
        }
        for raw in &self.urls {
            let url = Url::parse(raw)
                .map_err(|e| AdaptError::config(format!("invalid url '{raw}': {e}")))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(AdaptError::config(format!(
                    "unsupported scheme in '{raw}'"
                )));
            }
        }
        if self.schema.is_empty() {
            return Err(AdaptError::config("schema declares no fields"));
        }
        let mut seen = HashSet::new();
        for field in &self.schema.fields {
            if field.name.trim().is_empty() {
                return Err(AdaptError::config("schema field with empty name"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(AdaptError::config(format!(
                    "duplicate schema field '{}'",
                    field.name
                )));
            }
        }
        if self.schema.required().next().is_none() {
            return Err(AdaptError::config("schema needs at least one required field"));
        }
        if let Some(spec) = &self.selectors {
            for locator in &spec.fields {
                if self.schema.get(&locator.field).is_none() {
                    return Err(AdaptError::config(format!(
                        "selector for unknown field '{}'",
                        locator.field
                    )));
                }
            }
        }
        if let Some(t) = self.accept_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(AdaptError::config(format!(
                    "accept_threshold {t} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Validate threshold values of an application config.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let unit = [
        ("ladder.accept_threshold", config.ladder.accept_threshold),
        ("patterns.min_reuse_confidence", config.patterns.min_reuse_confidence),
        ("scoring.missing_required_penalty", config.scoring.missing_required_penalty),
        ("scoring.max_repetition_bonus", config.scoring.max_repetition_bonus),
    ];
    for (name, value) in unit {
        if !(0.0..=1.0).contains(&value) {
            return Err(AdaptError::config(format!("{name} = {value} is outside [0, 1]")));
        }
    }
    if config.executor.max_concurrency == 0 {
        return Err(AdaptError::config("executor.max_concurrency must be at least 1"));
    }
    if config.executor.chunk_size == 0 || config.orchestrator.store_batch_size == 0 {
        return Err(AdaptError::config("batch sizes must be at least 1"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.adaptcrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| AdaptError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.adaptcrawl/adaptcrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AdaptError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| AdaptError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AdaptError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| AdaptError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AdaptError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldKind, FieldLocator, FieldSpec};

    fn job() -> JobConfig {
        JobConfig {
            name: "site-a".into(),
            urls: vec!["https://site-a.example/list".into()],
            fingerprint: None,
            schema: FieldSchema::new(vec![
                FieldSpec::required("title", FieldKind::Text),
                FieldSpec::optional("date", FieldKind::Date),
            ]),
            selectors: None,
            complex: false,
            render: false,
            accept_threshold: None,
            credentials: CredentialsConfig::default(),
        }
    }

    #[test]
    fn default_config_serializes() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(toml_str.contains("accept_threshold"));
        assert!(toml_str.contains("ADAPTCRAWL_SEMANTIC_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.orchestrator.error_budget, 10);
        assert_eq!(parsed.executor.max_concurrency, 5);
        assert!((parsed.ladder.accept_threshold - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[ladder]
accept_threshold = 0.8

[executor]
max_retries = 1
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!((config.ladder.accept_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.ladder.strategy_timeout_secs, 30);
        assert_eq!(config.executor.max_retries, 1);
        assert_eq!(config.executor.base_delay_ms, 1_000);
        assert!((config.patterns.min_reuse_confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut config = AppConfig::default();
        config.ladder.accept_threshold = 1.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("ladder.accept_threshold"));
    }

    #[test]
    fn fetch_config_from_app_config() {
        let mut app = AppConfig::default();
        app.fetch.rate_limit_ms = 250;
        let fetch = FetchConfig::from(&app);
        assert_eq!(fetch.rate_limit_ms, 250);
        assert_eq!(fetch.timeout_secs, 30);
        assert!(fetch.user_agent.starts_with("adaptcrawl/"));
    }

    #[test]
    fn job_file_parses() {
        let toml_str = r#"
name = "site-a"
urls = ["https://site-a.example/list?page=1"]
fingerprint = "site-A/list"

[[schema]]
name = "title"
kind = "text"
required = true

[[schema]]
name = "date"
kind = "date"
required = true

[selectors]
item = "li.post"

[[selectors.fields]]
field = "title"
selector = "h2"
"#;
        let job: JobConfig = toml::from_str(toml_str).expect("parse job");
        assert_eq!(job.schema.fields.len(), 2);
        assert_eq!(job.schema.fields[1].kind, FieldKind::Date);
        assert_eq!(
            job.selectors.as_ref().and_then(|s| s.item.as_deref()),
            Some("li.post")
        );
        job.validate().expect("valid job");
    }

    #[test]
    fn job_validation_errors() {
        let mut no_urls = job();
        no_urls.urls.clear();
        assert!(matches!(no_urls.validate(), Err(AdaptError::Config { .. })));

        let mut bad_url = job();
        bad_url.urls = vec!["not a url".into()];
        assert!(bad_url.validate().is_err());

        let mut dup = job();
        dup.schema.fields.push(FieldSpec::optional("title", FieldKind::Text));
        assert!(dup.validate().unwrap_err().to_string().contains("duplicate"));

        let mut none_required = job();
        none_required.schema.fields[0].required = false;
        assert!(none_required.validate().is_err());

        let mut unknown = job();
        unknown.selectors = Some(SelectorSpec {
            item: None,
            fields: vec![FieldLocator {
                field: "author".into(),
                selector: ".by".into(),
                attr: None,
            }],
        });
        assert!(unknown.validate().unwrap_err().to_string().contains("author"));
    }

    #[test]
    fn missing_credential_env_is_config_error() {
        let creds = CredentialsConfig {
            bearer_token_env: Some("ADAPTCRAWL_TEST_NONEXISTENT_TOKEN_9876".into()),
            ..Default::default()
        };
        assert!(creds.resolve().is_err());
        assert!(CredentialsConfig::default().resolve().expect("none").is_none());
    }

    #[test]
    fn demo_jobs_validate() {
        for (name, raw) in [
            ("site-a-list", include_str!("../../../../demos/site-a-list.toml")),
            ("shop-complex", include_str!("../../../../demos/shop-complex.toml")),
        ] {
            let job: JobConfig = toml::from_str(raw).expect(name);
            job.validate().expect(name);
        }
    }
}
