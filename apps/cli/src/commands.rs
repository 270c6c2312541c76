//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::{info, warn};

use adaptcrawl_core::{
    Collaborators, HashedTrigramIndex, HttpSemanticExtractor, Orchestrator, PatternStore,
    notifier_from_config,
};
use adaptcrawl_crawler::HttpFetcher;
use adaptcrawl_shared::{
    AppConfig, FetchConfig, JobArchive, JobConfig, JobId, JobPhase, JobState, PatternRepository,
    SemanticExtractor, config_file_path, init_config, load_config, load_config_from,
    validate_config,
};
use adaptcrawl_storage::Storage;

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// adaptcrawl: structured extraction that learns each site's layout.
#[derive(Parser)]
#[command(
    name = "adaptcrawl",
    version,
    about = "Extract structured records from web pages, escalating strategies only when confidence is low.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.adaptcrawl/adaptcrawl.toml).
    #[arg(long, env = "ADAPTCRAWL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `[storage] database_path`.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a job file to completion.
    Run {
        /// Job description (TOML).
        #[arg(long)]
        job: PathBuf,

        /// Print the job summary as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Inspect learned extraction patterns.
    Patterns {
        #[command(subcommand)]
        action: PatternsAction,
    },

    /// Inspect archived jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Print stored records as JSON lines.
    Records {
        /// Only records extracted by this job.
        #[arg(long)]
        job: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum PatternsAction {
    /// List patterns with their confidence and usage.
    List {
        /// Include superseded patterns.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List the most recent jobs.
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "adaptcrawl=info",
        1 => "adaptcrawl=debug",
        _ => "adaptcrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    let db = cli.db.as_deref();
    match cli.command {
        Command::Run { job, json } => cmd_run(config_path, db, &job, json).await,
        Command::Patterns { action } => match action {
            PatternsAction::List { all } => cmd_patterns_list(config_path, db, all).await,
        },
        Command::Jobs { action } => match action {
            JobsAction::List { limit } => cmd_jobs_list(config_path, db, limit).await,
        },
        Command::Records { job, limit } => {
            cmd_records(config_path, db, job.as_deref(), limit).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    validate_config(&config)?;
    Ok(config)
}

fn database_path(config: &AppConfig, db: Option<&Path>) -> Result<PathBuf> {
    match db {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(config.storage.resolved_path()?),
    }
}

/// Open the database for inspection; a missing file is reported, not created.
async fn open_for_reading(config: &AppConfig, db: Option<&Path>) -> Result<Storage> {
    let path = database_path(config, db)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at '{}'. Run a job first or pass --db.",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, db: Option<&Path>, job_path: &Path, json: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let job = JobConfig::load(job_path)?;
    job.validate()?;

    let db_path = database_path(&config, db)?;
    let storage = Arc::new(Storage::open(&db_path).await?);

    let index = Arc::new(HashedTrigramIndex::new(config.patterns.embedding_dim));
    let repository: Arc<dyn PatternRepository> = storage.clone();
    let patterns = Arc::new(PatternStore::new(&config.patterns, index, Some(repository)));
    let loaded = patterns.load().await?;

    let fetcher = Arc::new(HttpFetcher::new(FetchConfig::from(&config))?);
    let strategy_timeout = Duration::from_secs(config.ladder.strategy_timeout_secs);
    let semantic = HttpSemanticExtractor::from_config(&config.semantic, strategy_timeout)?
        .map(|s| Arc::new(s) as Arc<dyn SemanticExtractor>);
    let notifier = notifier_from_config(
        &config.notify,
        Duration::from_secs(config.executor.fetch_timeout_secs),
    )?;
    let progress = Arc::new(CliProgress::new());

    info!(
        job = %job.name,
        urls = job.urls.len(),
        patterns = loaded,
        semantic = semantic.is_some(),
        db = %db_path.display(),
        "starting job"
    );

    let collaborators = Collaborators {
        fetcher,
        semantic,
        records: storage.clone(),
        notifier,
        archive: Some(storage.clone() as Arc<dyn JobArchive>),
        progress: progress.clone(),
    };
    let orchestrator = Arc::new(Orchestrator::new(config, patterns, collaborators));
    let job_id = orchestrator.submit_job(job).await?;

    let state = wait_for_job(&orchestrator, job_id).await;
    progress.clear();
    let state = state.ok_or_else(|| eyre!("job {job_id} disappeared from the registry"))?;

    print_job(&state, json)?;
    match state.phase {
        JobPhase::Done => Ok(()),
        _ => Err(eyre!(
            "job failed: {}",
            state.failure_reason.as_deref().unwrap_or("unknown reason")
        )),
    }
}

/// Poll until the job is finished, forwarding Ctrl-C as a cancellation.
async fn wait_for_job(orchestrator: &Orchestrator, job_id: JobId) -> Option<JobState> {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                warn!(%job_id, "interrupt received, cancelling job");
                orchestrator.cancel_job(job_id).await;
            }
            _ = ticker.tick() => {
                let state = orchestrator.get_status(job_id).await?;
                if state.finished_at.is_some() {
                    return Some(state);
                }
            }
        }
    }
}

fn print_job(state: &JobState, json: bool) -> Result<()> {
    let summary = state.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let elapsed = summary
        .finished_at
        .map(|end| (end - summary.started_at).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();

    println!();
    println!("  Job:         {} ({})", summary.name, summary.job_id);
    println!("  Fingerprint: {}", summary.fingerprint);
    println!("  Outcome:     {}", summary.phase);
    println!("  Pages:       {}", summary.pages_fetched);
    println!(
        "  Records:     {} accepted, {} new, {} low confidence",
        summary.accepted, summary.new_items, summary.low_confidence
    );
    println!("  Errors:      {}", summary.error_count);
    if let Some(reason) = &summary.failure_reason {
        println!("  Reason:      {reason}");
    }
    if let Some(tuning) = &state.tuning {
        for note in &tuning.notes {
            println!("  Note:        {note}");
        }
    }
    println!("  Time:        {elapsed:.1}s");
    println!();

    for error in &state.errors {
        match &error.url {
            Some(url) => println!("  [{}] {}: {}", error.phase, url, error.message),
            None => println!("  [{}] {}", error.phase, error.message),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

async fn cmd_patterns_list(config_path: Option<&Path>, db: Option<&Path>, all: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_for_reading(&config, db).await?;

    let mut patterns = storage.list_patterns().await?;
    if !all {
        patterns.retain(|p| p.is_live());
    }
    if patterns.is_empty() {
        println!("no patterns learned yet");
        return Ok(());
    }

    patterns.sort_by(|a, b| {
        a.fingerprint
            .cmp(&b.fingerprint)
            .then(b.confidence().total_cmp(&a.confidence()))
    });

    println!(
        "{:<40} {:>10} {:>6} {:>9}  {}",
        "FINGERPRINT", "CONFIDENCE", "USES", "SUCCESSES", "STATUS"
    );
    for pattern in &patterns {
        let status = match pattern.superseded_by {
            Some(by) => format!("superseded by {by}"),
            None => "live".to_string(),
        };
        println!(
            "{:<40} {:>10.3} {:>6} {:>9}  {}",
            pattern.fingerprint,
            pattern.confidence(),
            pattern.use_count(),
            pattern.success_count(),
            status
        );
    }
    Ok(())
}

async fn cmd_jobs_list(config_path: Option<&Path>, db: Option<&Path>, limit: usize) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_for_reading(&config, db).await?;

    let jobs = storage.list_jobs(limit).await?;
    if jobs.is_empty() {
        println!("no jobs recorded yet");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<7} {:>6} {:>8} {:>5} {:>6}  {}",
        "ID", "NAME", "PHASE", "PAGES", "ACCEPTED", "NEW", "ERRORS", "STARTED"
    );
    for job in &jobs {
        println!(
            "{:<36} {:<20} {:<7} {:>6} {:>8} {:>5} {:>6}  {}",
            job.job_id,
            job.name,
            job.phase,
            job.pages_fetched,
            job.accepted,
            job.new_items,
            job.error_count,
            job.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_records(
    config_path: Option<&Path>,
    db: Option<&Path>,
    job: Option<&str>,
    limit: usize,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_for_reading(&config, db).await?;

    let job_id = job
        .map(|raw| raw.parse::<JobId>())
        .transpose()
        .map_err(|e| eyre!("invalid job id: {e}"))?;

    let records = storage.list_records(job_id.as_ref(), limit).await?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    info!(shown = records.len(), total = storage.count_records().await?, "records listed");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let source = match config_path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    println!("# {}", source.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
