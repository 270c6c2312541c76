//! libSQL storage layer for records, learned patterns, and job history.
//!
//! The [`Storage`] struct wraps a local libSQL database and implements the
//! [`RecordStore`], [`PatternRepository`], and [`JobArchive`] capabilities.
//!
//! **Access rules:**
//! - concurrent readers are allowed
//! - writers are serialized through an async write lock, so a record key or
//!   pattern row only ever sees one writer at a time
//! - [`Storage::open_readonly`] handles reject every write

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use tokio::sync::Mutex;

use adaptcrawl_shared::{
    AdaptError, Item, JobArchive, JobId, JobState, JobSummary, Pattern, PatternId,
    PatternRepository, Record, RecordStore, Result, SelectorSpec, StrategyKind,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

fn db_err(e: libsql::Error) -> AdaptError {
    AdaptError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AdaptError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (inspection commands).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    AdaptError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(AdaptError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------------

    /// Insert records in one transaction, skipping known content hashes.
    /// Returns the number of rows actually inserted.
    pub async fn insert_records(&self, records: &[Record]) -> Result<usize> {
        self.check_writable()?;
        if records.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let mut inserted = 0usize;

        for record in records {
            let fields_json = serde_json::to_string(&record.fields)
                .map_err(|e| AdaptError::Storage(format!("encode fields: {e}")))?;
            let changed = tx
                .execute(
                    "INSERT INTO records (content_hash, job_id, source_url, fields_json, confidence,
                                          strategy, low_confidence, extracted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(content_hash) DO NOTHING",
                    params![
                        record.content_hash.as_str(),
                        record.job_id.to_string(),
                        record.source_url.as_str(),
                        fields_json,
                        record.confidence,
                        record.strategy.as_str(),
                        i64::from(record.low_confidence),
                        record.extracted_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(db_err)?;
            inserted += changed as usize;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(offered = records.len(), inserted, "records stored");
        Ok(inserted)
    }

    /// Whether a record with this content hash is stored.
    pub async fn record_exists(&self, content_hash: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM records WHERE content_hash = ?1 LIMIT 1",
                params![content_hash],
            )
            .await
            .map_err(db_err)?;
        Ok(matches!(rows.next().await, Ok(Some(_))))
    }

    /// List records, newest first, optionally restricted to one job.
    pub async fn list_records(&self, job_id: Option<&JobId>, limit: usize) -> Result<Vec<Record>> {
        let mut rows = match job_id {
            Some(id) => self
                .conn
                .query(
                    "SELECT content_hash, job_id, source_url, fields_json, confidence, strategy,
                            low_confidence, extracted_at
                     FROM records WHERE job_id = ?1 ORDER BY extracted_at DESC LIMIT ?2",
                    params![id.to_string(), limit as i64],
                )
                .await
                .map_err(db_err)?,
            None => self
                .conn
                .query(
                    "SELECT content_hash, job_id, source_url, fields_json, confidence, strategy,
                            low_confidence, extracted_at
                     FROM records ORDER BY extracted_at DESC LIMIT ?1",
                    params![limit as i64],
                )
                .await
                .map_err(db_err)?,
        };

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Total stored records.
    pub async fn count_records(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM records", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)? as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Pattern operations
    // -----------------------------------------------------------------------

    /// Insert or update a pattern row by id.
    pub async fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        self.check_writable()?;
        let selector_json = serde_json::to_string(&pattern.selector_spec)
            .map_err(|e| AdaptError::Storage(format!("encode selector spec: {e}")))?;

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO patterns (id, fingerprint, selector_json, success_count, use_count,
                                       created_at, updated_at, superseded_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   selector_json = excluded.selector_json,
                   success_count = excluded.success_count,
                   use_count = excluded.use_count,
                   updated_at = excluded.updated_at,
                   superseded_by = excluded.superseded_by",
                params![
                    pattern.id.to_string(),
                    pattern.fingerprint.as_str(),
                    selector_json,
                    pattern.success_count() as i64,
                    pattern.use_count() as i64,
                    pattern.created_at.to_rfc3339(),
                    pattern.updated_at.to_rfc3339(),
                    pattern.superseded_by.map(|id| id.to_string()),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All stored patterns, ordered by fingerprint then age.
    pub async fn list_patterns(&self) -> Result<Vec<Pattern>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, fingerprint, selector_json, success_count, use_count,
                        created_at, updated_at, superseded_by
                 FROM patterns ORDER BY fingerprint, created_at",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_pattern(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Job history
    // -----------------------------------------------------------------------

    /// Store the final snapshot of a job, replacing any earlier one.
    pub async fn save_job(&self, state: &JobState) -> Result<()> {
        self.check_writable()?;
        let summary = state.summary();
        let summary_json = serde_json::to_string(&summary)
            .map_err(|e| AdaptError::Storage(format!("encode job summary: {e}")))?;
        let errors_json = serde_json::to_string(&state.errors)
            .map_err(|e| AdaptError::Storage(format!("encode job errors: {e}")))?;

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO jobs (id, name, fingerprint, phase, summary_json,
                                              errors_json, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    state.job_id.to_string(),
                    state.name.as_str(),
                    state.fingerprint.as_str(),
                    state.phase.as_str(),
                    summary_json,
                    errors_json,
                    state.started_at.to_rfc3339(),
                    state.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent archived jobs.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT summary_json FROM jobs ORDER BY started_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json = row.get::<String>(0).map_err(db_err)?;
            let summary: JobSummary = serde_json::from_str(&json)
                .map_err(|e| AdaptError::Storage(format!("decode job summary: {e}")))?;
            results.push(summary);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Capability impls
// ---------------------------------------------------------------------------

#[async_trait]
impl RecordStore for Storage {
    async fn exists(&self, content_hash: &str) -> Result<bool> {
        self.record_exists(content_hash).await
    }

    async fn batch_upsert(&self, records: &[Record]) -> Result<usize> {
        self.insert_records(records).await
    }
}

#[async_trait]
impl PatternRepository for Storage {
    async fn save_pattern(&self, pattern: &Pattern) -> Result<()> {
        self.upsert_pattern(pattern).await
    }

    async fn load_patterns(&self) -> Result<Vec<Pattern>> {
        self.list_patterns().await
    }
}

#[async_trait]
impl JobArchive for Storage {
    async fn archive_job(&self, state: &JobState) -> Result<()> {
        self.save_job(state).await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AdaptError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn parse_uuid<T: std::str::FromStr>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| AdaptError::Storage(format!("bad id '{raw}'")))
}

fn row_to_record(row: &Row) -> Result<Record> {
    let fields_json = row.get::<String>(3).map_err(db_err)?;
    let fields: Item = serde_json::from_str(&fields_json)
        .map_err(|e| AdaptError::Storage(format!("decode fields: {e}")))?;
    let strategy: StrategyKind = row.get::<String>(5).map_err(db_err)?.parse()?;

    Ok(Record {
        content_hash: row.get::<String>(0).map_err(db_err)?,
        job_id: parse_uuid(&row.get::<String>(1).map_err(db_err)?)?,
        source_url: row.get::<String>(2).map_err(db_err)?,
        fields,
        confidence: row.get::<f64>(4).map_err(db_err)?,
        strategy,
        low_confidence: row.get::<i64>(6).map_err(db_err)? != 0,
        extracted_at: parse_time(&row.get::<String>(7).map_err(db_err)?)?,
    })
}

fn row_to_pattern(row: &Row) -> Result<Pattern> {
    let selector_json = row.get::<String>(2).map_err(db_err)?;
    let selector_spec: SelectorSpec = serde_json::from_str(&selector_json)
        .map_err(|e| AdaptError::Storage(format!("decode selector spec: {e}")))?;
    let superseded_by: Option<PatternId> = match row.get::<String>(7).ok() {
        Some(raw) => Some(parse_uuid(&raw)?),
        None => None,
    };

    Ok(Pattern::restore(
        parse_uuid(&row.get::<String>(0).map_err(db_err)?)?,
        row.get::<String>(1).map_err(db_err)?,
        selector_spec,
        row.get::<i64>(3).map_err(db_err)?.max(0) as u64,
        row.get::<i64>(4).map_err(db_err)?.max(0) as u64,
        parse_time(&row.get::<String>(5).map_err(db_err)?)?,
        parse_time(&row.get::<String>(6).map_err(db_err)?)?,
        superseded_by,
    ))
}
