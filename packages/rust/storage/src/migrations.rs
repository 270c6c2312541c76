//! SQL migration definitions for the adaptcrawl database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: records, patterns, jobs",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Extracted records, deduplicated by content fingerprint
CREATE TABLE IF NOT EXISTS records (
    content_hash   TEXT PRIMARY KEY,
    job_id         TEXT NOT NULL,
    source_url     TEXT NOT NULL,
    fields_json    TEXT NOT NULL,
    confidence     REAL NOT NULL,
    strategy       TEXT NOT NULL,
    low_confidence INTEGER NOT NULL DEFAULT 0,
    extracted_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_job_id ON records(job_id);

-- Learned extraction patterns; confidence is derived from the counters
CREATE TABLE IF NOT EXISTS patterns (
    id            TEXT PRIMARY KEY,
    fingerprint   TEXT NOT NULL,
    selector_json TEXT NOT NULL,
    success_count INTEGER NOT NULL,
    use_count     INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    superseded_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_patterns_fingerprint ON patterns(fingerprint);

-- Archived terminal job states
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    phase        TEXT NOT NULL,
    summary_json TEXT NOT NULL,
    errors_json  TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
