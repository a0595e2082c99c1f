use super::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  id TEXT PRIMARY KEY,
  batch_id TEXT NOT NULL,
  environment TEXT NOT NULL,
  component TEXT NOT NULL,
  host TEXT NOT NULL,
  kind TEXT NOT NULL CHECK(kind IN ('full','incremental','differential')),
  encrypt INTEGER NOT NULL DEFAULT 0,
  since TEXT,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK(status IN ('PASS','WARNING','FAIL')),
  error TEXT,
  notes TEXT NOT NULL DEFAULT '[]',
  manifest_path TEXT
);

CREATE TABLE IF NOT EXISTS artifacts (
  id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL REFERENCES jobs(id),
  position INTEGER NOT NULL,
  is_final INTEGER NOT NULL DEFAULT 0,
  locator TEXT NOT NULL,
  source_kind TEXT NOT NULL,
  stage TEXT NOT NULL CHECK(stage IN ('raw','compressed','encrypted')),
  checksum TEXT NOT NULL,
  size INTEGER NOT NULL,
  encrypted INTEGER NOT NULL DEFAULT 0,
  entity_count INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  parent_id TEXT REFERENCES artifacts(id)
);

CREATE TABLE IF NOT EXISTS verifications (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  round_id TEXT NOT NULL,
  artifact_id TEXT NOT NULL REFERENCES artifacts(id),
  check_class TEXT NOT NULL CHECK(check_class IN ('structural','decrypt','restore-test')),
  outcome TEXT NOT NULL CHECK(outcome IN ('PASS','WARNING','FAIL')),
  detail TEXT NOT NULL DEFAULT '',
  checked_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS purges (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  artifact_id TEXT NOT NULL REFERENCES artifacts(id),
  locator TEXT NOT NULL,
  reason TEXT NOT NULL,
  purged_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dr_transitions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  operation TEXT NOT NULL,
  from_state TEXT NOT NULL,
  to_state TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK(outcome IN ('PASS','WARNING','FAIL')),
  detail TEXT NOT NULL DEFAULT '',
  forced INTEGER NOT NULL DEFAULT 0,
  active_site TEXT NOT NULL,
  at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dr_readiness (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT,
  status TEXT NOT NULL CHECK(status IN ('PASS','WARNING','FAIL')),
  report TEXT NOT NULL,
  at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS leases (
  scope TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  acquired_at TEXT NOT NULL,
  expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_target ON jobs(host, component, kind, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_artifacts_job_id ON artifacts(job_id);
CREATE INDEX IF NOT EXISTS idx_verifications_artifact_id ON verifications(artifact_id);
CREATE INDEX IF NOT EXISTS idx_purges_artifact_id ON purges(artifact_id);
"#;

/// Tables whose rows may only ever be inserted.
const APPEND_ONLY: &[&str] = &[
    "jobs",
    "artifacts",
    "verifications",
    "purges",
    "dr_transitions",
    "dr_readiness",
];

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::debug!("Migrating catalog schema");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    for table in APPEND_ONLY {
        conn.execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS {table}_no_update BEFORE UPDATE ON {table}
               BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END;
             CREATE TRIGGER IF NOT EXISTS {table}_no_delete BEFORE DELETE ON {table}
               BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END;"
        ))?;
    }

    // Columns added after the first schema version
    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("jobs", "manifest_path")? {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN manifest_path TEXT")?;
    }

    Ok(())
}
