use super::{fmt_ts, parse_enum, parse_ts, verifications};
use crate::model::{Artifact, BackupJob, BackupKind, Manifest, SourceKind, Status};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// A job together with the artifact it left on disk.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub job: BackupJob,
    pub artifact: Artifact,
    pub manifest_path: Option<String>,
}

/// A final artifact counts as valid while its job did not fail, it has not
/// been purged, and its most recent verification round holds no FAIL.
const VALID_FINAL: &str = "
    j.status != 'FAIL'
    AND NOT EXISTS (SELECT 1 FROM purges p WHERE p.artifact_id = a.id)
    AND NOT EXISTS (
        SELECT 1 FROM verifications v
        WHERE v.artifact_id = a.id AND v.outcome = 'FAIL'
          AND v.round_id = (
              SELECT v2.round_id FROM verifications v2
              WHERE v2.artifact_id = a.id ORDER BY v2.id DESC LIMIT 1))";

const ENTRY_COLUMNS: &str = "
    j.id, j.batch_id, j.environment, j.component, j.host, j.kind, j.encrypt, j.since,
    j.started_at, j.ended_at, j.status, j.error, j.manifest_path,
    a.id AS a_id, a.locator, a.source_kind, a.stage, a.checksum, a.size, a.encrypted,
    a.entity_count, a.created_at, a.parent_id";

fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    let since: Option<String> = row.get("since")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    Ok(BackupJob {
        id: row.get("id")?,
        batch_id: row.get("batch_id")?,
        environment: row.get("environment")?,
        component: parse_enum::<SourceKind>(&row.get::<_, String>("component")?)?,
        host: row.get("host")?,
        kind: parse_enum::<BackupKind>(&row.get::<_, String>("kind")?)?,
        encrypt: row.get::<_, i64>("encrypt")? != 0,
        since: since.as_deref().map(parse_ts).transpose()?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        status: parse_enum::<Status>(&row.get::<_, String>("status")?)?,
        error: row.get("error")?,
    })
}

fn row_to_artifact(row: &Row, id_column: &str) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get(id_column)?,
        locator: row.get::<_, String>("locator")?.into(),
        source_kind: parse_enum(&row.get::<_, String>("source_kind")?)?,
        stage: parse_enum(&row.get::<_, String>("stage")?)?,
        checksum: row.get("checksum")?,
        size: row.get::<_, i64>("size")? as u64,
        encrypted: row.get::<_, i64>("encrypted")? != 0,
        entity_count: row.get::<_, i64>("entity_count")? as u64,
        created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
        parent_id: row.get("parent_id")?,
    })
}

fn row_to_entry(row: &Row) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        job: row_to_job(row)?,
        artifact: row_to_artifact(row, "a_id")?,
        manifest_path: row.get("manifest_path")?,
    })
}

/// Insert a finished job with its lineage and first verification round.
pub fn record_manifest(conn: &mut Connection, manifest: &Manifest, manifest_path: Option<&str>) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    let job = &manifest.job;
    tx.execute(
        "INSERT INTO jobs (id, batch_id, environment, component, host, kind, encrypt, since,
                           started_at, ended_at, status, error, notes, manifest_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            job.id,
            job.batch_id,
            job.environment,
            job.component.as_str(),
            job.host,
            job.kind.as_str(),
            job.encrypt as i64,
            job.since.map(fmt_ts),
            fmt_ts(job.started_at),
            job.ended_at.map(fmt_ts),
            manifest.status.as_str(),
            job.error,
            serde_json::to_string(&manifest.notes)?,
            manifest_path,
        ],
    )?;

    let last = manifest.artifacts.len().saturating_sub(1);
    for (position, artifact) in manifest.artifacts.iter().enumerate() {
        tx.execute(
            "INSERT INTO artifacts (id, job_id, position, is_final, locator, source_kind, stage, checksum,
                                    size, encrypted, entity_count, created_at, parent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                artifact.id,
                job.id,
                position as i64,
                (position == last) as i64,
                artifact.locator.to_string_lossy(),
                artifact.source_kind.as_str(),
                artifact.stage.as_str(),
                artifact.checksum,
                artifact.size as i64,
                artifact.encrypted as i64,
                artifact.entity_count as i64,
                fmt_ts(artifact.created_at),
                artifact.parent_id,
            ],
        )?;
    }

    verifications::insert_round(&tx, &job.id, &manifest.verifications)?;
    tx.commit()?;
    Ok(())
}

pub fn find_job(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupJob>> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
        .optional()?;
    Ok(job)
}

/// Rebuild a job's manifest from catalog rows, including re-verifications.
pub fn load_manifest(conn: &Connection, job_id: &str) -> anyhow::Result<Option<Manifest>> {
    let Some(job) = find_job(conn, job_id)? else {
        return Ok(None);
    };
    let (status, notes): (String, String) = conn.query_row(
        "SELECT status, notes FROM jobs WHERE id = ?1",
        params![job_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare("SELECT * FROM artifacts WHERE job_id = ?1 ORDER BY position")?;
    let artifacts = stmt
        .query_map(params![job_id], |row| row_to_artifact(row, "id"))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut verifications = Vec::new();
    for artifact in &artifacts {
        verifications.extend(verifications::for_artifact(conn, &artifact.id)?);
    }

    Ok(Some(Manifest {
        version: Manifest::VERSION,
        job,
        artifacts,
        verifications,
        notes: serde_json::from_str(&notes)?,
        status: status.parse().map_err(anyhow::Error::msg)?,
    }))
}

/// The final artifact of one job, whatever its validity.
pub fn find_entry(conn: &Connection, job_id: &str) -> anyhow::Result<Option<CatalogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM jobs j JOIN artifacts a ON a.job_id = j.id AND a.is_final = 1
         WHERE j.id = ?1"
    );
    Ok(conn.query_row(&sql, params![job_id], row_to_entry).optional()?)
}

pub fn recent_jobs(conn: &Connection, component: Option<SourceKind>, limit: usize) -> anyhow::Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE (?1 IS NULL OR component = ?1) ORDER BY started_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![component.map(|c| c.as_str()), limit as i64], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent valid full backup of one target.
pub fn latest_valid_full(conn: &Connection, host: &str, component: SourceKind) -> anyhow::Result<Option<CatalogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM jobs j JOIN artifacts a ON a.job_id = j.id AND a.is_final = 1
         WHERE j.kind = 'full' AND j.host = ?1 AND j.component = ?2 AND {VALID_FINAL}
         ORDER BY j.started_at DESC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![host, component.as_str()], row_to_entry)
        .optional()?)
}

/// Most recent valid full backup across the environment.
pub fn newest_valid_full(conn: &Connection) -> anyhow::Result<Option<CatalogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM jobs j JOIN artifacts a ON a.job_id = j.id AND a.is_final = 1
         WHERE j.kind = 'full' AND {VALID_FINAL}
         ORDER BY j.started_at DESC LIMIT 1"
    );
    Ok(conn.query_row(&sql, [], row_to_entry).optional()?)
}

/// Every final artifact that has not been purged, oldest first.
pub fn live_final_artifacts(conn: &Connection) -> anyhow::Result<Vec<CatalogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM jobs j JOIN artifacts a ON a.job_id = j.id AND a.is_final = 1
         WHERE NOT EXISTS (SELECT 1 FROM purges p WHERE p.artifact_id = a.id)
         ORDER BY j.started_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The newest unpurged final artifact of each (host, component) target.
pub fn latest_per_target(conn: &Connection, component: Option<SourceKind>) -> anyhow::Result<Vec<CatalogEntry>> {
    let sql = format!(
        "SELECT * FROM (
            SELECT {ENTRY_COLUMNS},
                   ROW_NUMBER() OVER (PARTITION BY j.host, j.component ORDER BY j.started_at DESC) AS rn
            FROM jobs j JOIN artifacts a ON a.job_id = j.id AND a.is_final = 1
            WHERE NOT EXISTS (SELECT 1 FROM purges p WHERE p.artifact_id = a.id)
              AND (?1 IS NULL OR j.component = ?1)
         ) WHERE rn = 1 ORDER BY component, host"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![component.map(|c| c.as_str())], row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Whether the given final artifact is still a valid backup.
pub fn is_valid(conn: &Connection, artifact_id: &str) -> anyhow::Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM jobs j JOIN artifacts a ON a.job_id = j.id
         WHERE a.id = ?1 AND a.is_final = 1 AND {VALID_FINAL}"
    );
    let n: i64 = conn.query_row(&sql, params![artifact_id], |row| row.get(0))?;
    Ok(n > 0)
}

/// Reference time for change-filtered runs: the start of the target's most
/// recent valid full backup.
pub fn last_full_started_at(
    conn: &Connection,
    host: &str,
    component: SourceKind,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    Ok(latest_valid_full(conn, host, component)?.map(|e| e.job.started_at))
}
