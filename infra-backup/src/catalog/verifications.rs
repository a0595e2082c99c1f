use super::{fmt_ts, parse_enum, parse_ts};
use crate::model::VerificationResult;
use rusqlite::{params, Connection, Row};

fn row_to_result(row: &Row) -> rusqlite::Result<VerificationResult> {
    Ok(VerificationResult {
        artifact_id: row.get("artifact_id")?,
        check: parse_enum(&row.get::<_, String>("check_class")?)?,
        outcome: parse_enum(&row.get::<_, String>("outcome")?)?,
        detail: row.get("detail")?,
        checked_at: parse_ts(&row.get::<_, String>("checked_at")?)?,
    })
}

/// Append one verification round. Earlier rounds stay untouched.
pub fn insert_round(conn: &Connection, round_id: &str, results: &[VerificationResult]) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO verifications (round_id, artifact_id, check_class, outcome, detail, checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for result in results {
        stmt.execute(params![
            round_id,
            result.artifact_id,
            result.check.as_str(),
            result.outcome.as_str(),
            result.detail,
            fmt_ts(result.checked_at),
        ])?;
    }
    Ok(())
}

/// All results for an artifact, oldest round first.
pub fn for_artifact(conn: &Connection, artifact_id: &str) -> anyhow::Result<Vec<VerificationResult>> {
    let mut stmt = conn.prepare("SELECT * FROM verifications WHERE artifact_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![artifact_id], row_to_result)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Results of the most recent round for an artifact.
pub fn latest_round(conn: &Connection, artifact_id: &str) -> anyhow::Result<Vec<VerificationResult>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM verifications WHERE artifact_id = ?1 AND round_id = (
             SELECT round_id FROM verifications WHERE artifact_id = ?1 ORDER BY id DESC LIMIT 1)
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![artifact_id], row_to_result)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
