use super::fmt_ts;
use chrono::Utc;
use rusqlite::{params, Connection};

/// Record that an artifact's file was removed.
pub fn record(conn: &Connection, artifact_id: &str, locator: &str, reason: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO purges (artifact_id, locator, reason, purged_at) VALUES (?1, ?2, ?3, ?4)",
        params![artifact_id, locator, reason, fmt_ts(Utc::now())],
    )?;
    Ok(())
}

pub fn is_purged(conn: &Connection, artifact_id: &str) -> anyhow::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM purges WHERE artifact_id = ?1",
        params![artifact_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
