use super::{fmt_ts, parse_enum, parse_ts};
use crate::dr::state::{DrState, Operation};
use crate::model::Status;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// One recorded state change. The latest row is the current DR state.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub run_id: String,
    pub operation: Operation,
    pub from: DrState,
    pub to: DrState,
    pub outcome: Status,
    pub detail: String,
    /// Set when the run proceeded despite a failed readiness gate
    pub forced: bool,
    /// Site serving public traffic once this transition completed
    pub active_site: String,
    pub at: DateTime<Utc>,
}

fn row_to_transition(row: &Row) -> rusqlite::Result<TransitionRecord> {
    Ok(TransitionRecord {
        run_id: row.get("run_id")?,
        operation: parse_enum(&row.get::<_, String>("operation")?)?,
        from: parse_enum(&row.get::<_, String>("from_state")?)?,
        to: parse_enum(&row.get::<_, String>("to_state")?)?,
        outcome: parse_enum(&row.get::<_, String>("outcome")?)?,
        detail: row.get("detail")?,
        forced: row.get::<_, i64>("forced")? != 0,
        active_site: row.get("active_site")?,
        at: parse_ts(&row.get::<_, String>("at")?)?,
    })
}

pub fn insert_transition(conn: &Connection, t: &TransitionRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO dr_transitions (run_id, operation, from_state, to_state, outcome, detail, forced, active_site, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            t.run_id,
            t.operation.as_str(),
            t.from.as_str(),
            t.to.as_str(),
            t.outcome.as_str(),
            t.detail,
            t.forced as i64,
            t.active_site,
            fmt_ts(t.at),
        ],
    )?;
    Ok(())
}

pub fn last_transition(conn: &Connection) -> anyhow::Result<Option<TransitionRecord>> {
    let t = conn
        .query_row(
            "SELECT * FROM dr_transitions ORDER BY id DESC LIMIT 1",
            [],
            row_to_transition,
        )
        .optional()?;
    Ok(t)
}

/// Most recent transitions, newest first.
pub fn recent_transitions(conn: &Connection, limit: usize) -> anyhow::Result<Vec<TransitionRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM dr_transitions ORDER BY id DESC LIMIT ?1")?;
    let rows = stmt
        .query_map(params![limit as i64], row_to_transition)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn insert_readiness(
    conn: &Connection,
    run_id: Option<&str>,
    status: Status,
    report_json: &str,
    at: DateTime<Utc>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO dr_readiness (run_id, status, report, at) VALUES (?1, ?2, ?3, ?4)",
        params![run_id, status.as_str(), report_json, fmt_ts(at)],
    )?;
    Ok(())
}

/// Latest readiness snapshot: status, JSON report and time.
pub fn latest_readiness(conn: &Connection) -> anyhow::Result<Option<(Status, String, DateTime<Utc>)>> {
    let row = conn
        .query_row(
            "SELECT status, report, at FROM dr_readiness ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    parse_enum::<Status>(&row.get::<_, String>(0)?)?,
                    row.get::<_, String>(1)?,
                    parse_ts(&row.get::<_, String>(2)?)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}
