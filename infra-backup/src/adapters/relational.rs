//! PostgreSQL extraction.
//!
//! Full runs are a plain-format `pg_dump`. Change-filtered runs dump the
//! schema only and append one `COPY ... FROM stdin` block per table holding
//! the rows whose modification column is at or after the reference time, so
//! both kinds restore with `psql -f` into an empty database.

use super::{since_literal, ExtractRequest, RawExtract, SourceAdapter};
use crate::error::{BackupError, Result};
use crate::exec::{shell_quote, with_remote_temp, ExecError, HostExec};
use crate::inventory::SourceSpec;
use crate::model::SourceKind;
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub struct RelationalAdapter;

#[async_trait]
impl SourceAdapter for RelationalAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Relational
    }

    async fn extract(&self, exec: &dyn HostExec, req: &ExtractRequest<'_>) -> Result<RawExtract> {
        let SourceSpec::Relational {
            database,
            tables,
            modified_column,
            dump_command,
            query_command,
        } = req.source
        else {
            return Err(BackupError::Config(format!("{} is not a relational source", req.host.name)));
        };

        let extract_timeout = req.timeouts.extract();
        let transfer_timeout = req.timeouts.transfer();
        let dest = req.dest.clone();
        let scratch = req.scratch_dir().to_path_buf();
        let db = shell_quote(database);
        let since = req.change_filter();

        let pieces = with_remote_temp(exec, "ibk-pg", extract_timeout, &req.cancel, |tmp| async move {
            match since {
                None => {
                    let remote = format!("{tmp}/dump.sql");
                    exec.run_checked(
                        &format!("{dump_command} --no-owner --no-privileges {db} > {remote}"),
                        extract_timeout,
                    )
                    .await?;
                    exec.fetch(&remote, &dest, transfer_timeout).await?;
                    Ok::<_, ExecError>(Vec::new())
                }
                Some(since) => {
                    let tables = if tables.is_empty() {
                        discover_tables(exec, query_command, &db, modified_column, extract_timeout).await?
                    } else {
                        tables.clone()
                    };

                    let schema = format!("{tmp}/schema.sql");
                    exec.run_checked(
                        &format!("{dump_command} --schema-only --no-owner --no-privileges {db} > {schema}"),
                        extract_timeout,
                    )
                    .await?;
                    exec.fetch(&schema, &dest, transfer_timeout).await?;

                    let mut pieces = Vec::with_capacity(tables.len());
                    for (idx, table) in tables.iter().enumerate() {
                        let sql = format!(
                            "COPY (SELECT * FROM {} WHERE {} >= '{}') TO STDOUT",
                            quote_ident(table),
                            quote_ident(modified_column),
                            since_literal(since),
                        );
                        let remote = format!("{tmp}/{idx}.copy");
                        exec.run_checked(
                            &format!("{query_command} -X -q -d {db} -c {} > {remote}", shell_quote(&sql)),
                            extract_timeout,
                        )
                        .await?;
                        let local = scratch.join(format!("{idx}.copy"));
                        exec.fetch(&remote, &local, transfer_timeout).await?;
                        pieces.push((table.clone(), local));
                    }
                    Ok(pieces)
                }
            }
        })
        .await?;

        let path = req.dest.clone();
        let entity_count = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            if !pieces.is_empty() {
                append_copy_blocks(&path, &pieces)?;
            }
            count_copy_rows(&path)
        })
        .await
        .map_err(|e| BackupError::ExtractionFailed {
            host: req.host.name.clone(),
            reason: e.to_string(),
        })??;

        info!(host = %req.host.name, database = %database, rows = entity_count, "Relational extraction finished");
        Ok(RawExtract {
            path: req.dest.clone(),
            entity_count,
        })
    }
}

async fn discover_tables(
    exec: &dyn HostExec,
    query_command: &str,
    db: &str,
    column: &str,
    timeout: std::time::Duration,
) -> std::result::Result<Vec<String>, ExecError> {
    let sql = format!(
        "SELECT table_schema || '.' || table_name FROM information_schema.columns \
         WHERE column_name = '{}' AND table_schema NOT IN ('pg_catalog', 'information_schema') \
         ORDER BY 1",
        column.replace('\'', "''")
    );
    let out = exec
        .run_checked(&format!("{query_command} -X -At -d {db} -c {}", shell_quote(&sql)), timeout)
        .await?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Quote a possibly schema-qualified identifier.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn append_copy_blocks(dest: &Path, pieces: &[(String, PathBuf)]) -> std::io::Result<()> {
    let mut out = std::fs::OpenOptions::new().append(true).open(dest)?;
    for (table, piece) in pieces {
        writeln!(out)?;
        writeln!(out, "COPY {} FROM stdin;", quote_ident(table))?;
        let mut src = File::open(piece)?;
        std::io::copy(&mut src, &mut out)?;
        writeln!(out, "\\.")?;
        std::fs::remove_file(piece)?;
    }
    out.flush()
}

/// Count data rows inside `COPY ... FROM stdin;` blocks of a plain SQL dump.
pub fn count_copy_rows(path: &Path) -> std::io::Result<u64> {
    count_copy_rows_from(BufReader::new(File::open(path)?))
}

/// Works on raw bytes: dumps of non-UTF-8 databases count the same way.
pub fn count_copy_rows_from<R: BufRead>(mut reader: R) -> std::io::Result<u64> {
    let mut rows = 0u64;
    let mut in_copy = false;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = buf
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(&buf[..]);
        if in_copy {
            if line == b"\\." {
                in_copy = false;
            } else {
                rows += 1;
            }
        } else if line.starts_with(b"COPY ") && line.ends_with(b"FROM stdin;") {
            in_copy = true;
        }
    }
    Ok(rows)
}
