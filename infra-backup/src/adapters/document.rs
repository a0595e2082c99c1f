//! MongoDB extraction with `mongodump`.
//!
//! The dump directory is tarred on the host and fetched as one file. Change
//! filtering runs one `mongodump --query` per collection. Entity counts come
//! from mongodump's "done dumping db.coll (N documents)" progress lines.

use super::{ExtractRequest, RawExtract, SourceAdapter};
use crate::error::{BackupError, Result};
use crate::exec::{shell_quote, with_remote_temp, ExecError, HostExec};
use crate::inventory::SourceSpec;
use crate::model::SourceKind;
use async_trait::async_trait;
use chrono::SecondsFormat;
use tracing::info;

pub struct DocumentAdapter;

#[async_trait]
impl SourceAdapter for DocumentAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Document
    }

    async fn extract(&self, exec: &dyn HostExec, req: &ExtractRequest<'_>) -> Result<RawExtract> {
        let SourceSpec::Document {
            database,
            collections,
            modified_field,
            uri,
            dump_command,
            shell_command,
        } = req.source
        else {
            return Err(BackupError::Config(format!("{} is not a document source", req.host.name)));
        };

        let extract_timeout = req.timeouts.extract();
        let transfer_timeout = req.timeouts.transfer();
        let dest = req.dest.clone();
        let since = req.change_filter();
        let base = format!("{dump_command} --uri {} --db {}", shell_quote(uri), shell_quote(database));

        let entity_count = with_remote_temp(exec, "ibk-mongo", extract_timeout, &req.cancel, |tmp| async move {
            let out_dir = format!("{tmp}/dump");
            exec.run_checked(&format!("mkdir -p {out_dir}"), extract_timeout).await?;

            let mut count = 0u64;
            match since {
                None => {
                    let out = exec
                        .run_checked(&format!("{base} --out {out_dir}"), extract_timeout)
                        .await?;
                    count += parse_document_counts(&out.stderr);
                }
                Some(since) => {
                    let collections = if collections.is_empty() {
                        list_collections(exec, shell_command, uri, database, extract_timeout).await?
                    } else {
                        collections.clone()
                    };
                    let query = serde_json::json!({
                        modified_field.as_str(): {
                            "$gte": { "$date": since.to_rfc3339_opts(SecondsFormat::Secs, true) }
                        }
                    })
                    .to_string();

                    for collection in &collections {
                        let out = exec
                            .run_checked(
                                &format!(
                                    "{base} --collection {} --query {} --out {out_dir}",
                                    shell_quote(collection),
                                    shell_quote(&query),
                                ),
                                extract_timeout,
                            )
                            .await?;
                        count += parse_document_counts(&out.stderr);
                    }
                }
            }

            let archive = format!("{tmp}/dump.tar");
            exec.run_checked(&format!("tar -C {tmp} -cf {archive} dump"), extract_timeout)
                .await?;
            exec.fetch(&archive, &dest, transfer_timeout).await?;
            Ok::<_, ExecError>(count)
        })
        .await?;

        info!(host = %req.host.name, database = %database, documents = entity_count, "Document extraction finished");
        Ok(RawExtract {
            path: req.dest.clone(),
            entity_count,
        })
    }
}

async fn list_collections(
    exec: &dyn HostExec,
    shell_command: &str,
    uri: &str,
    database: &str,
    timeout: std::time::Duration,
) -> std::result::Result<Vec<String>, ExecError> {
    let script = format!(
        "db.getSiblingDB({}).getCollectionNames().forEach(function (c) {{ print(c) }})",
        serde_json::Value::String(database.to_string())
    );
    let out = exec
        .run_checked(
            &format!("{shell_command} {} --quiet --eval {}", shell_quote(uri), shell_quote(&script)),
            timeout,
        )
        .await?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.starts_with("system."))
        .map(str::to_string)
        .collect())
}

/// Sum the document counts from mongodump "done dumping" lines or the
/// mongorestore summary line.
pub fn parse_document_counts(log: &str) -> u64 {
    log.lines().filter_map(document_count).sum()
}

fn document_count(line: &str) -> Option<u64> {
    if line.contains("done dumping") {
        let open = line.rfind('(')?;
        let digits: String = line[open + 1..].chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    } else if line.contains("document(s) restored") {
        let words: Vec<&str> = line.split_whitespace().collect();
        words
            .windows(2)
            .find(|w| w[1] == "document(s)")
            .and_then(|w| w[0].parse().ok())
    } else {
        None
    }
}
