//! File and log tree extraction into a tar archive.
//!
//! Local hosts are walked natively with `walkdir` and archived with `tar`;
//! remote hosts run `find | tar` inside a scratch directory that is removed
//! afterwards.

use super::{find_and_tar_command, ExtractRequest, RawExtract, SourceAdapter};
use crate::error::{BackupError, Result};
use crate::exec::{with_remote_temp, ExecError, HostExec};
use crate::inventory::SourceSpec;
use crate::model::SourceKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

pub struct FilesystemAdapter;

#[async_trait]
impl SourceAdapter for FilesystemAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    async fn extract(&self, exec: &dyn HostExec, req: &ExtractRequest<'_>) -> Result<RawExtract> {
        let SourceSpec::Filesystem { paths, exclude } = req.source else {
            return Err(BackupError::Config(format!("{} is not a files source", req.host.name)));
        };

        let since = req.change_filter();
        let entity_count = if req.host.connection.is_local() {
            let options = WalkOptions {
                exclude_patterns: exclude.clone(),
                modified_since: since.map(SystemTime::from),
            };
            let roots = paths.clone();
            let dest = req.dest.clone();
            let task = tokio::task::spawn_blocking(move || archive_local(&roots, &options, &dest));
            let finished = tokio::select! {
                finished = tokio::time::timeout(req.timeouts.extract(), task) => finished,
                _ = req.cancel.cancelled() => return Err(BackupError::Cancelled),
            };
            match finished {
                Ok(joined) => joined.map_err(|e| BackupError::ExtractionFailed {
                    host: req.host.name.clone(),
                    reason: e.to_string(),
                })??,
                Err(_) => {
                    return Err(BackupError::Timeout {
                        secs: req.timeouts.extract_secs,
                        operation: "file archive".into(),
                    })
                }
            }
        } else {
            archive_remote(exec, req, paths, exclude, since).await?
        };

        info!(host = %req.host.name, files = entity_count, "Filesystem extraction finished");
        Ok(RawExtract {
            path: req.dest.clone(),
            entity_count,
        })
    }
}

async fn archive_remote(
    exec: &dyn HostExec,
    req: &ExtractRequest<'_>,
    paths: &[PathBuf],
    exclude: &[String],
    since: Option<DateTime<Utc>>,
) -> Result<u64> {
    let extract_timeout = req.timeouts.extract();
    let transfer_timeout = req.timeouts.transfer();
    let dest = req.dest.clone();

    let count = with_remote_temp(exec, "ibk-files", extract_timeout, &req.cancel, |tmp| async move {
        let list = format!("{tmp}/list");
        let archive = format!("{tmp}/files.tar");
        let out = exec
            .run_checked(&find_and_tar_command(paths, exclude, since, &list, &archive), extract_timeout)
            .await?;
        exec.fetch(&archive, &dest, transfer_timeout).await?;
        Ok::<_, ExecError>(out.stdout.trim().parse::<u64>().unwrap_or(0))
    })
    .await?;
    Ok(count)
}

/// Options for the local walk.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// File names containing any of these are skipped
    pub exclude_patterns: Vec<String>,

    /// Only files modified at or after this instant
    pub modified_since: Option<SystemTime>,
}

/// Walk each root and hand every regular file that passes the filters to `callback`.
pub fn walk_files<F>(root: &Path, options: &WalkOptions, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns)) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Unreadable subtrees are skipped rather than failing the archive
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(since) = options.modified_since {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            if modified.map_or(true, |m| m < since) {
                continue;
            }
        }

        callback(entry.path())?;
    }
    Ok(())
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| file_name.contains(p.as_str()))
}

/// Archive matching files under `roots` into a tar at `dest`, storing each
/// under its absolute path without the leading `/`. Returns the file count.
pub fn archive_local(roots: &[PathBuf], options: &WalkOptions, dest: &Path) -> std::io::Result<u64> {
    let file = std::fs::File::create(dest)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    let mut count = 0u64;
    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "Backup path does not exist");
            continue;
        }
        walk_files(root, options, |path| {
            let name = path.strip_prefix("/").unwrap_or(path);
            builder.append_path_with_name(path, name)?;
            count += 1;
            Ok(())
        })?;
    }

    builder.into_inner()?.sync_all()?;
    Ok(count)
}
