//! Restore-capability tests: load a materialized artifact into an isolated,
//! throwaway target and count what came back. Every restorer removes its
//! target on every exit path.

use crate::adapters::document::parse_document_counts;
use crate::config::VerificationConfig;
use crate::error::{BackupError, Result};
use crate::exec::{shell_quote, HostExec, LocalExec};
use crate::model::SourceKind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Restorer: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Restore `raw` (decrypted, decompressed) using `scratch` as private
    /// working space. Returns the number of restored entities.
    async fn restore_test(&self, raw: &Path, scratch: &Path) -> Result<u64>;
}

fn scratch_name(prefix: &str) -> String {
    format!("{prefix}_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Unpack a tar into `dest`. Blocking.
fn unpack_tar(archive: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut ar = tar::Archive::new(std::fs::File::open(archive)?);
    ar.set_preserve_permissions(false);
    ar.unpack(dest)
}

// ── Filesystem ──

/// Extracts the archive into scratch space and counts the regular files.
pub struct FilesystemRestorer;

#[async_trait]
impl Restorer for FilesystemRestorer {
    fn kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    async fn restore_test(&self, raw: &Path, scratch: &Path) -> Result<u64> {
        let (raw, target) = (raw.to_path_buf(), scratch.join("extract"));
        let count = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            unpack_tar(&raw, &target)?;
            let files = walkdir::WalkDir::new(&target)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count();
            Ok(files as u64)
        })
        .await
        .map_err(|e| BackupError::VerificationFailed(e.to_string()))??;
        Ok(count)
    }
}

// ── Relational ──

/// Restores a plain SQL dump into a fresh database and sums the `COPY n`
/// command tags psql prints.
pub struct RelationalRestorer {
    psql: String,
    maintenance_db: String,
    timeout: Duration,
}

impl RelationalRestorer {
    pub fn new(config: &VerificationConfig, timeout: Duration) -> Self {
        Self {
            psql: config.psql_command.clone(),
            maintenance_db: config.scratch_database.clone(),
            timeout,
        }
    }

    fn admin(&self, sql: &str) -> String {
        format!("{} -X -q -d {} -c {}", self.psql, shell_quote(&self.maintenance_db), shell_quote(sql))
    }
}

/// Sum the row counts of `COPY n` command tags.
pub fn sum_copy_tags(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("COPY "))
        .filter_map(|n| n.trim().parse::<u64>().ok())
        .sum()
}

#[async_trait]
impl Restorer for RelationalRestorer {
    fn kind(&self) -> SourceKind {
        SourceKind::Relational
    }

    async fn restore_test(&self, raw: &Path, _scratch: &Path) -> Result<u64> {
        let exec = LocalExec::new("localhost");
        let db = scratch_name("ibk_verify");

        exec.run_checked(&self.admin(&format!("CREATE DATABASE \"{db}\"")), self.timeout)
            .await?;
        debug!(database = %db, "Created restore-test database");

        let restore = exec
            .run_checked(
                &format!(
                    "{} -X -v ON_ERROR_STOP=1 -d {} -f {}",
                    self.psql,
                    shell_quote(&db),
                    shell_quote(&raw.to_string_lossy())
                ),
                self.timeout,
            )
            .await;

        let drop = self.admin(&format!("DROP DATABASE IF EXISTS \"{db}\" WITH (FORCE)"));
        match exec.run(&drop, self.timeout).await {
            Ok(out) if out.success() => debug!(database = %db, "Dropped restore-test database"),
            Ok(out) => warn!(database = %db, stderr = %out.stderr.trim(), "Failed to drop restore-test database"),
            Err(e) => warn!(database = %db, error = %e, "Failed to drop restore-test database"),
        }

        let out = restore.map_err(|e| BackupError::VerificationFailed(e.to_string()))?;
        Ok(sum_copy_tags(&out.stdout))
    }
}

// ── Document ──

/// Restores a mongodump tree into `ibk_verify_*` namespaces and drops them afterwards.
pub struct DocumentRestorer {
    mongorestore: String,
    mongosh: String,
    uri: String,
    timeout: Duration,
}

impl DocumentRestorer {
    pub fn new(config: &VerificationConfig, timeout: Duration) -> Self {
        Self {
            mongorestore: config.mongorestore_command.clone(),
            mongosh: config.mongosh_command.clone(),
            uri: config.mongo_uri.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl Restorer for DocumentRestorer {
    fn kind(&self) -> SourceKind {
        SourceKind::Document
    }

    async fn restore_test(&self, raw: &Path, scratch: &Path) -> Result<u64> {
        let (archive, target) = (raw.to_path_buf(), scratch.to_path_buf());
        let databases = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            unpack_tar(&archive, &target)?;
            let mut names = Vec::new();
            for entry in std::fs::read_dir(target.join("dump"))? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    names.push(entry.file_name().to_string_lossy().to_string());
                }
            }
            Ok(names)
        })
        .await
        .map_err(|e| BackupError::VerificationFailed(e.to_string()))??;

        let prefix = scratch_name("ibk_verify");
        let dump_dir: PathBuf = scratch.join("dump");
        let exec = LocalExec::new("localhost");

        let restore = exec
            .run_checked(
                &format!(
                    "{} --uri {} --nsFrom '$db$.$coll$' --nsTo {} --dir {}",
                    self.mongorestore,
                    shell_quote(&self.uri),
                    shell_quote(&format!("{prefix}_$db$.$coll$")),
                    shell_quote(&dump_dir.to_string_lossy()),
                ),
                self.timeout,
            )
            .await;

        for db in &databases {
            let script = format!(
                "db.getSiblingDB({}).dropDatabase()",
                serde_json::Value::String(format!("{prefix}_{db}"))
            );
            let drop = format!("{} {} --quiet --eval {}", self.mongosh, shell_quote(&self.uri), shell_quote(&script));
            match exec.run(&drop, self.timeout).await {
                Ok(out) if out.success() => debug!(database = %db, "Dropped restore-test namespace"),
                Ok(out) => warn!(database = %db, stderr = %out.stderr.trim(), "Failed to drop restore-test namespace"),
                Err(e) => warn!(database = %db, error = %e, "Failed to drop restore-test namespace"),
            }
        }

        let out = restore.map_err(|e| BackupError::VerificationFailed(e.to_string()))?;
        Ok(parse_document_counts(&out.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sum_copy_tags() {
        let out = "SET\nCREATE TABLE\nCOPY 120\nCOPY 0\nALTER TABLE\nCOPY 3\n";
        assert_eq!(sum_copy_tags(out), 123);
        assert_eq!(sum_copy_tags(""), 0);
    }

    #[tokio::test]
    async fn test_filesystem_restore_counts_files() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("etc")).unwrap();
        std::fs::write(src.path().join("etc/a.conf"), b"a").unwrap();
        std::fs::write(src.path().join("etc/b.conf"), b"b").unwrap();

        let archive = src.path().join("files.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&archive).unwrap());
            builder.append_dir_all("etc", src.path().join("etc")).unwrap();
            builder.finish().unwrap();
        }

        let scratch = TempDir::new().unwrap();
        let count = FilesystemRestorer.restore_test(&archive, scratch.path()).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_relational_restore_always_drops_database() {
        // Stand-in psql that logs its arguments and fails the restore step
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("calls.log");
        let tool = dir.path().join("fake_psql");
        std::fs::write(
            &tool,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\ncase \"$*\" in *-f*) echo 'ERROR: boom' >&2; exit 3;; esac\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = VerificationConfig {
            psql_command: tool.to_string_lossy().to_string(),
            ..Default::default()
        };
        let restorer = RelationalRestorer::new(&config, Duration::from_secs(10));
        let dump = dir.path().join("dump.sql");
        std::fs::write(&dump, "SELECT 1;\n").unwrap();

        let err = restorer.restore_test(&dump, dir.path()).await.unwrap_err();
        assert!(matches!(err, BackupError::VerificationFailed(_)));

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("CREATE DATABASE"));
        assert!(calls.contains("DROP DATABASE IF EXISTS"));
    }
}
