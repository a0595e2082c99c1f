//! Restore workflows.
//!
//! `restore database <host>` loads the newest valid full relational or
//! document artifact of a host (or an explicit job) back into the live
//! database; `restore vm <vmid>` restores a VM archive from the newest valid
//! infrastructure artifact through the hypervisor's restore tool. Both
//! overwrite live data and only run when forced.

use crate::adapters::document::parse_document_counts;
use crate::catalog::{jobs, Catalog, CatalogEntry};
use crate::config::Settings;
use crate::error::{BackupError, Result};
use crate::exec::{self, shell_quote, with_remote_temp, ExecError, HostExec};
use crate::inventory::{HostRecord, Inventory, SourceSpec};
use crate::model::SourceKind;
use crate::pipeline::{crypto::KdfParams, materialize};
use crate::verify::restorers::sum_copy_tags;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Job id to restore instead of the newest valid full backup
    pub backup: Option<String>,
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub target: String,
    pub host: String,
    pub job_id: String,
    pub component: SourceKind,
    pub artifact: PathBuf,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub plan: RestorePlan,
    pub executed: bool,
    pub entity_count: Option<u64>,
}

pub struct RestoreRunner {
    settings: Arc<Settings>,
    inventory: Arc<Inventory>,
    catalog: Catalog,
    cancel: CancellationToken,
}

impl RestoreRunner {
    pub fn new(settings: Arc<Settings>, inventory: Arc<Inventory>, catalog: Catalog) -> Self {
        Self {
            settings,
            inventory,
            catalog,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restore a host's relational or document database.
    pub async fn database(&self, host_name: &str, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let host = self
            .inventory
            .host(host_name)
            .ok_or_else(|| BackupError::Config(format!("unknown host '{host_name}'")))?;

        let entry = match &request.backup {
            Some(job_id) => {
                let entry = self.explicit_entry(job_id).await?;
                if entry.job.host != host.name || !entry.job.component.is_database() {
                    return Err(BackupError::Config(format!(
                        "backup {job_id} is a {} backup of {}, not a database backup of {}",
                        entry.job.component, entry.job.host, host.name
                    )));
                }
                entry
            }
            None => self.newest_database_full(host).await?,
        };

        let source = host
            .sources
            .iter()
            .find(|s| s.kind() == entry.job.component)
            .ok_or_else(|| {
                BackupError::Config(format!("{} no longer carries a {} source", host.name, entry.job.component))
            })?;

        let (target, steps) = match source {
            SourceSpec::Relational { database, query_command, .. } => (
                format!("{}/{database}", host.name),
                vec![
                    format!("materialize {}", entry.artifact.locator.display()),
                    format!("copy the SQL dump to {}", host.name),
                    format!("{query_command} -d {database} -f <dump> (ON_ERROR_STOP)"),
                ],
            ),
            SourceSpec::Document { database, .. } => (
                format!("{}/{database}", host.name),
                vec![
                    format!("materialize {}", entry.artifact.locator.display()),
                    format!("copy the dump tree to {}", host.name),
                    format!("{} --drop into {database}", self.settings.verification.mongorestore_command),
                ],
            ),
            _ => return Err(BackupError::Config(format!("{} is not a database source", entry.job.component))),
        };

        let plan = RestorePlan {
            target,
            host: host.name.clone(),
            job_id: entry.job.id.clone(),
            component: entry.job.component,
            artifact: entry.artifact.locator.clone(),
            steps,
        };
        if let Some(outcome) = self.gate(&plan, request)? {
            return Ok(outcome);
        }

        let exec = exec::for_host(&host.name, &host.connection, self.settings.timeouts.command());
        let source = source.clone();
        let count = self
            .with_materialized(&entry, |local| async move {
                match &source {
                    SourceSpec::Relational { database, query_command, .. } => {
                        self.restore_relational(exec.as_ref(), &local, database, query_command).await
                    }
                    SourceSpec::Document { database, uri, .. } => {
                        self.restore_document(exec.as_ref(), &local, database, uri).await
                    }
                    _ => Ok(0),
                }
            })
            .await?;

        info!(target = %plan.target, job_id = %plan.job_id, entities = count, "Database restored");
        Ok(RestoreOutcome {
            plan,
            executed: true,
            entity_count: Some(count),
        })
    }

    /// Restore one virtual machine from its hypervisor host's infrastructure backup.
    pub async fn vm(&self, vmid: u32, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let host = self
            .inventory
            .hosts()
            .iter()
            .find(|h| {
                h.sources
                    .iter()
                    .any(|s| matches!(s, SourceSpec::Infrastructure { vm_ids, .. } if vm_ids.contains(&vmid)))
            })
            .ok_or_else(|| BackupError::Config(format!("no infrastructure host lists VM {vmid}")))?;

        let entry = match &request.backup {
            Some(job_id) => {
                let entry = self.explicit_entry(job_id).await?;
                if entry.job.host != host.name || entry.job.component != SourceKind::Infrastructure {
                    return Err(BackupError::Config(format!(
                        "backup {job_id} is not an infrastructure backup of {}",
                        host.name
                    )));
                }
                entry
            }
            None => {
                let name = host.name.clone();
                self.catalog
                    .read(move |conn| jobs::latest_valid_full(conn, &name, SourceKind::Infrastructure))
                    .await?
                    .ok_or_else(|| BackupError::Config(format!("no valid full infrastructure backup of {}", host.name)))?
            }
        };

        let plan = RestorePlan {
            target: format!("{}/vm-{vmid}", host.name),
            host: host.name.clone(),
            job_id: entry.job.id.clone(),
            component: SourceKind::Infrastructure,
            artifact: entry.artifact.locator.clone(),
            steps: vec![
                format!("materialize {}", entry.artifact.locator.display()),
                format!("extract the vzdump archive of VM {vmid}"),
                format!("copy it to {}", host.name),
                format!("qmrestore <archive> {vmid} --force 1"),
            ],
        };
        if let Some(outcome) = self.gate(&plan, request)? {
            return Ok(outcome);
        }

        let exec = exec::for_host(&host.name, &host.connection, self.settings.timeouts.command());
        self.with_materialized(&entry, |bundle| async move {
            let vm_archive = crate::pipeline::blocking(move || extract_vm_archive(&bundle, vmid)).await?;
            let Some(vm_archive) = vm_archive else {
                return Err(BackupError::Config(format!("backup holds no archive for VM {vmid}")));
            };
            let file_name = vm_archive
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("vzdump-qemu-{vmid}.vma"));
            let (transfer, extract) = (self.settings.timeouts.transfer(), self.settings.timeouts.extract());

            with_remote_temp(exec.as_ref(), "ibk-restore", extract, &self.cancel, |tmp| {
                let exec = exec.clone();
                let vm_archive = vm_archive.clone();
                async move {
                    let remote = format!("{tmp}/{file_name}");
                    exec.push(&vm_archive, &remote, transfer).await?;
                    exec.run_checked(&format!("qmrestore {} {vmid} --force 1", shell_quote(&remote)), extract)
                        .await?;
                    Ok::<_, ExecError>(())
                }
            })
            .await?;
            Ok(1)
        })
        .await?;

        info!(target = %plan.target, job_id = %plan.job_id, "Virtual machine restored");
        Ok(RestoreOutcome {
            plan,
            executed: true,
            entity_count: Some(1),
        })
    }

    /// Dry runs stop at the plan; real runs need `force`.
    fn gate(&self, plan: &RestorePlan, request: &RestoreRequest) -> Result<Option<RestoreOutcome>> {
        if request.dry_run {
            info!(target = %plan.target, job_id = %plan.job_id, "Dry run: nothing restored");
            return Ok(Some(RestoreOutcome {
                plan: plan.clone(),
                executed: false,
                entity_count: None,
            }));
        }
        if !request.force {
            return Err(BackupError::Config(format!(
                "restoring {} overwrites live data; confirm with --force",
                plan.target
            )));
        }
        Ok(None)
    }

    async fn explicit_entry(&self, job_id: &str) -> Result<CatalogEntry> {
        let id = job_id.to_string();
        let entry = self
            .catalog
            .read(move |conn| jobs::find_entry(conn, &id))
            .await?
            .ok_or_else(|| BackupError::Config(format!("no backup with job id {job_id}")))?;

        let artifact_id = entry.artifact.id.clone();
        if !self.catalog.read(move |conn| jobs::is_valid(conn, &artifact_id)).await? {
            return Err(BackupError::VerificationFailed(format!(
                "backup {job_id} is failed, purged or did not pass its latest verification"
            )));
        }
        Ok(entry)
    }

    async fn newest_database_full(&self, host: &HostRecord) -> Result<CatalogEntry> {
        let kinds: Vec<SourceKind> = host
            .sources
            .iter()
            .map(SourceSpec::kind)
            .filter(SourceKind::is_database)
            .collect();
        if kinds.is_empty() {
            return Err(BackupError::Config(format!("{} carries no database source", host.name)));
        }

        let name = host.name.clone();
        let newest = self
            .catalog
            .read(move |conn| {
                let mut newest: Option<CatalogEntry> = None;
                for kind in kinds {
                    if let Some(e) = jobs::latest_valid_full(conn, &name, kind)? {
                        if newest.as_ref().map_or(true, |n| e.job.started_at > n.job.started_at) {
                            newest = Some(e);
                        }
                    }
                }
                Ok(newest)
            })
            .await?;
        newest.ok_or_else(|| BackupError::Config(format!("no valid full database backup of {}", host.name)))
    }

    /// Decrypt and decompress an artifact into staging, run `body` on the
    /// raw file, and remove the staging copy whatever happens.
    async fn with_materialized<F, Fut>(&self, entry: &CatalogEntry, body: F) -> Result<u64>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<u64>>,
    {
        let dir = self
            .settings
            .paths
            .staging_dir
            .join(format!("restore-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        let raw = dir.join(format!("raw.{}", entry.job.component.raw_extension()));

        let (src, dest) = (entry.artifact.locator.clone(), raw.clone());
        let passphrase = self.settings.encryption.passphrase();
        let kdf = KdfParams::from(&self.settings.encryption);
        let staged = tokio::task::spawn_blocking(move || materialize(&src, &dest, passphrase.as_ref(), kdf))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)));

        let result = match staged {
            Ok(Ok(())) => body(raw).await,
            Ok(Err(e)) | Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to remove restore staging dir");
        }
        result
    }

    async fn restore_relational(&self, exec: &dyn HostExec, dump: &Path, database: &str, psql: &str) -> Result<u64> {
        let (transfer, extract) = (self.settings.timeouts.transfer(), self.settings.timeouts.extract());
        let out = with_remote_temp(exec, "ibk-restore", extract, &self.cancel, |tmp| async move {
            let remote = format!("{tmp}/restore.sql");
            exec.push(dump, &remote, transfer).await?;
            exec.run_checked(
                &format!(
                    "{psql} -X -v ON_ERROR_STOP=1 -d {} -f {}",
                    shell_quote(database),
                    shell_quote(&remote)
                ),
                extract,
            )
            .await
        })
        .await?;
        Ok(sum_copy_tags(&out.stdout))
    }

    async fn restore_document(&self, exec: &dyn HostExec, tree: &Path, database: &str, uri: &str) -> Result<u64> {
        let (transfer, extract) = (self.settings.timeouts.transfer(), self.settings.timeouts.extract());
        let mongorestore = self.settings.verification.mongorestore_command.clone();
        let out = with_remote_temp(exec, "ibk-restore", extract, &self.cancel, |tmp| async move {
            let remote = format!("{tmp}/dump.tar");
            exec.push(tree, &remote, transfer).await?;
            exec.run_checked(&format!("tar -C {tmp} -xf {}", shell_quote(&remote)), extract)
                .await?;
            exec.run_checked(
                &format!(
                    "{mongorestore} --uri {} --drop --nsInclude {} --dir {}",
                    shell_quote(uri),
                    shell_quote(&format!("{database}.*")),
                    shell_quote(&format!("{tmp}/dump"))
                ),
                extract,
            )
            .await
        })
        .await?;
        Ok(parse_document_counts(&out.stderr))
    }
}

/// Pull the `vzdump-qemu-{vmid}-*` member out of an infrastructure bundle,
/// next to the bundle. Blocking.
fn extract_vm_archive(bundle: &Path, vmid: u32) -> std::io::Result<Option<PathBuf>> {
    let prefix = format!("vzdump-qemu-{vmid}-");
    let dir = bundle.parent().unwrap_or(Path::new("."));
    let mut archive = tar::Archive::new(std::fs::File::open(bundle)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if name.starts_with(&prefix) && !name.ends_with(".log") {
            let dest = dir.join(&name);
            entry.unpack(&dest)?;
            return Ok(Some(dest));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::{manifest, open_temp};
    use crate::inventory::{HostConnection, Role};
    use crate::model::{BackupKind, Status};
    use chrono::Utc;
    use tempfile::TempDir;

    fn db_host() -> HostRecord {
        HostRecord {
            name: "db-01".into(),
            connection: HostConnection::local(),
            roles: vec![Role::Database],
            sources: vec![SourceSpec::Relational {
                database: "app".into(),
                tables: vec![],
                modified_column: "updated_at".into(),
                dump_command: "pg_dump".into(),
                query_command: "psql".into(),
            }],
            metadata: Default::default(),
        }
    }

    fn runner(dir: &TempDir, catalog: Catalog) -> RestoreRunner {
        let mut settings = Settings::defaults("test");
        settings.paths.staging_dir = dir.path().join("staging");
        let inventory = Inventory::from_hosts(vec![db_host()]).unwrap();
        RestoreRunner::new(Arc::new(settings), Arc::new(inventory), catalog)
    }

    #[tokio::test]
    async fn test_dry_run_selects_newest_valid_full() {
        let (dir, catalog) = open_temp();
        let now = Utc::now();
        let older = manifest("db-01", SourceKind::Relational, BackupKind::Full, now - chrono::Duration::days(2), Status::Pass);
        let newer = manifest("db-01", SourceKind::Relational, BackupKind::Full, now - chrono::Duration::days(1), Status::Pass);
        let failed = manifest("db-01", SourceKind::Relational, BackupKind::Full, now, Status::Fail);
        for m in [&older, &newer, &failed] {
            catalog.record(m, None).await.unwrap();
        }

        let r = runner(&dir, catalog);
        let request = RestoreRequest {
            dry_run: true,
            ..Default::default()
        };
        let outcome = r.database("db-01", &request).await.unwrap();
        assert!(!outcome.executed);
        assert_eq!(outcome.plan.job_id, newer.job.id);
        assert_eq!(outcome.plan.target, "db-01/app");
    }

    #[tokio::test]
    async fn test_restore_requires_force_and_valid_backup() {
        let (dir, catalog) = open_temp();
        let good = manifest("db-01", SourceKind::Relational, BackupKind::Full, Utc::now(), Status::Pass);
        let bad = manifest("db-01", SourceKind::Relational, BackupKind::Full, Utc::now(), Status::Fail);
        catalog.record(&good, None).await.unwrap();
        catalog.record(&bad, None).await.unwrap();
        let r = runner(&dir, catalog);

        let err = r.database("db-01", &RestoreRequest::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));

        let explicit = RestoreRequest {
            backup: Some(bad.job.id.clone()),
            dry_run: true,
            force: false,
        };
        let err = r.database("db-01", &explicit).await.unwrap_err();
        assert!(matches!(err, BackupError::VerificationFailed(_)));

        assert!(r.database("web-01", &RestoreRequest::default()).await.is_err());
    }

    #[test]
    fn test_extract_vm_archive() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("vzdump-qemu-101-2024_01_01-00_00_00.vma"), b"vm").unwrap();
        std::fs::write(src.join("vzdump-qemu-101-2024_01_01-00_00_00.log"), b"log").unwrap();
        std::fs::write(src.join("state.tar"), b"state").unwrap();

        let bundle = dir.path().join("work").join("raw.tar");
        std::fs::create_dir(bundle.parent().unwrap()).unwrap();
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&bundle).unwrap());
            builder.append_dir_all(".", &src).unwrap();
            builder.finish().unwrap();
        }

        let found = extract_vm_archive(&bundle, 101).unwrap().unwrap();
        assert!(found.to_string_lossy().ends_with(".vma"));
        assert_eq!(std::fs::read(&found).unwrap(), b"vm");
        assert!(extract_vm_archive(&bundle, 999).unwrap().is_none());
    }
}
