#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use infra_backup::adapters::{AdapterRegistry, ExtractRequest, RawExtract, SourceAdapter};
use infra_backup::catalog::Catalog;
use infra_backup::exec::{with_remote_temp, ExecError, HostExec};
use infra_backup::inventory::Inventory;
use infra_backup::model::SourceKind;
use infra_backup::notify::Notifier;
use infra_backup::scheduler::Scheduler;
use infra_backup::{BackupError, Settings};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub fn settings(root: &Path, passphrase_env: &str) -> Settings {
    let mut s = Settings::defaults("it");
    s.paths.backup_root = root.join("backups");
    s.paths.staging_dir = root.join("staging");
    s.paths.catalog_dir = root.join("catalog");
    s.paths.report_dir = root.join("reports");
    s.paths.dr_plan = root.join("dr-plan.md");
    s.verification.scratch_dir = root.join("scratch");
    s.preflight.min_free_disk_mb = 0;
    s.preflight.required_tools.clear();
    s.encryption.passphrase_env = passphrase_env.to_string();
    s.encryption.argon2_memory_kib = 1024;
    s.encryption.argon2_iterations = 1;
    s.encryption.argon2_parallelism = 1;
    s
}

pub fn open_catalog(settings: &Settings) -> Catalog {
    std::fs::create_dir_all(&settings.paths.catalog_dir).unwrap();
    Catalog::open(&settings.catalog_path(), &settings.environment).unwrap()
}

/// Relational, document and files sources on three local hosts. The database
/// tools are pointed at `sh` so pre-flight finds them.
pub fn three_server_inventory(files_dir: &Path) -> Inventory {
    let toml = format!(
        r#"
[[hosts]]
name = "db-01"
address = "localhost"
roles = ["database"]

[[hosts.sources]]
kind = "relational-db"
database = "shop"
dump_command = "sh"
query_command = "sh"

[[hosts]]
name = "docs-01"
address = "localhost"
roles = ["database"]

[[hosts.sources]]
kind = "documents"
database = "catalogue"
dump_command = "sh"
shell_command = "sh"

[[hosts]]
name = "files-01"
address = "localhost"
roles = ["app"]

[[hosts.sources]]
kind = "files"
paths = ["{}"]
"#,
        files_dir.display()
    );
    Inventory::from_toml(&toml).unwrap()
}

pub fn files_inventory(files_dir: &Path) -> Inventory {
    let toml = format!(
        r#"
[[hosts]]
name = "files-01"
address = "localhost"
roles = ["app"]

[[hosts.sources]]
kind = "files"
paths = ["{}"]
"#,
        files_dir.display()
    );
    Inventory::from_toml(&toml).unwrap()
}

/// Writes a fixed dump instead of talking to a database server.
pub struct CannedAdapter {
    pub kind: SourceKind,
    pub entities: u64,
}

#[async_trait]
impl SourceAdapter for CannedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn extract(&self, _exec: &dyn HostExec, request: &ExtractRequest<'_>) -> infra_backup::Result<RawExtract> {
        if let Some(parent) = request.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match self.kind {
            SourceKind::Relational => {
                let mut sql = String::from("BEGIN;\n");
                for i in 0..self.entities {
                    sql.push_str(&format!("INSERT INTO orders VALUES ({i}, 'order-{i}');\n"));
                }
                sql.push_str("COMMIT;\n");
                std::fs::write(&request.dest, sql)?;
            }
            _ => {
                let file = std::fs::File::create(&request.dest)?;
                let mut builder = tar::Builder::new(file);
                for i in 0..self.entities {
                    let body = format!("{{\"_id\": {i}}}");
                    let mut header = tar::Header::new_gnu();
                    header.set_size(body.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, format!("catalogue/doc-{i}.json"), body.as_bytes())?;
                }
                builder.finish()?;
            }
        }
        Ok(RawExtract {
            path: request.dest.clone(),
            entity_count: self.entities,
        })
    }
}

pub fn canned_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::standard();
    registry.register(Arc::new(CannedAdapter {
        kind: SourceKind::Relational,
        entities: 3,
    }));
    registry.register(Arc::new(CannedAdapter {
        kind: SourceKind::Document,
        entities: 2,
    }));
    registry
}

/// Canned output everywhere except `host`, which cannot be reached.
pub struct UnreachableHost {
    pub inner: CannedAdapter,
    pub host: &'static str,
}

#[async_trait]
impl SourceAdapter for UnreachableHost {
    fn kind(&self) -> SourceKind {
        self.inner.kind
    }

    async fn extract(&self, exec: &dyn HostExec, request: &ExtractRequest<'_>) -> infra_backup::Result<RawExtract> {
        if request.host.name == self.host {
            return Err(BackupError::RemoteUnreachable {
                host: request.host.name.clone(),
                reason: "connection refused".into(),
            });
        }
        self.inner.extract(exec, request).await
    }
}

/// Works inside a host scratch directory and never finishes on its own.
/// The directory path is published through `seen`.
pub struct HangingAdapter {
    pub seen: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl SourceAdapter for HangingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    async fn extract(&self, exec: &dyn HostExec, request: &ExtractRequest<'_>) -> infra_backup::Result<RawExtract> {
        let seen = Arc::clone(&self.seen);
        with_remote_temp(exec, "ibk-it", Duration::from_secs(60), &request.cancel, |dir| async move {
            std::fs::write(Path::new(&dir).join("partial.tar"), b"half")?;
            *seen.lock().unwrap() = Some(dir);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ExecError>(())
        })
        .await?;
        Ok(RawExtract {
            path: request.dest.clone(),
            entity_count: 0,
        })
    }
}

/// Panics inside the job task.
pub struct PanickingAdapter;

#[async_trait]
impl SourceAdapter for PanickingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    async fn extract(&self, _exec: &dyn HostExec, request: &ExtractRequest<'_>) -> infra_backup::Result<RawExtract> {
        panic!("adapter bug while reading {}", request.host.name);
    }
}

pub fn scheduler(settings: Settings, inventory: Inventory) -> Scheduler {
    scheduler_with(settings, inventory, canned_registry())
}

pub fn scheduler_with(settings: Settings, inventory: Inventory, adapters: AdapterRegistry) -> Scheduler {
    let catalog = open_catalog(&settings);
    Scheduler::new(Arc::new(settings), Arc::new(inventory), catalog)
        .with_adapters(adapters)
        .with_notifier(Notifier::log_only("it"))
}

/// A source tree whose files were last touched mid-2023.
pub fn old_source_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let at: DateTime<Utc> = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
    for (name, body) in [("app.conf", "listen 80"), ("users.csv", "id,name\n1,ada\n")] {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::from(at))
            .unwrap();
    }
    dir
}
