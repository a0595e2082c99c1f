//! Batch runner.
//!
//! A batch resolves the inventory into work items for a scope and drives each
//! one through extraction, the artifact pipeline, verification, optional
//! upload and the catalog. One target failing never stops the batch; only
//! the global pre-flight gates (missing tool, low disk, environment lease
//! held) abort it, and they do so before any work starts.
//!
//! Targets run on a bounded worker pool (`scheduler.workers`, 1 = strictly
//! sequential). Each physical host runs at most one extraction at a time.

use crate::adapters::{AdapterRegistry, ExtractRequest};
use crate::catalog::{jobs, leases, Catalog};
use crate::config::Settings;
use crate::error::{BackupError, Result};
use crate::exec::{self, shell_quote, HostExec, LocalExec};
use crate::inventory::{Inventory, Scope, WorkItem};
use crate::model::{Artifact, ArtifactName, BackupJob, BackupKind, Manifest, Status, VerificationResult};
use crate::notify::report::Report;
use crate::notify::{Level, Notifier};
use crate::pipeline::{self, crypto::KdfParams, PipelineOptions};
use crate::retention::{self, RetentionOutcome};
use crate::verify::{Verifier, VerifyOptions};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub kind: BackupKind,
    pub scope: Scope,
    pub encrypt: bool,
    pub verify: bool,
    pub restore_test: bool,
    pub upload_remote: bool,
    pub dry_run: bool,
    /// Explicit reference time for incremental/differential runs
    pub since: Option<DateTime<Utc>>,
}

impl BatchRequest {
    pub fn new(kind: BackupKind, scope: Scope) -> Self {
        Self {
            kind,
            scope,
            encrypt: false,
            verify: false,
            restore_test: false,
            upload_remote: false,
            dry_run: false,
            since: None,
        }
    }
}

/// One target's result.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub target: String,
    pub manifest: Manifest,
    pub manifest_path: Option<PathBuf>,
    /// Problems after the manifest was recorded, such as a failed sidecar upload
    pub warnings: Vec<String>,
}

impl JobOutcome {
    pub fn status(&self) -> Status {
        self.manifest.status
    }
}

/// A target a dry run would process.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub target: String,
    pub kind: BackupKind,
    pub since: Option<DateTime<Utc>>,
    pub destination: PathBuf,
}

/// Everything a batch produced, returned to the caller instead of being
/// accumulated in shared state.
#[derive(Debug)]
pub struct BatchResult {
    pub batch_id: String,
    pub environment: String,
    pub kind: BackupKind,
    pub scope: Scope,
    pub jobs: Vec<JobOutcome>,
    pub planned: Vec<PlannedJob>,
    pub retention: Option<RetentionOutcome>,
    pub notes: Vec<String>,
}

impl BatchResult {
    /// Worst job outcome; an empty batch is a warning.
    pub fn status(&self) -> Status {
        let jobs = Status::worst_of(self.jobs.iter().map(|j| j.status()));
        let retention = self.retention.as_ref().map_or(Status::Pass, |r| r.status());
        let empty = self.jobs.is_empty() && self.planned.is_empty();
        let flagged = if empty || !self.notes.is_empty() {
            Status::Warning
        } else {
            Status::Pass
        };
        jobs.worst(retention).worst(flagged)
    }

    pub fn report(&self) -> Report {
        let mut report = Report::new(format!("Backup {} ({})", self.kind, self.scope), &self.environment);

        if !self.planned.is_empty() {
            let section = report.section("Planned (dry run)");
            for p in &self.planned {
                let since = p.since.map(|s| format!(", since {}", s.to_rfc3339())).unwrap_or_default();
                section.row(&p.target, Status::Pass, format!("{}{since} -> {}", p.kind, p.destination.display()));
            }
        }

        if !self.jobs.is_empty() {
            let section = report.section("Jobs");
            for j in &self.jobs {
                let m = &j.manifest;
                let mut detail = match (m.final_artifact(), &m.job.error) {
                    (_, Some(err)) => err.clone(),
                    (Some(a), None) => format!(
                        "{} entities, {} bytes -> {}",
                        a.entity_count,
                        a.size,
                        a.locator.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
                    ),
                    (None, None) => "no artifact".into(),
                };
                for note in &m.notes {
                    detail.push_str("; ");
                    detail.push_str(note);
                }
                section.row(&j.target, m.status, detail);
                for v in m.verifications.iter().filter(|v| v.outcome != Status::Pass) {
                    section.row(format!("{} {}", j.target, v.check.as_str()), v.outcome, v.detail.clone());
                }
            }
        }

        if let Some(r) = &self.retention {
            report.sections.extend(r.report(&self.environment).sections);
        }
        if !self.notes.is_empty() {
            let section = report.section("Notes");
            for note in &self.notes {
                section.row(&self.environment, Status::Warning, note.clone());
            }
        }
        if self.jobs.is_empty() && self.planned.is_empty() {
            report
                .section("Targets")
                .row(self.scope.to_string(), Status::Warning, "no targets matched this scope");
        }
        report
    }
}

pub struct Scheduler {
    settings: Arc<Settings>,
    inventory: Arc<Inventory>,
    catalog: Catalog,
    adapters: AdapterRegistry,
    verifier: Verifier,
    notifier: Notifier,
    host_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(settings: Arc<Settings>, inventory: Arc<Inventory>, catalog: Catalog) -> Self {
        let verifier = Verifier::standard(&settings);
        let notifier = Notifier::from_settings(&settings);
        Self {
            settings,
            inventory,
            catalog,
            adapters: AdapterRegistry::standard(),
            verifier,
            notifier,
            host_locks: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run one batch to completion.
    pub async fn run_batch(&self, request: &BatchRequest) -> Result<BatchResult> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let work = self.inventory.resolve(request.scope);
        info!(
            batch_id = %batch_id,
            environment = %self.settings.environment,
            kind = %request.kind,
            scope = %request.scope,
            targets = work.len(),
            "Starting backup batch"
        );

        let mut result = BatchResult {
            batch_id: batch_id.clone(),
            environment: self.settings.environment.clone(),
            kind: request.kind,
            scope: request.scope,
            jobs: Vec::new(),
            planned: Vec::new(),
            retention: None,
            notes: Vec::new(),
        };

        if request.dry_run {
            for item in &work {
                let since = self.resolve_since(item, request).await.unwrap_or(None);
                let name = ArtifactName::new(item.component(), request.kind, &item.host.name, Utc::now());
                result.planned.push(PlannedJob {
                    target: item.target_key(),
                    kind: request.kind,
                    since,
                    destination: name.dir(&self.settings.environment_root()),
                });
            }
            return Ok(result);
        }

        if work.is_empty() {
            warn!(scope = %request.scope, "No inventory targets matched the scope");
            return Ok(result);
        }

        preflight(&self.settings, &work).await?;

        let lease = self
            .catalog
            .acquire_lease(
                &leases::backup_scope(&self.settings.environment),
                self.settings.scheduler.lease_ttl_secs,
            )
            .await?;

        result.jobs = self.run_pool(&batch_id, request, work).await;
        for job in &result.jobs {
            result.notes.extend(job.warnings.iter().map(|w| format!("{}: {w}", job.target)));
        }

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release environment lease");
        }

        if self.settings.retention.run_after_backup && !Status::worst_of(result.jobs.iter().map(|j| j.status())).is_failure() {
            match retention::run(&self.catalog, &self.settings.retention, false).await {
                Ok(outcome) => result.retention = Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Retention pass failed");
                    result.notes.push(format!("retention pass failed: {e}"));
                }
            }
        }

        let status = result.status();
        let (pass, warn_count, fail) = result.report().counts();
        let summary = format!("{pass} passed, {warn_count} warnings, {fail} failed");
        let subject = format!("Backup {} {}", request.kind, status);
        self.notifier.notify(Level::from(status), &subject, &summary).await;

        Ok(result)
    }

    async fn run_pool(&self, batch_id: &str, request: &BatchRequest, work: Vec<WorkItem>) -> Vec<JobOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.settings.scheduler.workers.max(1)));
        let mut handles = Vec::with_capacity(work.len());

        for item in work {
            let runner = self.job_runner();
            let (sem, batch_id, request) = (Arc::clone(&semaphore), batch_id.to_string(), request.clone());
            let task_item = item.clone();

            let handle = tokio::spawn(async move {
                let item = task_item;
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return runner.failed_job(&batch_id, &request, &item, e.to_string()).await,
                };
                runner.run(&batch_id, &request, &item).await
            });
            handles.push((item, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (item, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(target = %item.target_key(), error = %e, "Job task aborted");
                    let reason = format!("job task aborted: {e}");
                    outcomes.push(self.job_runner().failed_job(batch_id, request, &item, reason).await);
                }
            }
        }
        outcomes
    }

    fn job_runner(&self) -> JobRunner {
        JobRunner {
            settings: Arc::clone(&self.settings),
            catalog: self.catalog.clone(),
            adapters: self.adapters.clone(),
            verifier: self.verifier.clone(),
            host_locks: Arc::clone(&self.host_locks),
            cancel: self.cancel.clone(),
        }
    }

    async fn resolve_since(&self, item: &WorkItem, request: &BatchRequest) -> Result<Option<DateTime<Utc>>> {
        resolve_since(&self.catalog, item, request).await
    }
}

/// Reference time for a target: the explicit `--since`, otherwise the start
/// of its last valid full backup. Full runs have none.
async fn resolve_since(catalog: &Catalog, item: &WorkItem, request: &BatchRequest) -> Result<Option<DateTime<Utc>>> {
    if request.kind == BackupKind::Full {
        return Ok(None);
    }
    if request.since.is_some() {
        return Ok(request.since);
    }
    let (host, component) = (item.host.name.clone(), item.component());
    catalog
        .read(move |conn| jobs::last_full_started_at(conn, &host, component))
        .await
}

/// Everything one job needs, cloned into its task.
struct JobRunner {
    settings: Arc<Settings>,
    catalog: Catalog,
    adapters: AdapterRegistry,
    verifier: Verifier,
    host_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    cancel: CancellationToken,
}

/// Pieces of a job that exist so far; kept on failure for the manifest.
#[derive(Default)]
struct Progress {
    artifacts: Vec<Artifact>,
    verifications: Vec<VerificationResult>,
    notes: Vec<String>,
    status: Status,
}

impl JobRunner {
    async fn run(&self, batch_id: &str, request: &BatchRequest, item: &WorkItem) -> JobOutcome {
        let started_at = Utc::now();
        let job_id = uuid::Uuid::new_v4().to_string();
        let name = ArtifactName::new(item.component(), request.kind, &item.host.name, started_at);
        let env_root = self.settings.environment_root();
        let staging = self.settings.paths.staging_dir.join(&job_id);

        let mut job = BackupJob {
            id: job_id.clone(),
            batch_id: batch_id.to_string(),
            environment: self.settings.environment.clone(),
            component: item.component(),
            host: item.host.name.clone(),
            kind: request.kind,
            encrypt: request.encrypt,
            since: None,
            started_at,
            ended_at: None,
            status: Status::Pass,
            error: None,
        };

        info!(job_id = %job_id, host = %item.host.name, component = %item.component(), kind = %request.kind, "Job started");

        let mut progress = Progress::default();
        let outcome = self
            .execute(request, item, &name, &env_root, &staging, &mut job, &mut progress)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %job_id, dir = %staging.display(), error = %e, "Failed to remove staging dir");
            }
        }

        if let Err(e) = &outcome {
            error!(job_id = %job_id, host = %item.host.name, component = %item.component(), error = %e, "Job failed");
            job.error = Some(e.to_string());
            progress.status = progress.status.worst(e.severity());
        }

        let status = Manifest::aggregate(&progress.verifications, progress.status);
        job.status = status;
        job.ended_at = Some(Utc::now());

        let manifest = Manifest {
            version: Manifest::VERSION,
            job,
            artifacts: progress.artifacts,
            verifications: progress.verifications,
            notes: progress.notes,
            status,
        };

        let sidecar = name.manifest_path(&env_root);
        let manifest_path = match self.catalog.record(&manifest, Some(&sidecar)).await {
            Ok(()) => Some(sidecar),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to record manifest");
                None
            }
        };

        let mut warnings = Vec::new();
        if let (true, Some(path), Some(_)) = (request.upload_remote, &manifest_path, manifest.final_artifact()) {
            if let Err(e) = upload(&self.settings, path, &name).await {
                warn!(job_id = %job_id, error = %e, "Manifest upload failed");
                warnings.push(format!("sidecar manifest not uploaded: {e}"));
            }
        }

        match status {
            Status::Pass => info!(job_id = %job_id, status = %status, "Job finished"),
            _ => warn!(job_id = %job_id, status = %status, "Job finished"),
        }

        JobOutcome {
            target: item.target_key(),
            manifest,
            manifest_path,
            warnings,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        request: &BatchRequest,
        item: &WorkItem,
        name: &ArtifactName,
        env_root: &Path,
        staging: &Path,
        job: &mut BackupJob,
        progress: &mut Progress,
    ) -> Result<()> {
        let since = resolve_since(&self.catalog, item, request).await?;
        if request.kind != BackupKind::Full && since.is_none() {
            return Err(BackupError::ExtractionFailed {
                host: item.host.name.clone(),
                reason: format!(
                    "no valid full backup of {} to diff against; run a full backup or pass --since",
                    item.component()
                ),
            });
        }
        job.since = since;

        let adapter = self
            .adapters
            .get(item.component())
            .ok_or_else(|| BackupError::Config(format!("no adapter for {}", item.component())))?;

        tokio::fs::create_dir_all(staging).await?;
        let raw_dest = staging.join(format!("raw.{}", item.component().raw_extension()));
        let extract_request = ExtractRequest {
            host: &item.host,
            source: &item.source,
            kind: request.kind,
            since,
            dest: raw_dest,
            timeouts: &self.settings.timeouts,
            cancel: self.cancel.clone(),
        };

        let raw = {
            let lock = self
                .host_locks
                .entry(host_key(item))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _held = lock.lock().await;
            debug!(host = %item.host.name, "Host lock acquired");

            let exec: Arc<dyn HostExec> =
                exec::for_host(&item.host.name, &item.host.connection, self.settings.timeouts.command());
            adapter.extract(exec.as_ref(), &extract_request).await?
        };

        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        if raw.entity_count == 0 {
            let note = match since {
                Some(since) => format!("no entities changed since {}", since.to_rfc3339()),
                None => "extraction captured no entities".to_string(),
            };
            warn!(host = %item.host.name, component = %item.component(), "{note}");
            progress.notes.push(note);
            progress.status = progress.status.worst(Status::Warning);
        }

        let options = PipelineOptions {
            encrypt: request.encrypt,
            passphrase: self.settings.encryption.passphrase(),
            kdf: KdfParams::from(&self.settings.encryption),
        };
        let output = pipeline::run(&raw, item.component(), name, &name.dir(env_root), &options, &self.cancel).await?;
        progress.artifacts = output.artifacts;
        progress.notes.extend(output.notes);
        progress.status = progress.status.worst(output.status);

        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let Some(final_artifact) = progress.artifacts.last().cloned() else {
            return Ok(());
        };

        if request.verify || request.restore_test {
            let options = VerifyOptions::from_settings(&self.settings, request.restore_test);
            progress.verifications = self.verifier.verify(&final_artifact, &options).await;
        }

        if request.upload_remote {
            if let Err(e) = upload(&self.settings, &final_artifact.locator, name).await {
                warn!(host = %item.host.name, error = %e, "Upload failed");
                progress.notes.push(e.to_string());
                progress.status = progress.status.worst(e.severity());
            }
        }

        Ok(())
    }

    /// A FAIL record for a job that never produced a manifest of its own.
    async fn failed_job(&self, batch_id: &str, request: &BatchRequest, item: &WorkItem, reason: String) -> JobOutcome {
        let now = Utc::now();
        let job = BackupJob {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            environment: self.settings.environment.clone(),
            component: item.component(),
            host: item.host.name.clone(),
            kind: request.kind,
            encrypt: request.encrypt,
            since: None,
            started_at: now,
            ended_at: Some(now),
            status: Status::Fail,
            error: Some(reason),
        };
        let manifest = Manifest {
            version: Manifest::VERSION,
            job,
            artifacts: Vec::new(),
            verifications: Vec::new(),
            notes: Vec::new(),
            status: Status::Fail,
        };
        if let Err(e) = self.catalog.record(&manifest, None).await {
            error!(error = %e, "Failed to record manifest");
        }
        JobOutcome {
            target: item.target_key(),
            manifest,
            manifest_path: None,
            warnings: Vec::new(),
        }
    }
}

/// Physical identity of a host for extraction exclusivity.
fn host_key(item: &WorkItem) -> String {
    let c = &item.host.connection;
    if c.is_local() {
        "localhost".to_string()
    } else {
        format!("{}:{}", c.address, c.port)
    }
}

/// Push a file through the configured object-storage client.
async fn upload(settings: &Settings, path: &Path, name: &ArtifactName) -> Result<()> {
    let Some(upload) = &settings.upload else {
        return Err(BackupError::UploadFailed("no [upload] command configured".into()));
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let key = format!("{}/{}/{}", settings.environment, name.component, file_name);
    let command = upload
        .command
        .replace("{path}", &shell_quote(&path.to_string_lossy()))
        .replace("{key}", &shell_quote(&key));

    LocalExec::new("localhost")
        .run_checked(&command, settings.timeouts.transfer())
        .await
        .map_err(|e| BackupError::UploadFailed(e.to_string()))?;
    info!(key = %key, "Uploaded to remote storage");
    Ok(())
}

// ── Pre-flight ──

/// Global gates checked before a batch starts.
pub async fn preflight(settings: &Settings, work: &[WorkItem]) -> Result<()> {
    let mut tools: Vec<String> = settings.preflight.required_tools.clone();
    for item in work.iter().filter(|i| i.host.connection.is_local()) {
        tools.extend(item.source.tools());
    }
    tools.sort();
    tools.dedup();

    for tool in &tools {
        if !tool_available(tool) {
            return Err(BackupError::ToolUnavailable(tool.clone()));
        }
    }

    for dir in [&settings.paths.backup_root, &settings.paths.staging_dir] {
        tokio::fs::create_dir_all(dir).await?;
        let available_mb = free_disk_mb(dir)?;
        if available_mb < settings.preflight.min_free_disk_mb {
            return Err(BackupError::InsufficientDisk {
                path: dir.display().to_string(),
                available_mb,
                required_mb: settings.preflight.min_free_disk_mb,
            });
        }
    }

    debug!(tools = ?tools, "Pre-flight checks passed");
    Ok(())
}

/// Whether `tool` resolves to an executable file, directly or via `PATH`.
pub fn tool_available(tool: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let is_exec = |p: &Path| {
        std::fs::metadata(p)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if tool.contains('/') {
        return is_exec(Path::new(tool));
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_exec(&dir.join(tool))))
        .unwrap_or(false)
}

fn free_disk_mb(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| BackupError::Io(std::io::Error::from(e)))?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64) / (1024 * 1024))
}
