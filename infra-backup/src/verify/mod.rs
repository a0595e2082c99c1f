//! Artifact verification.
//!
//! Three check classes run against a final artifact:
//!
//! * structural: the file exists, is non-empty, matches its recorded checksum
//!   and its container is readable (zstd frame, tar table of contents, or
//!   the encryption header);
//! * decrypt: encrypted artifacts are decrypted into a discarding sink; a
//!   missing key is a warning;
//! * restore-test (on request): the artifact is materialized into scratch
//!   space and loaded into an isolated target by a [`Restorer`].

pub mod restorers;

use crate::catalog::{jobs, verifications, Catalog, CatalogEntry};
use crate::config::Settings;
use crate::error::Result;
use crate::inventory::Scope;
use crate::model::{sha256_file, Artifact, CheckClass, SourceKind, Status, VerificationResult};
use crate::notify::report::Report;
use crate::pipeline::crypto::{self, KdfParams};
use crate::pipeline::materialize;
use crate::secret::Secret;
use restorers::{DocumentRestorer, FilesystemRestorer, RelationalRestorer, Restorer};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub restore_test: bool,
    pub passphrase: Option<Secret>,
    pub kdf: KdfParams,
}

impl VerifyOptions {
    pub fn from_settings(settings: &Settings, restore_test: bool) -> Self {
        Self {
            restore_test,
            passphrase: settings.encryption.passphrase(),
            kdf: KdfParams::from(&settings.encryption),
        }
    }
}

#[derive(Clone)]
pub struct Verifier {
    restorers: HashMap<SourceKind, Arc<dyn Restorer>>,
    scratch_dir: PathBuf,
}

impl Verifier {
    /// A verifier with no restorers; restore tests report a warning.
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            restorers: HashMap::new(),
            scratch_dir,
        }
    }

    pub fn standard(settings: &Settings) -> Self {
        let timeout = settings.timeouts.extract();
        Self::new(settings.verification.scratch_dir.clone())
            .with_restorer(Arc::new(FilesystemRestorer))
            .with_restorer(Arc::new(RelationalRestorer::new(&settings.verification, timeout)))
            .with_restorer(Arc::new(DocumentRestorer::new(&settings.verification, timeout)))
    }

    pub fn with_restorer(mut self, restorer: Arc<dyn Restorer>) -> Self {
        self.restorers.insert(restorer.kind(), restorer);
        self
    }

    /// Run every applicable check on a final artifact.
    pub async fn verify(&self, artifact: &Artifact, options: &VerifyOptions) -> Vec<VerificationResult> {
        let mut results = vec![self.structural(artifact).await];

        if artifact.encrypted {
            results.push(self.decrypt(artifact, options).await);
        }

        // A broken file cannot be restored; skip the expensive check
        if options.restore_test && results.iter().all(|r| !r.outcome.is_failure()) {
            results.push(self.restore_test(artifact, options).await);
        }

        for r in &results {
            match r.outcome {
                Status::Pass => info!(artifact = %artifact.locator.display(), check = r.check.as_str(), "{}", r.detail),
                _ => warn!(
                    artifact = %artifact.locator.display(),
                    check = r.check.as_str(),
                    outcome = %r.outcome,
                    "{}",
                    r.detail
                ),
            }
        }
        results
    }

    pub async fn structural(&self, artifact: &Artifact) -> VerificationResult {
        let owned = artifact.clone();
        let outcome = tokio::task::spawn_blocking(move || structural_check(&owned))
            .await
            .unwrap_or_else(|e| (Status::Fail, format!("check aborted: {e}")));
        VerificationResult::new(&artifact.id, CheckClass::Structural, outcome.0, outcome.1)
    }

    pub async fn decrypt(&self, artifact: &Artifact, options: &VerifyOptions) -> VerificationResult {
        let Some(passphrase) = options.passphrase.clone() else {
            return VerificationResult::new(
                &artifact.id,
                CheckClass::Decrypt,
                Status::Warning,
                "no decryption key configured; decrypt test skipped",
            );
        };

        let (path, kdf) = (artifact.locator.clone(), options.kdf);
        let outcome = tokio::task::spawn_blocking(move || crypto::decrypt_to(&path, &mut std::io::sink(), &passphrase, kdf))
            .await;
        let (status, detail) = match outcome {
            Ok(Ok(bytes)) => (Status::Pass, format!("decrypted {bytes} bytes")),
            Ok(Err(e)) => (Status::Fail, e.to_string()),
            Err(e) => (Status::Fail, format!("decrypt aborted: {e}")),
        };
        VerificationResult::new(&artifact.id, CheckClass::Decrypt, status, detail)
    }

    pub async fn restore_test(&self, artifact: &Artifact, options: &VerifyOptions) -> VerificationResult {
        let result = |status, detail: String| VerificationResult::new(&artifact.id, CheckClass::RestoreTest, status, detail);

        let Some(restorer) = self.restorers.get(&artifact.source_kind).cloned() else {
            return result(
                Status::Warning,
                format!("no restore test available for {} artifacts", artifact.source_kind),
            );
        };
        if artifact.encrypted && options.passphrase.is_none() {
            return result(Status::Warning, "no decryption key configured; restore test skipped".into());
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.scratch_dir).await {
            return result(Status::Fail, format!("scratch dir unavailable: {e}"));
        }
        // Dropping the TempDir removes everything staged for the test
        let scratch = match tempfile::Builder::new().prefix("ibk-verify-").tempdir_in(&self.scratch_dir) {
            Ok(dir) => dir,
            Err(e) => return result(Status::Fail, format!("scratch dir unavailable: {e}")),
        };

        let plain = scratch.path().join(format!("artifact.{}", artifact.source_kind.raw_extension()));
        let (src, dest, passphrase, kdf) = (
            artifact.locator.clone(),
            plain.clone(),
            options.passphrase.clone(),
            options.kdf,
        );
        let staged = tokio::task::spawn_blocking(move || materialize(&src, &dest, passphrase.as_ref(), kdf)).await;
        match staged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return result(Status::Fail, format!("could not stage artifact: {e}")),
            Err(e) => return result(Status::Fail, format!("could not stage artifact: {e}")),
        }

        let work = scratch.path().join("work");
        if let Err(e) = tokio::fs::create_dir_all(&work).await {
            return result(Status::Fail, format!("scratch dir unavailable: {e}"));
        }

        match restorer.restore_test(&plain, &work).await {
            Ok(0) => result(Status::Warning, "restore succeeded but no entities were restored".into()),
            Ok(n) => result(Status::Pass, format!("restored {n} entities")),
            Err(e) => result(Status::Fail, e.to_string()),
        }
    }
}

fn structural_check(artifact: &Artifact) -> (Status, String) {
    let path = &artifact.locator;
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => return (Status::Fail, format!("{}: {e}", path.display())),
    };
    if meta.len() == 0 {
        return (Status::Fail, "artifact is empty".into());
    }

    match sha256_file(path) {
        Ok((checksum, _)) if checksum == artifact.checksum => {}
        Ok((checksum, _)) => {
            return (
                Status::Fail,
                format!("checksum mismatch: recorded {}, found {checksum}", artifact.checksum),
            )
        }
        Err(e) => return (Status::Fail, format!("checksum failed: {e}")),
    }

    if artifact.encrypted {
        return match crypto::has_header(path) {
            Ok(true) => (Status::Pass, format!("{} bytes, checksum and header ok", meta.len())),
            Ok(false) => (Status::Fail, "missing encryption header".into()),
            Err(e) => (Status::Fail, e.to_string()),
        };
    }

    match read_contents(path, artifact.source_kind) {
        Ok(summary) => (Status::Pass, summary),
        Err(e) => (Status::Fail, format!("unreadable container: {e}")),
    }
}

/// Decode a plaintext artifact and read its table of contents.
fn read_contents(path: &Path, kind: SourceKind) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let compressed = path.extension().is_some_and(|e| e == "zst");
    let mut reader: Box<dyn Read> = if compressed {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(file)
    };

    match kind {
        SourceKind::Relational => {
            let bytes = std::io::copy(&mut reader, &mut std::io::sink())?;
            if bytes == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "dump is empty"));
            }
            Ok(format!("{bytes} bytes of SQL"))
        }
        SourceKind::Document | SourceKind::Filesystem | SourceKind::Infrastructure => {
            let mut archive = tar::Archive::new(reader);
            let mut entries = 0u64;
            for entry in archive.entries()? {
                entry?;
                entries += 1;
            }
            Ok(format!("tar with {entries} entries"))
        }
    }
}

/// Components covered by a verification scope.
pub fn scope_components(scope: Scope) -> Vec<SourceKind> {
    match scope {
        Scope::All => vec![
            SourceKind::Relational,
            SourceKind::Document,
            SourceKind::Filesystem,
            SourceKind::Infrastructure,
        ],
        Scope::Database => vec![SourceKind::Relational, SourceKind::Document],
        Scope::Infrastructure => vec![SourceKind::Infrastructure],
        Scope::Apps | Scope::Config => vec![SourceKind::Filesystem],
    }
}

/// Outcome of a re-verification run.
#[derive(Debug)]
pub struct ReverifyOutcome {
    pub checked: Vec<(CatalogEntry, Vec<VerificationResult>)>,
    pub report: Report,
}

impl ReverifyOutcome {
    pub fn status(&self) -> Status {
        self.report.status()
    }
}

/// Re-run checks on the newest artifact of every target in scope and append
/// the results to the catalog as a new round.
pub async fn reverify(
    catalog: &Catalog,
    verifier: &Verifier,
    scope: Scope,
    options: &VerifyOptions,
) -> Result<ReverifyOutcome> {
    let components = scope_components(scope);
    let entries: Vec<CatalogEntry> = catalog
        .read(|conn| jobs::latest_per_target(conn, None))
        .await?
        .into_iter()
        .filter(|e| components.contains(&e.job.component))
        .collect();

    let round_id = uuid::Uuid::new_v4().to_string();
    let mut report = Report::new(format!("Verification ({scope})"), catalog.environment());
    let mut checked = Vec::with_capacity(entries.len());

    if entries.is_empty() {
        report
            .section("Artifacts")
            .row("catalog", Status::Warning, "no artifacts found for this scope");
    }

    for entry in entries {
        let results = verifier.verify(&entry.artifact, options).await;

        let (round, rows) = (round_id.clone(), results.clone());
        catalog
            .write(move |conn| verifications::insert_round(conn, &round, &rows))
            .await?;

        let section = report.section(format!("{} / {}", entry.job.component, entry.job.host));
        for r in &results {
            section.row(r.check.as_str(), r.outcome, r.detail.clone());
        }
        checked.push((entry, results));
    }

    Ok(ReverifyOutcome { checked, report })
}
