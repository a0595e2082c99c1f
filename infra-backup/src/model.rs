//! Core records: jobs, artifacts, verification results and manifests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Outcome severity. Ordering is significant: `Fail > Warning > Pass`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    Pass,
    Warning,
    Fail,
}

impl Status {
    pub fn worst(self, other: Status) -> Status {
        self.max(other)
    }

    /// Worst outcome across the iterator; an empty iterator is a pass.
    pub fn worst_of<I: IntoIterator<Item = Status>>(items: I) -> Status {
        items.into_iter().fold(Status::Pass, Status::worst)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "PASS",
            Status::Warning => "WARNING",
            Status::Fail => "FAIL",
        }
    }

    pub fn is_failure(&self) -> bool {
        *self == Status::Fail
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PASS" => Ok(Status::Pass),
            "WARNING" => Ok(Status::Warning),
            "FAIL" => Ok(Status::Fail),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
    Differential,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Differential => "differential",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            "differential" => Ok(BackupKind::Differential),
            other => Err(format!("unknown backup kind '{other}'")),
        }
    }
}

/// The kind of data store an artifact was extracted from. Doubles as the
/// component directory name in the artifact layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "relational-db")]
    Relational,
    #[serde(rename = "documents")]
    Document,
    #[serde(rename = "files")]
    Filesystem,
    #[serde(rename = "infrastructure")]
    Infrastructure,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Relational => "relational-db",
            SourceKind::Document => "documents",
            SourceKind::Filesystem => "files",
            SourceKind::Infrastructure => "infrastructure",
        }
    }

    /// Extension of the raw extraction output.
    pub fn raw_extension(&self) -> &'static str {
        match self {
            SourceKind::Relational => "sql",
            SourceKind::Document => "bson.tar",
            SourceKind::Filesystem | SourceKind::Infrastructure => "tar",
        }
    }

    pub fn is_database(&self) -> bool {
        matches!(self, SourceKind::Relational | SourceKind::Document)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relational-db" => Ok(SourceKind::Relational),
            "documents" => Ok(SourceKind::Document),
            "files" => Ok(SourceKind::Filesystem),
            "infrastructure" => Ok(SourceKind::Infrastructure),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStage {
    Raw,
    Compressed,
    Encrypted,
}

impl ArtifactStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStage::Raw => "raw",
            ArtifactStage::Compressed => "compressed",
            ArtifactStage::Encrypted => "encrypted",
        }
    }
}

impl FromStr for ArtifactStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ArtifactStage::Raw),
            "compressed" => Ok(ArtifactStage::Compressed),
            "encrypted" => Ok(ArtifactStage::Encrypted),
            other => Err(format!("unknown artifact stage '{other}'")),
        }
    }
}

/// One produced backup file. Never mutated after creation: each pipeline
/// stage yields a new artifact whose `parent_id` points at its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub locator: PathBuf,
    pub source_kind: SourceKind,
    pub stage: ArtifactStage,
    /// Hex-encoded SHA-256 of the file content.
    pub checksum: String,
    pub size: u64,
    pub encrypted: bool,
    pub entity_count: u64,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<String>,
}

impl Artifact {
    /// Hash a finished file and describe it. Blocking; call from `spawn_blocking`.
    pub fn from_file(
        path: &Path,
        source_kind: SourceKind,
        stage: ArtifactStage,
        entity_count: u64,
        parent: Option<&Artifact>,
    ) -> std::io::Result<Self> {
        let (checksum, size) = sha256_file(path)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            locator: path.to_path_buf(),
            source_kind,
            stage,
            checksum,
            size,
            encrypted: stage == ArtifactStage::Encrypted,
            entity_count,
            created_at: Utc::now(),
            parent_id: parent.map(|p| p.id.clone()),
        })
    }
}

/// Stream a file through SHA-256, returning the hex digest and byte count.
pub fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckClass {
    Structural,
    Decrypt,
    RestoreTest,
}

impl CheckClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckClass::Structural => "structural",
            CheckClass::Decrypt => "decrypt",
            CheckClass::RestoreTest => "restore-test",
        }
    }
}

impl FromStr for CheckClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structural" => Ok(CheckClass::Structural),
            "decrypt" => Ok(CheckClass::Decrypt),
            "restore-test" => Ok(CheckClass::RestoreTest),
            other => Err(format!("unknown check class '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub artifact_id: String,
    pub check: CheckClass,
    pub outcome: Status,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl VerificationResult {
    pub fn new(artifact_id: &str, check: CheckClass, outcome: Status, detail: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.to_string(),
            check,
            outcome,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }
}

/// One extraction of one source on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub batch_id: String,
    pub environment: String,
    pub component: SourceKind,
    pub host: String,
    pub kind: BackupKind,
    pub encrypt: bool,
    pub since: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: Status,
    pub error: Option<String>,
}

/// Record of one job's artifacts and their verification outcomes,
/// serialized as the `.manifest` sidecar next to the final artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub job: BackupJob,
    /// Lineage-ordered: raw dump first, the final artifact last.
    pub artifacts: Vec<Artifact>,
    pub verifications: Vec<VerificationResult>,
    /// Non-verification warnings raised while producing the artifacts.
    pub notes: Vec<String>,
    pub status: Status,
}

impl Manifest {
    pub const VERSION: u32 = 1;

    /// The artifact that remains on disk after the pipeline finished.
    pub fn final_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }

    /// Worst of all verification outcomes, combined with the pipeline outcome.
    pub fn aggregate(verifications: &[VerificationResult], pipeline: Status) -> Status {
        Status::worst_of(verifications.iter().map(|v| v.outcome)).worst(pipeline)
    }
}

/// Naming for one job's files: `{component}/{kind}_{server}_{timestamp}.{ext}`.
#[derive(Debug, Clone)]
pub struct ArtifactName {
    pub component: SourceKind,
    pub kind: BackupKind,
    pub server: String,
    pub timestamp: String,
}

impl ArtifactName {
    pub fn new(component: SourceKind, kind: BackupKind, server: &str, at: DateTime<Utc>) -> Self {
        Self {
            component,
            kind,
            server: sanitize(server),
            timestamp: at.format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn stem(&self) -> String {
        format!("{}_{}_{}", self.kind, self.server, self.timestamp)
    }

    /// Directory holding this component's artifacts under an environment root.
    pub fn dir(&self, environment_root: &Path) -> PathBuf {
        environment_root.join(self.component.as_str())
    }

    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{}", self.stem(), ext)
    }

    pub fn manifest_path(&self, environment_root: &Path) -> PathBuf {
        self.dir(environment_root).join(format!("{}.manifest", self.stem()))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_status_ordering() {
        assert!(Status::Fail > Status::Warning);
        assert!(Status::Warning > Status::Pass);
        assert_eq!(Status::worst_of(vec![]), Status::Pass);
        assert_eq!(
            Status::worst_of(vec![Status::Pass, Status::Warning, Status::Pass]),
            Status::Warning
        );
        assert_eq!(
            Status::worst_of(vec![Status::Warning, Status::Fail, Status::Pass]),
            Status::Fail
        );
    }

    #[test]
    fn test_manifest_aggregate_includes_pipeline_outcome() {
        let checks = vec![
            VerificationResult::new("a", CheckClass::Structural, Status::Pass, "ok"),
            VerificationResult::new("a", CheckClass::Decrypt, Status::Pass, "ok"),
        ];
        assert_eq!(Manifest::aggregate(&checks, Status::Pass), Status::Pass);
        assert_eq!(Manifest::aggregate(&checks, Status::Warning), Status::Warning);
        assert_eq!(Manifest::aggregate(&[], Status::Pass), Status::Pass);
    }

    #[test]
    fn test_artifact_name_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 30, 0).unwrap();
        let name = ArtifactName::new(SourceKind::Relational, BackupKind::Full, "db-01", at);
        assert_eq!(name.file_name("sql.zst.enc"), "full_db-01_20240301_023000.sql.zst.enc");
        let root = Path::new("/backups/prod");
        assert_eq!(name.dir(root), PathBuf::from("/backups/prod/relational-db"));
        assert_eq!(
            name.manifest_path(root),
            PathBuf::from("/backups/prod/relational-db/full_db-01_20240301_023000.manifest")
        );
    }

    #[test]
    fn test_artifact_name_sanitizes_server() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let name = ArtifactName::new(SourceKind::Filesystem, BackupKind::Incremental, "web 01/a", at);
        assert_eq!(name.server, "web-01-a");
    }

    #[test]
    fn test_artifact_from_file_hashes_content() -> std::io::Result<()> {
        let file = NamedTempFile::new()?;
        std::fs::write(file.path(), b"abc")?;
        let raw = Artifact::from_file(file.path(), SourceKind::Filesystem, ArtifactStage::Raw, 1, None)?;
        assert_eq!(raw.size, 3);
        assert_eq!(
            raw.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(!raw.encrypted);

        let child = Artifact::from_file(file.path(), SourceKind::Filesystem, ArtifactStage::Encrypted, 1, Some(&raw))?;
        assert_eq!(child.parent_id.as_deref(), Some(raw.id.as_str()));
        assert!(child.encrypted);
        Ok(())
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [BackupKind::Full, BackupKind::Incremental, BackupKind::Differential] {
            assert_eq!(kind.as_str().parse::<BackupKind>().unwrap(), kind);
        }
        for source in [
            SourceKind::Relational,
            SourceKind::Document,
            SourceKind::Filesystem,
            SourceKind::Infrastructure,
        ] {
            assert_eq!(source.as_str().parse::<SourceKind>().unwrap(), source);
        }
    }
}
