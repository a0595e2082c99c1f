//! Staged artifact pipeline: raw extraction -> zstd -> optional encryption.
//!
//! Every stage writes to a `.part` file in the destination directory and
//! renames it into place, so a crash never leaves a half-written artifact
//! under its final name. A stage's input is removed only after its output
//! exists. Encryption problems downgrade the job to a warning and keep the
//! compressed artifact as the final one.

pub mod crypto;

use crate::adapters::RawExtract;
use crate::error::{BackupError, Result};
use crate::model::{Artifact, ArtifactName, ArtifactStage, SourceKind, Status};
use crate::secret::Secret;
use async_compression::tokio::bufread::ZstdEncoder;
use crypto::{CryptoError, KdfParams};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub encrypt: bool,
    pub passphrase: Option<Secret>,
    pub kdf: KdfParams,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Lineage-ordered; the last entry is the artifact left on disk.
    pub artifacts: Vec<Artifact>,
    pub notes: Vec<String>,
    pub status: Status,
}

impl PipelineOutput {
    pub fn final_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }
}

/// Run a raw extraction through the pipeline, placing outputs under `dir`.
pub async fn run(
    raw: &RawExtract,
    source_kind: SourceKind,
    name: &ArtifactName,
    dir: &Path,
    options: &PipelineOptions,
    cancel: &CancellationToken,
) -> Result<PipelineOutput> {
    let mut notes = Vec::new();
    let mut status = Status::Pass;

    let raw_artifact = {
        let path = raw.path.clone();
        let count = raw.entity_count;
        blocking(move || Artifact::from_file(&path, source_kind, ArtifactStage::Raw, count, None)).await?
    };
    debug!(path = %raw.path.display(), size = raw_artifact.size, "Raw artifact recorded");

    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }

    fs::create_dir_all(dir).await?;
    let base_ext = source_kind.raw_extension();
    let compressed_path = dir.join(name.file_name(&format!("{base_ext}.zst")));
    compress(&raw.path, &compressed_path, cancel).await?;

    let compressed = {
        let path = compressed_path.clone();
        let parent = raw_artifact.clone();
        let count = raw.entity_count;
        blocking(move || Artifact::from_file(&path, source_kind, ArtifactStage::Compressed, count, Some(&parent)))
            .await?
    };
    fs::remove_file(&raw.path).await?;
    info!(
        artifact = %compressed_path.display(),
        raw_size = raw_artifact.size,
        size = compressed.size,
        "Compressed artifact written"
    );

    let mut artifacts = vec![raw_artifact, compressed];

    if options.encrypt {
        if cancel.is_cancelled() {
            let _ = fs::remove_file(&compressed_path).await;
            return Err(BackupError::Cancelled);
        }

        let encrypted_path = dir.join(name.file_name(&format!("{base_ext}.zst.enc")));
        match encrypt(&compressed_path, &encrypted_path, options).await {
            Ok(()) => {
                let path = encrypted_path.clone();
                let parent = artifacts[artifacts.len() - 1].clone();
                let count = raw.entity_count;
                let encrypted = blocking(move || {
                    Artifact::from_file(&path, source_kind, ArtifactStage::Encrypted, count, Some(&parent))
                })
                .await?;
                fs::remove_file(&compressed_path).await?;
                info!(artifact = %encrypted_path.display(), "Encrypted artifact written");
                artifacts.push(encrypted);
            }
            Err(e) => {
                let note = format!("encryption skipped: {e}");
                warn!(artifact = %compressed_path.display(), "{note}; keeping compressed artifact");
                notes.push(note);
                status = Status::Warning;
            }
        }
    }

    Ok(PipelineOutput {
        artifacts,
        notes,
        status,
    })
}

async fn compress(src: &Path, dest: &Path, cancel: &CancellationToken) -> Result<()> {
    let part = part_path(dest);
    let input = fs::File::open(src).await?;
    let mut encoder = ZstdEncoder::with_quality(BufReader::new(input), async_compression::Level::Default);
    let mut output = fs::File::create(&part).await?;

    let copied = tokio::select! {
        res = tokio::io::copy(&mut encoder, &mut output) => res,
        _ = cancel.cancelled() => {
            drop(output);
            let _ = fs::remove_file(&part).await;
            return Err(BackupError::Cancelled);
        }
    };

    if let Err(e) = copied {
        let _ = fs::remove_file(&part).await;
        return Err(e.into());
    }
    output.flush().await?;
    output.sync_all().await?;
    fs::rename(&part, dest).await?;
    Ok(())
}

async fn encrypt(src: &Path, dest: &Path, options: &PipelineOptions) -> std::result::Result<(), CryptoError> {
    let passphrase = options.passphrase.clone().ok_or(CryptoError::MissingKey)?;
    let part = part_path(dest);
    let kdf = options.kdf;

    let (src, task_part) = (src.to_path_buf(), part.clone());
    let sealed = tokio::task::spawn_blocking(move || crypto::encrypt_file(&src, &task_part, &passphrase, kdf))
        .await
        .map_err(|e| CryptoError::Io(std::io::Error::other(e)))
        .and_then(|r| r);

    match sealed {
        Ok(()) => {
            fs::rename(&part, dest).await?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            Err(e)
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Turn a final artifact back into its raw form at `dest`, decrypting and
/// decompressing as its extension requires. Blocking.
pub fn materialize(
    artifact: &Path,
    dest: &Path,
    passphrase: Option<&Secret>,
    kdf: KdfParams,
) -> Result<()> {
    let name = artifact.to_string_lossy();
    let output = std::fs::File::create(dest)?;

    if name.ends_with(".enc") {
        let passphrase = passphrase.ok_or_else(|| BackupError::EncryptionFailed(CryptoError::MissingKey.to_string()))?;
        let mut decoder = zstd::stream::write::Decoder::new(output)?;
        crypto::decrypt_to(artifact, &mut decoder, passphrase, kdf)
            .map_err(|e| BackupError::VerificationFailed(e.to_string()))?;
        std::io::Write::flush(&mut decoder)?;
    } else if name.ends_with(".zst") {
        zstd::stream::copy_decode(std::fs::File::open(artifact)?, output)?;
    } else {
        drop(output);
        std::fs::copy(artifact, dest)?;
    }
    Ok(())
}

/// Run blocking file work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
        .map_err(BackupError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackupKind;
    use chrono::Utc;
    use tempfile::TempDir;

    const FAST: KdfParams = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    fn raw_file(dir: &TempDir, content: &[u8]) -> RawExtract {
        let path = dir.path().join("staging-raw.sql");
        std::fs::write(&path, content).unwrap();
        RawExtract { path, entity_count: 3 }
    }

    fn options(encrypt: bool, passphrase: Option<&str>) -> PipelineOptions {
        PipelineOptions {
            encrypt,
            passphrase: passphrase.map(Secret::new),
            kdf: FAST,
        }
    }

    #[tokio::test]
    async fn test_compress_only_lineage() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let raw = raw_file(&staging, b"COPY t FROM stdin;\n1\n2\n3\n\\.\n");
        let name = ArtifactName::new(SourceKind::Relational, BackupKind::Full, "db-01", Utc::now());

        let result = run(&raw, SourceKind::Relational, &name, out.path(), &options(false, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, Status::Pass);
        assert_eq!(result.artifacts.len(), 2);
        let last = result.final_artifact().unwrap();
        assert_eq!(last.stage, ArtifactStage::Compressed);
        assert_eq!(last.parent_id.as_deref(), Some(result.artifacts[0].id.as_str()));
        assert!(last.locator.to_string_lossy().ends_with(".sql.zst"));
        assert!(last.locator.exists());
        assert!(!raw.path.exists());
    }

    #[tokio::test]
    async fn test_encrypted_output_replaces_plaintext() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let raw = raw_file(&staging, b"payload");
        let name = ArtifactName::new(SourceKind::Relational, BackupKind::Full, "db-01", Utc::now());

        let result = run(&raw, SourceKind::Relational, &name, out.path(), &options(true, Some("pw")), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.artifacts.len(), 3);
        let last = result.final_artifact().unwrap();
        assert!(last.encrypted);
        assert!(last.locator.to_string_lossy().ends_with(".sql.zst.enc"));
        assert!(!result.artifacts[1].locator.exists());

        let restored = out.path().join("restored.sql");
        materialize(&last.locator, &restored, Some(&Secret::new("pw")), FAST).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_missing_passphrase_keeps_compressed_with_warning() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let raw = raw_file(&staging, b"payload");
        let name = ArtifactName::new(SourceKind::Filesystem, BackupKind::Full, "web-01", Utc::now());

        let result = run(&raw, SourceKind::Filesystem, &name, out.path(), &options(true, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, Status::Warning);
        assert_eq!(result.notes.len(), 1);
        let last = result.final_artifact().unwrap();
        assert_eq!(last.stage, ArtifactStage::Compressed);
        assert!(last.locator.exists());
        let leftovers: Vec<_> = std::fs::read_dir(out.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_compression() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let raw = raw_file(&staging, b"payload");
        let name = ArtifactName::new(SourceKind::Filesystem, BackupKind::Full, "web-01", Utc::now());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run(&raw, SourceKind::Filesystem, &name, out.path(), &options(false, None), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
    }

    #[test]
    fn test_materialize_rejects_encrypted_without_key() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("a");
        let enc = dir.path().join("a.zst.enc");
        std::fs::write(&plain, b"x").unwrap();
        crypto::encrypt_file(&plain, &enc, &Secret::new("k"), FAST).unwrap();
        let err = materialize(&enc, &dir.path().join("out"), None, FAST).unwrap_err();
        assert!(matches!(err, BackupError::EncryptionFailed(_)));
    }
}
