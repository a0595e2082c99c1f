//! Append-only catalog of jobs, artifacts, verification results, purges and
//! DR transitions, one SQLite database per environment.
//!
//! Rows are only ever inserted; triggers reject updates and deletes on every
//! table except `leases`. Derived facts (is an artifact purged, is a full
//! backup still valid) are computed from the latest rows at query time.
//! Each job also gets a JSON sidecar `.manifest` next to its final artifact.

pub mod connection;
pub mod dr;
pub mod jobs;
pub mod leases;
pub mod migrate;
pub mod purges;
pub mod verifications;

use crate::error::{BackupError, Result};
use crate::model::Manifest;
use chrono::{DateTime, SecondsFormat, Utc};
use connection::DbPool;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use jobs::CatalogEntry;
pub use leases::LeaseGuard;

/// Handle to one environment's catalog.
#[derive(Clone)]
pub struct Catalog {
    pool: DbPool,
    environment: String,
    writer: Arc<Mutex<()>>,
}

impl Catalog {
    /// Open the catalog at `path`, creating and migrating it as needed.
    pub fn open(path: &Path, environment: &str) -> anyhow::Result<Self> {
        let pool = connection::create_pool(path)?;
        migrate::migrate(&pool)?;
        tracing::debug!(path = %path.display(), environment, "Catalog opened");
        Ok(Self {
            pool,
            environment: environment.to_string(),
            writer: Arc::new(Mutex::new(())),
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Run a read on a pooled connection off the async runtime.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| BackupError::Catalog(e.to_string()))?
        .map_err(BackupError::catalog)
    }

    /// Run a write. Writers within this process are serialized; across
    /// processes the environment lease provides exclusion.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.writer.lock().await;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BackupError::Catalog(e.to_string()))?
        .map_err(BackupError::catalog)
    }

    /// Persist a finished job: catalog rows first, then the sidecar file.
    pub async fn record(&self, manifest: &Manifest, manifest_path: Option<&Path>) -> Result<()> {
        let owned = manifest.clone();
        let path = manifest_path.map(|p| p.to_string_lossy().to_string());
        self.write(move |conn| jobs::record_manifest(conn, &owned, path.as_deref()))
            .await?;

        if let Some(path) = manifest_path {
            write_sidecar(manifest, path).await?;
        }
        Ok(())
    }
}

/// Write the JSON sidecar atomically.
pub async fn write_sidecar(manifest: &Manifest, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| BackupError::Catalog(e.to_string()))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".part");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn read_sidecar(path: &Path) -> Result<Manifest> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| BackupError::Catalog(format!("{}: {e}", path.display())))
}

pub(crate) fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::{
        Artifact, ArtifactStage, BackupJob, BackupKind, CheckClass, SourceKind, Status, VerificationResult,
    };
    use tempfile::TempDir;

    pub fn open_temp() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(&dir.path().join("test.db"), "test").unwrap();
        (dir, catalog)
    }

    /// A finished job with one raw and one final compressed artifact.
    pub fn manifest(
        host: &str,
        component: SourceKind,
        kind: BackupKind,
        started_at: DateTime<Utc>,
        status: Status,
    ) -> Manifest {
        let job = BackupJob {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: "batch".into(),
            environment: "test".into(),
            component,
            host: host.into(),
            kind,
            encrypt: false,
            since: None,
            started_at,
            ended_at: Some(started_at),
            status,
            error: None,
        };
        let raw = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            locator: format!("/staging/{}/raw", job.id).into(),
            source_kind: component,
            stage: ArtifactStage::Raw,
            checksum: "00".into(),
            size: 10,
            encrypted: false,
            entity_count: 5,
            created_at: started_at,
            parent_id: None,
        };
        let final_artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            locator: format!("/backups/test/{}/{}_{host}.zst", component, job.id).into(),
            stage: ArtifactStage::Compressed,
            parent_id: Some(raw.id.clone()),
            ..raw.clone()
        };
        let verifications = vec![VerificationResult::new(
            &final_artifact.id,
            CheckClass::Structural,
            status,
            "fixture",
        )];
        Manifest {
            version: Manifest::VERSION,
            job,
            artifacts: vec![raw, final_artifact],
            verifications,
            notes: vec![],
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::{BackupKind, SourceKind, Status};

    #[tokio::test]
    async fn test_record_writes_sidecar() {
        let (dir, catalog) = open_temp();
        let manifest = manifest("db-01", SourceKind::Relational, BackupKind::Full, Utc::now(), Status::Pass);
        let sidecar = dir.path().join("relational-db/full_db-01.manifest");

        catalog.record(&manifest, Some(&sidecar)).await.unwrap();

        let loaded = read_sidecar(&sidecar).await.unwrap();
        assert_eq!(loaded.job.id, manifest.job.id);
        assert_eq!(loaded.artifacts.len(), 2);
    }

    #[tokio::test]
    async fn test_rows_are_append_only() {
        let (_dir, catalog) = open_temp();
        let manifest = manifest("db-01", SourceKind::Relational, BackupKind::Full, Utc::now(), Status::Pass);
        catalog.record(&manifest, None).await.unwrap();

        let id = manifest.job.id.clone();
        let update = catalog
            .write(move |conn| Ok(conn.execute("UPDATE jobs SET status = 'FAIL' WHERE id = ?1", [&id])?))
            .await;
        assert!(update.is_err());

        let delete = catalog
            .write(|conn| Ok(conn.execute("DELETE FROM artifacts", [])?))
            .await;
        assert!(delete.is_err());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts(&fmt_ts(a)).unwrap().timestamp_micros(), a.timestamp_micros());
    }
}
