//! Age-based purge of final artifacts.
//!
//! Each backup kind has its own maximum age. Before anything is deleted the
//! catalog is consulted for the newest valid full backup of every target;
//! that artifact is never purged, whatever its age, unless
//! `retention.protect_latest_full` is switched off. A failed delete is a
//! warning and the pass carries on with the next candidate.

use crate::catalog::{jobs, purges, Catalog, CatalogEntry};
use crate::config::RetentionConfig;
use crate::error::{BackupError, Result};
use crate::model::Status;
use crate::notify::report::Report;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::ErrorKind;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetentionPlan {
    /// Past their kind's maximum age and not protected
    pub expired: Vec<CatalogEntry>,
    /// Past their maximum age but the newest valid full of their target
    pub protected: Vec<CatalogEntry>,
}

/// Decide what to purge. `latest_valid_full` holds the artifact ids of each
/// target's newest valid full backup.
pub fn plan(
    entries: Vec<CatalogEntry>,
    latest_valid_full: &HashSet<String>,
    policy: &RetentionConfig,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let mut expired = Vec::new();
    let mut protected = Vec::new();

    for entry in entries {
        let age = now - entry.job.started_at;
        if age <= policy.max_age(entry.job.kind) {
            continue;
        }
        if policy.protect_latest_full && latest_valid_full.contains(&entry.artifact.id) {
            protected.push(entry);
        } else {
            expired.push(entry);
        }
    }

    RetentionPlan { expired, protected }
}

#[derive(Debug)]
pub struct RetentionOutcome {
    pub dry_run: bool,
    pub purged: Vec<CatalogEntry>,
    pub protected: Vec<CatalogEntry>,
    pub failed: Vec<(CatalogEntry, BackupError)>,
}

impl RetentionOutcome {
    pub fn status(&self) -> Status {
        if self.failed.is_empty() {
            Status::Pass
        } else {
            Status::Warning
        }
    }

    pub fn report(&self, environment: &str) -> Report {
        let title = if self.dry_run { "Retention (dry run)" } else { "Retention" };
        let mut report = Report::new(title, environment);
        let section = report.section("Artifacts");
        let verb = if self.dry_run { "would purge" } else { "purged" };
        for e in &self.purged {
            section.row(e.artifact.locator.display().to_string(), Status::Pass, format!("{verb} ({} {})", e.job.kind, e.job.started_at.format("%Y-%m-%d")));
        }
        for e in &self.protected {
            section.row(e.artifact.locator.display().to_string(), Status::Pass, "kept: newest valid full backup of its target");
        }
        for (e, err) in &self.failed {
            section.row(e.artifact.locator.display().to_string(), Status::Warning, err.to_string());
        }
        if self.purged.is_empty() && self.protected.is_empty() && self.failed.is_empty() {
            section.row("catalog", Status::Pass, "nothing past its retention period");
        }
        report
    }
}

/// Run one retention pass over the environment's catalog.
pub async fn run(catalog: &Catalog, policy: &RetentionConfig, dry_run: bool) -> Result<RetentionOutcome> {
    if !policy.protect_latest_full {
        warn!("Latest-full protection is disabled; purging by age only");
    }

    let (entries, protected_ids) = catalog
        .read(|conn| {
            let entries = jobs::live_final_artifacts(conn)?;
            let mut targets = HashSet::new();
            let mut latest = HashSet::new();
            for e in &entries {
                if targets.insert((e.job.host.clone(), e.job.component)) {
                    if let Some(full) = jobs::latest_valid_full(conn, &e.job.host, e.job.component)? {
                        latest.insert(full.artifact.id);
                    }
                }
            }
            Ok((entries, latest))
        })
        .await?;

    let plan = plan(entries, &protected_ids, policy, Utc::now());
    for e in &plan.protected {
        info!(
            artifact = %e.artifact.locator.display(),
            host = %e.job.host,
            component = %e.job.component,
            "Keeping expired artifact: newest valid full backup"
        );
    }

    let mut outcome = RetentionOutcome {
        dry_run,
        purged: Vec::new(),
        protected: plan.protected,
        failed: Vec::new(),
    };

    for entry in plan.expired {
        if dry_run {
            info!(artifact = %entry.artifact.locator.display(), "Would purge");
            outcome.purged.push(entry);
            continue;
        }

        match purge_one(catalog, &entry).await {
            Ok(()) => {
                info!(
                    artifact = %entry.artifact.locator.display(),
                    kind = %entry.job.kind,
                    "Purged expired artifact"
                );
                outcome.purged.push(entry);
            }
            Err(e) => {
                warn!(artifact = %entry.artifact.locator.display(), error = %e, "Purge failed; continuing");
                outcome.failed.push((entry, e));
            }
        }
    }

    Ok(outcome)
}

async fn purge_one(catalog: &Catalog, entry: &CatalogEntry) -> Result<()> {
    let locator = entry.artifact.locator.clone();
    let delete_err = |reason: String| BackupError::RetentionDelete {
        path: locator.display().to_string(),
        reason,
    };

    let reason = match tokio::fs::remove_file(&locator).await {
        Ok(()) => "expired",
        Err(e) if e.kind() == ErrorKind::NotFound => "expired (already missing)",
        Err(e) => return Err(delete_err(e.to_string())),
    };

    if let Some(sidecar) = &entry.manifest_path {
        if let Err(e) = tokio::fs::remove_file(sidecar).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(manifest = %sidecar, error = %e, "Could not remove sidecar manifest");
            }
        }
    }

    let (id, path) = (entry.artifact.id.clone(), locator.to_string_lossy().to_string());
    catalog
        .write(move |conn| purges::record(conn, &id, &path, reason))
        .await
        .map_err(|e| delete_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::{manifest, open_temp};
    use crate::model::{BackupKind, SourceKind};
    use chrono::Duration;

    fn entry_from(m: &crate::model::Manifest) -> CatalogEntry {
        CatalogEntry {
            job: m.job.clone(),
            artifact: m.artifacts[1].clone(),
            manifest_path: None,
        }
    }

    #[test]
    fn test_plan_protects_latest_full() {
        let now = Utc::now();
        let old_full = manifest("db-01", SourceKind::Relational, BackupKind::Full, now - Duration::days(90), Status::Pass);
        let older_full = manifest("db-01", SourceKind::Relational, BackupKind::Full, now - Duration::days(120), Status::Pass);
        let old_inc = manifest("db-01", SourceKind::Relational, BackupKind::Incremental, now - Duration::days(10), Status::Pass);
        let fresh_inc = manifest("db-01", SourceKind::Relational, BackupKind::Incremental, now - Duration::days(1), Status::Pass);

        let entries = vec![entry_from(&older_full), entry_from(&old_full), entry_from(&old_inc), entry_from(&fresh_inc)];
        let latest: HashSet<String> = [old_full.artifacts[1].id.clone()].into();

        let policy = RetentionConfig::default();
        let result = plan(entries.clone(), &latest, &policy, now);
        let expired: Vec<_> = result.expired.iter().map(|e| e.job.id.clone()).collect();
        assert_eq!(expired, vec![older_full.job.id.clone(), old_inc.job.id.clone()]);
        assert_eq!(result.protected.len(), 1);
        assert_eq!(result.protected[0].job.id, old_full.job.id);

        // Age-only mode purges the newest full too
        let age_only = RetentionConfig {
            protect_latest_full: false,
            ..RetentionConfig::default()
        };
        let result = plan(entries, &latest, &age_only, now);
        assert_eq!(result.expired.len(), 3);
        assert!(result.protected.is_empty());
    }

    #[tokio::test]
    async fn test_run_deletes_files_and_records_purges() {
        let (dir, catalog) = open_temp();
        let now = Utc::now();

        let mut full = manifest("fs-01", SourceKind::Filesystem, BackupKind::Full, now - Duration::days(60), Status::Pass);
        let mut inc = manifest("fs-01", SourceKind::Filesystem, BackupKind::Incremental, now - Duration::days(30), Status::Pass);
        for (m, name) in [(&mut full, "full.tar.zst"), (&mut inc, "inc.tar.zst")] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"data").unwrap();
            m.artifacts[1].locator = path;
            catalog.record(m, None).await.unwrap();
        }

        let dry = run(&catalog, &RetentionConfig::default(), true).await.unwrap();
        assert_eq!(dry.purged.len(), 1);
        assert!(inc.artifacts[1].locator.exists());

        let outcome = run(&catalog, &RetentionConfig::default(), false).await.unwrap();
        assert_eq!(outcome.status(), Status::Pass);
        assert_eq!(outcome.purged.len(), 1);
        assert_eq!(outcome.purged[0].job.id, inc.job.id);
        assert_eq!(outcome.protected.len(), 1);
        assert!(!inc.artifacts[1].locator.exists());
        assert!(full.artifacts[1].locator.exists());

        let id = inc.artifacts[1].id.clone();
        assert!(catalog.read(move |conn| purges::is_purged(conn, &id)).await.unwrap());

        // A second pass has nothing left to purge
        let again = run(&catalog, &RetentionConfig::default(), false).await.unwrap();
        assert!(again.purged.is_empty());
    }

    #[tokio::test]
    async fn test_failed_full_is_not_protected() {
        let (dir, catalog) = open_temp();
        let now = Utc::now();
        let mut failed = manifest("db-01", SourceKind::Document, BackupKind::Full, now - Duration::days(40), Status::Fail);
        let path = dir.path().join("failed.bson.tar.zst");
        std::fs::write(&path, b"x").unwrap();
        failed.artifacts[1].locator = path.clone();
        catalog.record(&failed, None).await.unwrap();

        let outcome = run(&catalog, &RetentionConfig::default(), false).await.unwrap();
        assert_eq!(outcome.purged.len(), 1);
        assert!(!path.exists());
    }
}
