mod common;

use chrono::{TimeZone, Utc};
use infra_backup::catalog::jobs;
use infra_backup::inventory::Scope;
use infra_backup::model::{CheckClass, SourceKind};
use infra_backup::adapters::AdapterRegistry;
use infra_backup::scheduler::BatchRequest;
use infra_backup::{BackupKind, Status};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PASSPHRASE: &str = "correct horse battery staple";

#[tokio::test]
async fn test_encrypted_verified_full_across_three_servers() {
    std::env::set_var("IBK_IT_PASSPHRASE_FULL", PASSPHRASE);
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_FULL");
    let sched = common::scheduler(settings, common::three_server_inventory(files.path()));

    let mut request = BatchRequest::new(BackupKind::Full, Scope::All);
    request.encrypt = true;
    request.verify = true;
    let result = sched.run_batch(&request).await.unwrap();

    assert_eq!(result.jobs.len(), 3);
    assert_eq!(result.status(), Status::Pass);
    for job in &result.jobs {
        let m = &job.manifest;
        assert_eq!(m.status, Status::Pass, "{}: {:?}", job.target, m.verifications);

        let last = m.final_artifact().unwrap();
        assert!(last.encrypted);
        assert!(last.locator.exists());
        assert!(last.locator.to_string_lossy().ends_with(".enc"));
        // Only the final artifact survives the pipeline
        assert!(m.artifacts[..m.artifacts.len() - 1].iter().all(|a| !a.locator.exists()));

        let checks: Vec<CheckClass> = m.verifications.iter().map(|v| v.check).collect();
        assert!(checks.contains(&CheckClass::Structural));
        assert!(checks.contains(&CheckClass::Decrypt));

        let sidecar = std::fs::read_to_string(job.manifest_path.as_ref().unwrap()).unwrap();
        assert!(!sidecar.contains(PASSPHRASE));
    }

    let by_component: Vec<SourceKind> = {
        let mut v: Vec<SourceKind> = result.jobs.iter().map(|j| j.manifest.job.component).collect();
        v.sort_by_key(|k| k.as_str());
        v
    };
    assert_eq!(
        by_component,
        vec![SourceKind::Document, SourceKind::Filesystem, SourceKind::Relational]
    );

    let recorded = sched
        .catalog()
        .read(|conn| jobs::recent_jobs(conn, None, 10))
        .await
        .unwrap();
    assert_eq!(recorded.len(), 3);
    assert!(recorded.iter().all(|j| j.status == Status::Pass));
    assert_eq!(std::fs::read_dir(root.path().join("staging")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_incremental_over_unchanged_source_warns() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let sched = common::scheduler(settings, common::files_inventory(files.path()));

    let mut request = BatchRequest::new(BackupKind::Incremental, Scope::All);
    request.since = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    request.verify = true;
    let result = sched.run_batch(&request).await.unwrap();

    assert_eq!(result.jobs.len(), 1);
    let m = &result.jobs[0].manifest;
    assert_eq!(m.status, Status::Warning);
    assert_eq!(m.final_artifact().unwrap().entity_count, 0);
    assert!(m.final_artifact().unwrap().locator.exists());
    assert!(!m.notes.is_empty());
    assert_eq!(m.job.since, request.since);

    // Warnings never fail the batch
    assert_eq!(result.status(), Status::Warning);
    assert!(!result.status().is_failure());
}

#[tokio::test]
async fn test_missing_passphrase_degrades_to_warning() {
    std::env::remove_var("IBK_IT_PASSPHRASE_MISSING");
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_MISSING");
    let sched = common::scheduler(settings, common::files_inventory(files.path()));

    let mut request = BatchRequest::new(BackupKind::Full, Scope::Apps);
    request.encrypt = true;
    let result = sched.run_batch(&request).await.unwrap();

    let m = &result.jobs[0].manifest;
    assert_eq!(m.status, Status::Warning);
    let last = m.final_artifact().unwrap();
    assert!(!last.encrypted);
    assert!(last.locator.exists());
}

#[tokio::test]
async fn test_scope_selects_database_hosts_only() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let sched = common::scheduler(settings, common::three_server_inventory(files.path()));

    let result = sched
        .run_batch(&BatchRequest::new(BackupKind::Full, Scope::Database))
        .await
        .unwrap();
    let mut hosts: Vec<&str> = result.jobs.iter().map(|j| j.manifest.job.host.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, vec!["db-01", "docs-01"]);
    assert_eq!(result.status(), Status::Pass);
}

#[tokio::test]
async fn test_repeated_incremental_with_same_since_is_stable() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let sched = common::scheduler(settings, common::files_inventory(files.path()));

    let mut request = BatchRequest::new(BackupKind::Incremental, Scope::All);
    request.since = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
    let first = sched.run_batch(&request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = sched.run_batch(&request).await.unwrap();

    let count = |r: &infra_backup::scheduler::BatchResult| r.jobs[0].manifest.final_artifact().unwrap().entity_count;
    assert_eq!(count(&first), 2);
    assert_eq!(count(&first), count(&second));
    assert_eq!(second.status(), Status::Pass);
}

#[tokio::test]
async fn test_one_unreachable_host_fails_only_its_job() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let mut adapters = common::canned_registry();
    adapters.register(Arc::new(common::UnreachableHost {
        inner: common::CannedAdapter {
            kind: SourceKind::Relational,
            entities: 3,
        },
        host: "db-01",
    }));
    let sched = common::scheduler_with(settings, common::three_server_inventory(files.path()), adapters);

    let mut request = BatchRequest::new(BackupKind::Full, Scope::All);
    request.verify = true;
    let result = sched.run_batch(&request).await.unwrap();

    assert_eq!(result.jobs.len(), 3);
    for job in &result.jobs {
        let m = &job.manifest;
        if m.job.host == "db-01" {
            assert_eq!(m.status, Status::Fail);
            assert!(m.artifacts.is_empty());
            assert!(m.job.error.as_deref().unwrap().contains("connection refused"));
        } else {
            assert_eq!(m.status, Status::Pass, "{}", job.target);
            assert!(m.final_artifact().unwrap().locator.exists());
        }
    }
    assert_eq!(result.status(), Status::Fail);

    let recorded = sched
        .catalog()
        .read(|conn| jobs::recent_jobs(conn, None, 10))
        .await
        .unwrap();
    assert_eq!(recorded.len(), 3);
    assert_eq!(recorded.iter().filter(|j| j.status == Status::Fail).count(), 1);
}

#[tokio::test]
async fn test_cancel_mid_extraction_removes_host_scratch_dir() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let seen = Arc::new(Mutex::new(None));
    let mut adapters = AdapterRegistry::standard();
    adapters.register(Arc::new(common::HangingAdapter { seen: Arc::clone(&seen) }));

    let cancel = CancellationToken::new();
    let sched = common::scheduler_with(settings, common::files_inventory(files.path()), adapters)
        .with_cancel(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        sched.run_batch(&BatchRequest::new(BackupKind::Full, Scope::All)),
    )
    .await
    .expect("batch stops once cancelled")
    .unwrap();

    assert_eq!(result.jobs.len(), 1);
    assert_eq!(result.jobs[0].manifest.status, Status::Fail);
    let dir = seen.lock().unwrap().clone().expect("extraction had started");
    assert!(!Path::new(&dir).exists());
    assert_eq!(std::fs::read_dir(root.path().join("staging")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_panicking_job_is_recorded_as_failure() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let mut adapters = AdapterRegistry::standard();
    adapters.register(Arc::new(common::PanickingAdapter));
    let sched = common::scheduler_with(settings, common::files_inventory(files.path()), adapters);

    let result = sched
        .run_batch(&BatchRequest::new(BackupKind::Full, Scope::All))
        .await
        .unwrap();

    assert_eq!(result.jobs.len(), 1);
    let m = &result.jobs[0].manifest;
    assert_eq!(m.status, Status::Fail);
    assert!(m.job.error.as_deref().unwrap().starts_with("job task aborted"));
    assert_eq!(result.status(), Status::Fail);

    let recorded = sched
        .catalog()
        .read(|conn| jobs::recent_jobs(conn, None, 10))
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, Status::Fail);
}
