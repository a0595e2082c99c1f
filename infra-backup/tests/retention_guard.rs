mod common;

use infra_backup::catalog::jobs;
use infra_backup::inventory::Scope;
use infra_backup::model::SourceKind;
use infra_backup::retention;
use infra_backup::scheduler::BatchRequest;
use infra_backup::{BackupKind, Status};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_expired_fulls_keep_the_newest_valid_one() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    let mut policy = settings.retention.clone();
    let sched = common::scheduler(settings, common::files_inventory(files.path()));

    let request = BatchRequest::new(BackupKind::Full, Scope::All);
    let first = sched.run_batch(&request).await.unwrap();
    // Artifact names carry a seconds timestamp
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = sched.run_batch(&request).await.unwrap();

    let old = first.jobs[0].manifest.final_artifact().unwrap().clone();
    let new = second.jobs[0].manifest.final_artifact().unwrap().clone();
    assert_ne!(old.locator, new.locator);

    // Everything is past its age limit
    policy.full_days = 0;
    policy.protect_latest_full = true;

    let preview = retention::run(sched.catalog(), &policy, true).await.unwrap();
    assert_eq!(preview.purged.len(), 1);
    assert!(old.locator.exists());

    let outcome = retention::run(sched.catalog(), &policy, false).await.unwrap();
    assert_eq!(outcome.status(), Status::Pass);
    assert_eq!(outcome.purged.len(), 1);
    assert_eq!(outcome.purged[0].artifact.id, old.id);
    assert_eq!(outcome.protected.len(), 1);
    assert_eq!(outcome.protected[0].artifact.id, new.id);
    assert!(!old.locator.exists());
    assert!(!first.jobs[0].manifest_path.as_ref().unwrap().exists());
    assert!(new.locator.exists());

    let latest = sched
        .catalog()
        .read(|conn| jobs::latest_valid_full(conn, "files-01", SourceKind::Filesystem))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.artifact.id, new.id);

    // A second pass has nothing left to do but keep the guarded artifact
    let again = retention::run(sched.catalog(), &policy, false).await.unwrap();
    assert!(again.purged.is_empty());
    assert_eq!(again.protected.len(), 1);

    // With the guard off the last full goes too (dry run leaves it on disk)
    policy.protect_latest_full = false;
    let unguarded = retention::run(sched.catalog(), &policy, true).await.unwrap();
    assert_eq!(unguarded.purged.len(), 1);
    assert!(unguarded.protected.is_empty());
    assert!(new.locator.exists());
}

#[tokio::test]
async fn test_retention_runs_after_batch_when_configured() {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let mut settings = common::settings(root.path(), "IBK_IT_PASSPHRASE_UNSET");
    settings.retention.run_after_backup = true;
    let sched = common::scheduler(settings, common::files_inventory(files.path()));

    let result = sched
        .run_batch(&BatchRequest::new(BackupKind::Full, Scope::All))
        .await
        .unwrap();
    let retention = result.retention.as_ref().unwrap();
    assert!(retention.purged.is_empty());
    assert_eq!(result.status(), Status::Pass);
}
