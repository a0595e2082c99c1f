//! Cron daemon running the configured `[[schedules]]`.

use crate::shutdown::ShutdownCoordinator;
use infra_backup::config::ScheduleConfig;
use infra_backup::scheduler::{BatchRequest, Scheduler};
use infra_backup::BackupError;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

fn request(schedule: &ScheduleConfig) -> BatchRequest {
    BatchRequest {
        encrypt: schedule.encrypt,
        verify: schedule.verify,
        upload_remote: schedule.upload_remote,
        ..BatchRequest::new(schedule.kind, schedule.scope)
    }
}

async fn run_scheduled(scheduler: Arc<Scheduler>, schedule: ScheduleConfig) {
    tracing::info!(schedule = %schedule.name, kind = %schedule.kind, scope = %schedule.scope, "Starting scheduled backup");
    match scheduler.run_batch(&request(&schedule)).await {
        Ok(result) => tracing::info!(
            schedule = %schedule.name,
            batch_id = %result.batch_id,
            status = %result.status(),
            jobs = result.jobs.len(),
            "Scheduled backup finished"
        ),
        Err(BackupError::LeaseHeld { holder, .. }) => {
            tracing::warn!(schedule = %schedule.name, holder = %holder, "Skipping scheduled run: a batch is already running");
        }
        Err(e) => tracing::error!(schedule = %schedule.name, error = %e, "Scheduled backup failed"),
    }
}

/// Register every schedule, then run until SIGINT/SIGTERM.
pub async fn run(
    scheduler: Arc<Scheduler>,
    schedules: &[ScheduleConfig],
    shutdown: ShutdownCoordinator,
) -> anyhow::Result<()> {
    if schedules.is_empty() {
        anyhow::bail!("no [[schedules]] configured for this environment");
    }

    let mut cron = JobScheduler::new().await?;
    let mut count = 0;
    for schedule in schedules {
        let scheduler = scheduler.clone();
        let entry = schedule.clone();
        let job = Job::new_async(schedule.cron.as_str(), move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            let entry = entry.clone();
            Box::pin(async move { run_scheduled(scheduler, entry).await })
        });

        match job {
            Ok(job) => {
                cron.add(job).await?;
                count += 1;
                tracing::info!(schedule = %schedule.name, cron = %schedule.cron, "Schedule registered");
            }
            Err(e) => {
                tracing::error!(schedule = %schedule.name, cron = %schedule.cron, error = %e, "Invalid cron expression")
            }
        }
    }
    if count == 0 {
        anyhow::bail!("none of the configured schedules could be registered");
    }

    cron.start().await?;
    tracing::info!(count, "Daemon started");

    shutdown.wait_for_signal().await;

    tracing::info!("Shutting down scheduler");
    if let Err(e) = cron.shutdown().await {
        tracing::warn!(error = %e, "Scheduler shutdown error");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use infra_backup::inventory::Scope;
    use infra_backup::BackupKind;

    #[test]
    fn test_request_carries_schedule_flags() {
        let schedule = ScheduleConfig {
            name: "nightly-db".into(),
            cron: "0 0 2 * * *".into(),
            kind: BackupKind::Incremental,
            scope: Scope::Database,
            encrypt: true,
            verify: false,
            upload_remote: true,
        };
        let r = request(&schedule);
        assert_eq!(r.kind, BackupKind::Incremental);
        assert_eq!(r.scope, Scope::Database);
        assert!(r.encrypt && r.upload_remote && !r.verify);
        assert!(!r.dry_run && r.since.is_none());
    }
}
