//! Pre-failover readiness gate.
//!
//! Advisory: a FAIL blocks a failover unless it is forced, in which case the
//! override is recorded with every transition of the run.

use super::backend::DrBackend;
use super::site::Site;
use super::state::DrState;
use super::{DrError, DrStatus};
use crate::catalog::{jobs, Catalog};
use crate::config::ReadinessConfig;
use crate::model::Status;
use crate::notify::report::Report;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub name: String,
    pub status: Status,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    /// Site a failover or failback would move to
    pub target: String,
    pub status: Status,
    pub checks: Vec<ReadinessCheck>,
    pub at: DateTime<Utc>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.status != Status::Fail
    }

    /// Failed checks joined into one line.
    pub fn failures(&self) -> String {
        self.checks
            .iter()
            .filter(|c| c.status == Status::Fail)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn report(&self, environment: &str) -> Report {
        let verdict = if self.is_ready() { "READY" } else { "NOT READY" };
        let mut report = Report::new(format!("DR readiness: {verdict} (target {})", self.target), environment);
        let section = report.section("Checks");
        for c in &self.checks {
            section.row(&c.name, c.status, &c.detail);
        }
        report
    }
}

/// Everything the gate looks at besides the catalog and backend.
pub struct GateInputs<'a> {
    pub config: &'a ReadinessConfig,
    pub plan_path: &'a Path,
    pub current: &'a DrStatus,
    pub target: &'a Site,
}

pub async fn assess(
    catalog: &Catalog,
    backend: &dyn DrBackend,
    inputs: GateInputs<'_>,
    now: DateTime<Utc>,
) -> Result<ReadinessReport, DrError> {
    let mut checks = Vec::new();
    let mut check = |name: &str, status: Status, detail: String| {
        checks.push(ReadinessCheck {
            name: name.to_string(),
            status,
            detail,
        })
    };

    match inputs.current.state {
        DrState::Normal => check("dr-state", Status::Pass, format!("NORMAL, {} active", inputs.current.active_site)),
        other => check("dr-state", Status::Fail, format!("system is in {other}")),
    }

    let newest = catalog.read(jobs::newest_valid_full).await?;
    let max_age = chrono::Duration::hours(inputs.config.max_backup_age_hours);
    match newest {
        Some(e) if now - e.job.started_at <= max_age => check(
            "recent-backup",
            Status::Pass,
            format!(
                "{} full of {} taken {}",
                e.job.component,
                e.job.host,
                e.job.started_at.format("%Y-%m-%d %H:%M UTC")
            ),
        ),
        Some(e) => check(
            "recent-backup",
            Status::Fail,
            format!(
                "newest valid full backup is {}h old (limit {}h)",
                (now - e.job.started_at).num_hours(),
                inputs.config.max_backup_age_hours
            ),
        ),
        None => check("recent-backup", Status::Fail, "no valid full backup in the catalog".into()),
    }

    let target = inputs.target;
    match backend.probe(target).await {
        Ok(()) => check("reachability", Status::Pass, format!("{} reachable", target.name)),
        Err(e) => check("reachability", Status::Fail, e.to_string()),
    }

    match backend.replication_lag(target).await {
        Ok(lag) if lag <= inputs.config.max_replication_lag_secs => {
            check("replication", Status::Pass, format!("lag {lag}s"))
        }
        Ok(lag) => check(
            "replication",
            Status::Warning,
            format!("lag {lag}s exceeds {}s", inputs.config.max_replication_lag_secs),
        ),
        Err(e) => check("replication", Status::Fail, e.to_string()),
    }

    let required: Vec<PathBuf> = std::iter::once(inputs.plan_path.to_path_buf())
        .chain(inputs.config.required_artifacts.iter().cloned())
        .collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if missing.is_empty() {
        check("dr-artifacts", Status::Pass, format!("{} present", required.len()));
    } else {
        check("dr-artifacts", Status::Fail, format!("missing: {}", missing.join(", ")));
    }

    let status = Status::worst_of(checks.iter().map(|c| c.status));
    Ok(ReadinessReport {
        target: target.name.clone(),
        status,
        checks,
        at: now,
    })
}
