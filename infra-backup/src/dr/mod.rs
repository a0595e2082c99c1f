//! Disaster-recovery orchestration.
//!
//! Failover and failback are explicit state machines driven one transition
//! at a time. Each transition is recorded in the catalog before the next one
//! starts, so the latest row is always the system's DR state. The first
//! failed step moves the system to `FAILOVER_FAILED` and stops: maintenance
//! mode stays on and nothing is rolled back. Only an operator clears it.

pub mod backend;
pub mod plan;
pub mod readiness;
pub mod site;
pub mod state;

use crate::catalog::dr::{self as records, TransitionRecord};
use crate::catalog::{jobs, leases, Catalog};
use crate::config::{DrConfig, Settings};
use crate::error::BackupError;
use crate::exec::ExecError;
use crate::model::Status;
use crate::notify::report::Report;
use crate::notify::Notifier;
use backend::{DrBackend, RemoteDrBackend};
use chrono::{DateTime, Utc};
use readiness::{GateInputs, ReadinessReport};
use serde::Serialize;
use site::Site;
use state::{DrState, Operation};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum DrError {
    #[error("Disaster recovery is not configured for environment {0}")]
    NotConfigured(String),

    #[error("{operation} refused: {reason}")]
    Refused { operation: Operation, reason: String },

    #[error("Illegal {operation} transition {from} -> {to}")]
    IllegalTransition {
        operation: Operation,
        from: DrState,
        to: DrState,
    },

    #[error("Readiness gate failed: {0}")]
    NotReady(String),

    #[error("Unknown site '{0}'")]
    UnknownSite(String),

    #[error("Remote command failed: {0}")]
    Command(String),

    #[error("DNS update failed: {0}")]
    Dns(String),

    #[error("Site validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl From<ExecError> for DrError {
    fn from(err: ExecError) -> Self {
        DrError::Command(err.to_string())
    }
}

impl From<std::io::Error> for DrError {
    fn from(err: std::io::Error) -> Self {
        DrError::Backup(BackupError::Io(err))
    }
}

/// Current DR state, derived from the latest recorded transition.
#[derive(Debug, Clone, Serialize)]
pub struct DrStatus {
    pub state: DrState,
    pub active_site: String,
    pub last: Option<TransitionRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Proceed even when the readiness gate fails
    pub force: bool,
    /// Report the planned transitions without touching any site
    pub dry_run: bool,
}

/// Outcome of one failover or failback.
#[derive(Debug, Clone, Serialize)]
pub struct DrRun {
    pub run_id: String,
    pub operation: Operation,
    pub from_site: String,
    pub to_site: String,
    pub dry_run: bool,
    pub forced: bool,
    pub readiness: Option<ReadinessReport>,
    pub planned: Vec<DrState>,
    pub transitions: Vec<TransitionRecord>,
    pub final_state: DrState,
    pub failed_step: Option<DrState>,
    pub error: Option<String>,
}

impl DrRun {
    pub fn status(&self) -> Status {
        if self.error.is_some() {
            Status::Fail
        } else if self.forced {
            Status::Warning
        } else {
            Status::worst_of(self.transitions.iter().map(|t| t.outcome))
        }
    }

    pub fn report(&self, environment: &str) -> Report {
        let verdict = match (self.dry_run, &self.error) {
            (true, _) => "DRY RUN",
            (false, Some(_)) => "FAILED",
            (false, None) => "COMPLETED",
        };
        let mut report = Report::new(
            format!("DR {} {} -> {}: {verdict}", self.operation, self.from_site, self.to_site),
            environment,
        );

        if let Some(r) = &self.readiness {
            let section = report.section("Readiness gate");
            for c in &r.checks {
                section.row(&c.name, c.status, &c.detail);
            }
            if self.forced {
                section.row("override", Status::Warning, "gate failed; run forced by operator");
            }
        }

        if self.dry_run {
            let section = report.section("Planned transitions");
            for state in &self.planned {
                section.row(state.as_str(), Status::Pass, "planned");
            }
        } else {
            let section = report.section("Transitions");
            for t in &self.transitions {
                let mut detail = if t.detail.is_empty() { "ok".to_string() } else { t.detail.clone() };
                if t.forced {
                    detail.push_str(" (forced)");
                }
                section.row(format!("{} -> {}", t.from, t.to), t.outcome, detail);
            }
        }
        report
    }
}

pub struct Orchestrator {
    environment: String,
    config: DrConfig,
    plan_path: PathBuf,
    catalog: Catalog,
    backend: Arc<dyn DrBackend>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(settings: &Settings, catalog: Catalog, backend: Arc<dyn DrBackend>) -> Result<Self, DrError> {
        let config = settings
            .dr
            .clone()
            .ok_or_else(|| DrError::NotConfigured(settings.environment.clone()))?;
        Ok(Self {
            environment: settings.environment.clone(),
            config,
            plan_path: settings.paths.dr_plan.clone(),
            catalog,
            backend,
            notifier: Notifier::from_settings(settings),
        })
    }

    /// Orchestrator backed by SSH commands and the DNS API.
    pub fn from_settings(settings: &Settings, catalog: Catalog) -> Result<Self, DrError> {
        let config = settings
            .dr
            .as_ref()
            .ok_or_else(|| DrError::NotConfigured(settings.environment.clone()))?;
        let backend = RemoteDrBackend::new(config, &settings.timeouts)?;
        Self::new(settings, catalog, Arc::new(backend))
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn plan_path(&self) -> &Path {
        &self.plan_path
    }

    pub async fn status(&self) -> Result<DrStatus, DrError> {
        let last = self.catalog.read(records::last_transition).await?;
        Ok(match last {
            Some(t) => DrStatus {
                state: t.to,
                active_site: t.active_site.clone(),
                last: Some(t),
            },
            None => DrStatus {
                state: DrState::Normal,
                active_site: self.config.primary.name.clone(),
                last: None,
            },
        })
    }

    /// Recorded transitions, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<TransitionRecord>, DrError> {
        Ok(self.catalog.read(move |conn| records::recent_transitions(conn, limit)).await?)
    }

    /// Status and time of the last readiness assessment.
    pub async fn last_readiness(&self) -> Result<Option<(Status, DateTime<Utc>)>, DrError> {
        let snapshot = self.catalog.read(records::latest_readiness).await?;
        Ok(snapshot.map(|(status, _, at)| (status, at)))
    }

    /// Run the readiness gate against the standby site and record the snapshot.
    pub async fn validate(&self) -> Result<ReadinessReport, DrError> {
        let status = self.status().await?;
        let target = self.config.other(&status.active_site).clone();
        let report = self.assess(&status, &target, None).await?;
        match report.status {
            Status::Fail => warn!(target = %report.target, failures = %report.failures(), "DR NOT READY"),
            _ => info!(target = %report.target, status = %report.status, "DR ready"),
        }
        Ok(report)
    }

    pub async fn failover(&self, options: RunOptions) -> Result<DrRun, DrError> {
        self.run(Operation::Failover, options).await
    }

    pub async fn failback(&self, options: RunOptions) -> Result<DrRun, DrError> {
        self.run(Operation::Failback, options).await
    }

    async fn run(&self, op: Operation, options: RunOptions) -> Result<DrRun, DrError> {
        if options.dry_run {
            let status = self.status().await?;
            let (from, to) = self.endpoints(op, &status)?;
            info!(operation = %op, from = %from.name, to = %to.name, "Dry run: no site will be touched");
            return Ok(self.new_run(op, from, to, options, status.state));
        }

        let lease = self
            .catalog
            .acquire_lease(&leases::dr_scope(&self.environment), self.config.lease_ttl_secs)
            .await?;
        let outcome = self.execute(op, options).await;
        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release DR lease");
        }
        outcome
    }

    fn new_run(&self, op: Operation, from: &Site, to: &Site, options: RunOptions, state: DrState) -> DrRun {
        DrRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            operation: op,
            from_site: from.name.clone(),
            to_site: to.name.clone(),
            dry_run: options.dry_run,
            forced: false,
            readiness: None,
            planned: op.steps().to_vec(),
            transitions: Vec::new(),
            final_state: state,
            failed_step: None,
            error: None,
        }
    }

    /// Source and destination sites, if `op` may start from `status`.
    fn endpoints(&self, op: Operation, status: &DrStatus) -> Result<(&Site, &Site), DrError> {
        let refuse = |reason: String| DrError::Refused { operation: op, reason };
        if status.state != DrState::Normal {
            return Err(refuse(format!(
                "DR state is {}; resolve it and clear with emergency-mode --clear --site <site>",
                status.state
            )));
        }
        let (primary, secondary) = (&self.config.primary, &self.config.secondary);
        match op {
            Operation::Failover if status.active_site == primary.name => Ok((primary, secondary)),
            Operation::Failover => Err(refuse(format!("{} is already active; use failback", status.active_site))),
            Operation::Failback if status.active_site == secondary.name => Ok((secondary, primary)),
            Operation::Failback => Err(refuse(format!(
                "no failover to revert: {} is already active",
                status.active_site
            ))),
            Operation::Manual => Err(refuse("use emergency-mode".into())),
        }
    }

    async fn execute(&self, op: Operation, options: RunOptions) -> Result<DrRun, DrError> {
        let status = self.status().await?;
        let (from, to) = self.endpoints(op, &status)?;
        let mut run = self.new_run(op, from, to, options, status.state);

        let report = self.assess(&status, to, Some(&run.run_id)).await?;
        if !report.is_ready() {
            if !options.force {
                let failures = report.failures();
                self.notifier
                    .error(&format!("DR {op} refused"), &format!("readiness gate failed: {failures}"))
                    .await;
                return Err(DrError::NotReady(failures));
            }
            warn!(operation = %op, failures = %report.failures(), "Readiness gate failed; proceeding because the run is forced");
            run.forced = true;
        }
        run.readiness = Some(report);

        info!(run_id = %run.run_id, operation = %op, from = %from.name, to = %to.name, forced = run.forced, "DR run started");

        let mut current = DrState::Normal;
        let mut active = from.name.clone();
        for step in op.steps() {
            op.check_transition(current, *step)?;
            info!(run_id = %run.run_id, state = %step, "Entering DR state");

            match self.enter(op, *step, from, to).await {
                Ok(notes) => {
                    if *step == DrState::DnsCutover {
                        active = to.name.clone();
                    }
                    let outcome = if notes.is_empty() { Status::Pass } else { Status::Warning };
                    self.record(&mut run, current, *step, outcome, notes.join("; "), &active).await?;
                    current = *step;
                }
                Err(e) => {
                    let detail = format!("{step} failed: {e}");
                    error!(run_id = %run.run_id, state = %step, error = %e, "DR step failed; halting with maintenance on");
                    op.check_transition(current, DrState::FailoverFailed)?;
                    self.record(&mut run, current, DrState::FailoverFailed, Status::Fail, detail.clone(), &active)
                        .await?;
                    run.final_state = DrState::FailoverFailed;
                    run.failed_step = Some(*step);
                    run.error = Some(detail.clone());
                    self.notifier
                        .error(
                            &format!("DR {op} failed"),
                            &format!(
                                "{detail}. Maintenance mode stays on. Recover by hand, then run emergency-mode --clear --site <site>."
                            ),
                        )
                        .await;
                    return Ok(run);
                }
            }
        }

        run.final_state = current;
        let forced = if run.forced { " (readiness override)" } else { "" };
        self.notifier
            .success(&format!("DR {op} completed"), &format!("{} is now active{forced}", to.name))
            .await;
        Ok(run)
    }

    /// Perform the side effects of entering `state`. Returns warnings for
    /// best-effort actions that did not succeed.
    async fn enter(&self, op: Operation, state: DrState, from: &Site, to: &Site) -> Result<Vec<String>, DrError> {
        let mut notes = Vec::new();
        match state {
            DrState::EmergencyMode => {
                self.backend.set_maintenance(to, true).await?;
                if let Err(e) = self.backend.set_maintenance(from, true).await {
                    warn!(site = %from.name, error = %e, "Could not enable maintenance on the source site");
                    notes.push(format!("maintenance on {} not confirmed: {e}", from.name));
                }
            }
            DrState::Resyncing => self.backend.resync_database(to, from).await?,
            DrState::DbPromoting => {
                self.backend.promote_database(to).await?;
                if op == Operation::Failback {
                    self.backend.demote_database(from, to).await?;
                }
            }
            DrState::DnsCutover => self.backend.update_dns(to).await?,
            DrState::ServicesStarting => self.backend.start_services(to).await?,
            DrState::Validating => self.backend.validate_site(to).await?,
            DrState::Normal => self.backend.set_maintenance(to, false).await?,
            DrState::FailoverFailed => {}
        }
        Ok(notes)
    }

    async fn record(
        &self,
        run: &mut DrRun,
        from: DrState,
        to: DrState,
        outcome: Status,
        detail: String,
        active_site: &str,
    ) -> Result<(), DrError> {
        let t = TransitionRecord {
            run_id: run.run_id.clone(),
            operation: run.operation,
            from,
            to,
            outcome,
            detail,
            forced: run.forced,
            active_site: active_site.to_string(),
            at: Utc::now(),
        };
        self.persist(t.clone()).await?;
        run.transitions.push(t);
        Ok(())
    }

    async fn persist(&self, t: TransitionRecord) -> Result<(), DrError> {
        self.catalog
            .write(move |conn| records::insert_transition(conn, &t))
            .await?;
        Ok(())
    }

    async fn assess(&self, status: &DrStatus, target: &Site, run_id: Option<&str>) -> Result<ReadinessReport, DrError> {
        let inputs = GateInputs {
            config: &self.config.readiness,
            plan_path: &self.plan_path,
            current: status,
            target,
        };
        let report = readiness::assess(&self.catalog, self.backend.as_ref(), inputs, Utc::now()).await?;

        let json = serde_json::to_string(&report).map_err(|e| BackupError::Catalog(e.to_string()))?;
        let (run_id, level, at) = (run_id.map(str::to_string), report.status, report.at);
        self.catalog
            .write(move |conn| records::insert_readiness(conn, run_id.as_deref(), level, &json, at))
            .await?;
        Ok(report)
    }

    /// Enter emergency mode by hand, or clear it and record which site is live.
    pub async fn emergency_mode(&self, clear: bool, site: Option<&str>) -> Result<DrStatus, DrError> {
        let lease = self
            .catalog
            .acquire_lease(&leases::dr_scope(&self.environment), self.config.lease_ttl_secs)
            .await?;
        let outcome = self.manual(clear, site).await;
        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release DR lease");
        }
        outcome?;
        self.status().await
    }

    async fn manual(&self, clear: bool, site: Option<&str>) -> Result<(), DrError> {
        let status = self.status().await?;
        let op = Operation::Manual;
        let lookup = |name: &str| {
            self.config
                .site(name)
                .ok_or_else(|| DrError::UnknownSite(name.to_string()))
        };

        let (target, to, active) = if clear {
            let name = site.ok_or_else(|| DrError::Refused {
                operation: op,
                reason: "--site is required to clear emergency mode".into(),
            })?;
            let target = lookup(name)?;
            op.check_transition(status.state, DrState::Normal)?;
            self.backend.set_maintenance(target, false).await?;
            (target, DrState::Normal, target.name.clone())
        } else {
            let target = lookup(site.unwrap_or(status.active_site.as_str()))?;
            op.check_transition(status.state, DrState::EmergencyMode)?;
            self.backend.set_maintenance(target, true).await?;
            (target, DrState::EmergencyMode, status.active_site.clone())
        };

        let detail = format!("set by operator on {}", target.name);
        self.persist(TransitionRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            operation: op,
            from: status.state,
            to,
            outcome: Status::Pass,
            detail,
            forced: false,
            active_site: active.clone(),
            at: Utc::now(),
        })
        .await?;

        self.notifier
            .warning(
                &format!("DR state {to}"),
                &format!("{} -> {to} by operator, {active} active", status.state),
            )
            .await;
        Ok(())
    }

    /// Render the runbook to `paths.dr_plan`.
    pub async fn generate_plan(&self) -> Result<PathBuf, DrError> {
        let status = self.status().await?;
        let newest = self.catalog.read(jobs::newest_valid_full).await?;
        let markdown = plan::render(&self.environment, &self.config, &status, newest.as_ref(), Utc::now());

        if let Some(parent) = self.plan_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.plan_path.as_os_str().to_os_string();
        tmp.push(".part");
        tokio::fs::write(&tmp, markdown).await?;
        tokio::fs::rename(&tmp, &self.plan_path).await?;
        info!(path = %self.plan_path.display(), "DR plan written");
        Ok(self.plan_path.clone())
    }
}
