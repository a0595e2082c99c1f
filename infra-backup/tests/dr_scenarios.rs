mod common;

use async_trait::async_trait;
use infra_backup::config::{DnsConfig, DrCommands, DrConfig, ReadinessConfig};
use infra_backup::dr::backend::DrBackend;
use infra_backup::dr::site::Site;
use infra_backup::dr::state::{DrState, Operation};
use infra_backup::dr::{DrError, Orchestrator, RunOptions};
use infra_backup::inventory::{HostConnection, Scope};
use infra_backup::notify::Notifier;
use infra_backup::scheduler::BatchRequest;
use infra_backup::{BackupKind, Settings, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Two sites held in memory. `broken` names the operation that fails.
#[derive(Default)]
struct FakeSites {
    broken: Option<&'static str>,
    maintenance: Mutex<HashMap<String, bool>>,
    dns_target: Mutex<Option<String>>,
}

impl FakeSites {
    fn broken(op: &'static str) -> Self {
        Self {
            broken: Some(op),
            ..Self::default()
        }
    }

    fn check(&self, op: &str) -> Result<(), DrError> {
        if self.broken == Some(op) {
            return Err(DrError::Dns(format!("{op}: provider returned 503")));
        }
        Ok(())
    }

    fn in_maintenance(&self, site: &str) -> bool {
        self.maintenance.lock().unwrap().get(site).copied().unwrap_or(false)
    }
}

#[async_trait]
impl DrBackend for FakeSites {
    async fn probe(&self, _site: &Site) -> Result<(), DrError> {
        self.check("probe")
    }
    async fn replication_lag(&self, _site: &Site) -> Result<u64, DrError> {
        self.check("lag").map(|_| 1)
    }
    async fn set_maintenance(&self, site: &Site, on: bool) -> Result<(), DrError> {
        self.check("maintenance")?;
        self.maintenance.lock().unwrap().insert(site.name.clone(), on);
        Ok(())
    }
    async fn promote_database(&self, _site: &Site) -> Result<(), DrError> {
        self.check("promote")
    }
    async fn resync_database(&self, _site: &Site, _source: &Site) -> Result<(), DrError> {
        self.check("resync")
    }
    async fn demote_database(&self, _site: &Site, _source: &Site) -> Result<(), DrError> {
        self.check("demote")
    }
    async fn update_dns(&self, site: &Site) -> Result<(), DrError> {
        self.check("dns")?;
        *self.dns_target.lock().unwrap() = Some(site.public_address.clone());
        Ok(())
    }
    async fn start_services(&self, _site: &Site) -> Result<(), DrError> {
        self.check("services")
    }
    async fn validate_site(&self, _site: &Site) -> Result<(), DrError> {
        self.check("validate")
    }
}

fn site(name: &str, address: &str) -> Site {
    let host = HostConnection {
        address: address.into(),
        ..HostConnection::local()
    };
    Site {
        name: name.into(),
        public_address: address.into(),
        edge: host.clone(),
        database: host,
        app: None,
        services: vec!["app.service".into()],
        ports: vec![443],
    }
}

fn dr_settings(root: &std::path::Path) -> Settings {
    let mut settings = common::settings(root, "IBK_IT_PASSPHRASE_UNSET");
    settings.dr = Some(DrConfig {
        primary: site("primary", "203.0.113.10"),
        secondary: site("secondary", "198.51.100.20"),
        dns: DnsConfig {
            api_url: "http://127.0.0.1:9".into(),
            zone: "example.com".into(),
            record: "app.example.com".into(),
            ttl: 60,
            token_env: "IBK_IT_DNS_TOKEN".into(),
        },
        readiness: ReadinessConfig::default(),
        commands: DrCommands::default(),
        lease_ttl_secs: 600,
    });
    settings
}

struct Env {
    _root: TempDir,
    _files: TempDir,
    settings: Settings,
}

/// An environment with one fresh valid full backup and a generated DR plan.
async fn ready_env() -> Env {
    let root = TempDir::new().unwrap();
    let files = common::old_source_tree();
    let settings = dr_settings(root.path());
    let sched = common::scheduler(settings.clone(), common::files_inventory(files.path()));
    let result = sched
        .run_batch(&BatchRequest::new(BackupKind::Full, Scope::All))
        .await
        .unwrap();
    assert_eq!(result.status(), Status::Pass);
    Env {
        _root: root,
        _files: files,
        settings,
    }
}

async fn orchestrator(settings: &Settings, backend: Arc<FakeSites>) -> Orchestrator {
    let dr = Orchestrator::new(settings, common::open_catalog(settings), backend)
        .unwrap()
        .with_notifier(Notifier::log_only("it"));
    dr.generate_plan().await.unwrap();
    dr
}

#[tokio::test]
async fn test_dns_failure_halts_in_failover_failed() {
    let env = ready_env().await;
    let sites = Arc::new(FakeSites::broken("dns"));
    let dr = orchestrator(&env.settings, sites.clone()).await;

    let ready = dr.validate().await.unwrap();
    assert!(ready.is_ready(), "{}", ready.failures());

    let run = dr.failover(RunOptions::default()).await.unwrap();
    assert_eq!(run.status(), Status::Fail);
    assert_eq!(run.final_state, DrState::FailoverFailed);
    assert_eq!(run.failed_step, Some(DrState::DnsCutover));
    let reached: Vec<DrState> = run.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        reached,
        vec![DrState::EmergencyMode, DrState::DbPromoting, DrState::FailoverFailed]
    );

    // No rollback: both sites stay behind the maintenance page
    assert!(sites.in_maintenance("primary"));
    assert!(sites.in_maintenance("secondary"));
    assert!(sites.dns_target.lock().unwrap().is_none());

    let status = dr.status().await.unwrap();
    assert_eq!(status.state, DrState::FailoverFailed);
    assert!(status.state.in_maintenance());
    assert_eq!(status.active_site, "primary");

    let gate = dr.validate().await.unwrap();
    assert!(!gate.is_ready());
    assert!(gate.failures().contains("dr-state"));
    assert!(gate.report("it").to_text().contains("NOT READY"));

    // Nothing moves until an operator clears the state
    assert!(matches!(
        dr.failover(RunOptions::default()).await,
        Err(DrError::Refused { .. })
    ));
    let cleared = dr.emergency_mode(true, Some("primary")).await.unwrap();
    assert_eq!(cleared.state, DrState::Normal);
    assert_eq!(cleared.active_site, "primary");
    assert!(!sites.in_maintenance("primary"));
}

#[tokio::test]
async fn test_forced_failover_records_the_override() {
    // No backups at all: the gate fails on recent-backup
    let root = TempDir::new().unwrap();
    let settings = dr_settings(root.path());
    let sites = Arc::new(FakeSites::default());
    let dr = orchestrator(&settings, sites.clone()).await;

    let refused = dr.failover(RunOptions::default()).await;
    assert!(matches!(refused, Err(DrError::NotReady(ref why)) if why.contains("recent-backup")));
    assert_eq!(dr.status().await.unwrap().state, DrState::Normal);

    let run = dr
        .failover(RunOptions {
            force: true,
            dry_run: false,
        })
        .await
        .unwrap();
    assert!(run.forced);
    assert_eq!(run.status(), Status::Warning);
    assert_eq!(run.final_state, DrState::Normal);
    assert!(run.transitions.iter().all(|t| t.forced));
    assert!(run.report("it").to_text().contains("override"));

    let status = dr.status().await.unwrap();
    assert_eq!(status.active_site, "secondary");
    assert!(status.last.unwrap().forced);
    assert_eq!(sites.dns_target.lock().unwrap().as_deref(), Some("198.51.100.20"));
}

#[tokio::test]
async fn test_failback_from_normal_is_rejected() {
    let env = ready_env().await;
    let dr = orchestrator(&env.settings, Arc::new(FakeSites::default())).await;

    match dr.failback(RunOptions::default()).await {
        Err(DrError::Refused { operation, reason }) => {
            assert_eq!(operation, Operation::Failback);
            assert!(reason.contains("no failover to revert"));
        }
        other => panic!("expected refusal, got {other:?}"),
    }

    // Dry runs are refused the same way and record nothing
    assert!(dr
        .failback(RunOptions {
            force: false,
            dry_run: true
        })
        .await
        .is_err());
    let status = dr.status().await.unwrap();
    assert_eq!(status.state, DrState::Normal);
    assert!(status.last.is_none());
}

#[tokio::test]
async fn test_failover_then_failback_round_trip() {
    let env = ready_env().await;
    let sites = Arc::new(FakeSites::default());
    let dr = orchestrator(&env.settings, sites.clone()).await;

    let preview = dr
        .failover(RunOptions {
            force: false,
            dry_run: true,
        })
        .await
        .unwrap();
    assert_eq!(preview.planned, Operation::Failover.steps());
    assert!(preview.transitions.is_empty());
    assert!(sites.maintenance.lock().unwrap().is_empty());

    let over = dr.failover(RunOptions::default()).await.unwrap();
    assert_eq!(over.status(), Status::Pass);
    assert_eq!(dr.status().await.unwrap().active_site, "secondary");

    let back = dr.failback(RunOptions::default()).await.unwrap();
    assert_eq!(back.status(), Status::Pass);
    let reached: Vec<DrState> = back.transitions.iter().map(|t| t.to).collect();
    assert_eq!(reached, Operation::Failback.steps());
    assert_eq!(dr.status().await.unwrap().active_site, "primary");
    assert_eq!(sites.dns_target.lock().unwrap().as_deref(), Some("203.0.113.10"));
    assert!(!sites.in_maintenance("primary"));
}
