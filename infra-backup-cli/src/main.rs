//! infra-backup - backup, verification and disaster-recovery orchestrator.
//!
//! Exit codes: 0 when everything passed or only warned, 1 when anything failed.

mod daemon;
mod shutdown;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use infra_backup::catalog::{jobs, Catalog};
use infra_backup::config::Overrides;
use infra_backup::dr::{Orchestrator, RunOptions};
use infra_backup::inventory::{Inventory, Scope};
use infra_backup::model::SourceKind;
use infra_backup::notify::report::Report;
use infra_backup::restore::{RestoreOutcome, RestoreRequest, RestoreRunner};
use infra_backup::scheduler::{BatchRequest, Scheduler};
use infra_backup::verify::{self, Verifier, VerifyOptions};
use infra_backup::{logging, retention, BackupKind, Settings, Status};
use shutdown::ShutdownCoordinator;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "infra-backup", author, version, about, long_about = None)]
struct Cli {
    /// Directory holding `{environment}.toml`
    #[arg(long, global = true, value_name = "DIR", env = "INFRA_BACKUP_CONFIG_DIR", default_value = "/etc/infra-backup")]
    config_dir: PathBuf,

    /// Environment to operate on (prod, staging, ...)
    #[arg(short, long, global = true, env = "INFRA_BACKUP_ENVIRONMENT", default_value = "prod")]
    environment: String,

    /// Override paths.backup_root
    #[arg(long, global = true, value_name = "DIR")]
    backup_root: Option<PathBuf>,

    /// Override paths.catalog_dir
    #[arg(long, global = true, value_name = "DIR")]
    catalog_dir: Option<PathBuf>,

    /// Override paths.inventory
    #[arg(long, global = true, value_name = "FILE")]
    inventory: Option<PathBuf>,

    /// Override scheduler.workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup batch
    Backup {
        /// full, incremental or differential
        kind: BackupKind,

        /// all, infrastructure, database, apps or config
        #[arg(short, long = "component", default_value = "all")]
        scope: Scope,

        #[arg(long)]
        encrypt: bool,

        /// Verify each artifact after it is produced
        #[arg(long)]
        verify: bool,

        /// Include restore tests in verification
        #[arg(long)]
        test_restore: bool,

        #[arg(long)]
        upload_remote: bool,

        /// Print the resolved work list and stop
        #[arg(long)]
        dry_run: bool,

        /// Reference time for incremental/differential runs (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
    },

    /// Re-verify the newest artifacts of a scope
    Verify {
        #[arg(long = "type", default_value = "all")]
        scope: Scope,

        #[arg(long)]
        test_restore: bool,

        /// Also write an HTML report to paths.report_dir
        #[arg(long)]
        html_report: bool,
    },

    /// Restore a database or a VM from the catalog
    Restore {
        #[command(subcommand)]
        target: RestoreTarget,
    },

    /// Failover, failback and DR readiness
    DisasterRecovery {
        #[command(subcommand)]
        action: DrAction,
    },

    /// Purge artifacts past their retention period
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },

    /// List recent backup jobs
    List {
        #[arg(long)]
        component: Option<SourceKind>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Run the configured schedules until stopped
    Daemon,
}

#[derive(Args, Debug, Clone)]
struct RestoreArgs {
    /// Job id to restore instead of the newest valid full backup
    #[arg(long)]
    backup: Option<String>,

    #[arg(long)]
    dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum RestoreTarget {
    /// Restore a host's relational or document database
    Database {
        host: String,
        #[command(flatten)]
        args: RestoreArgs,
    },
    /// Restore a virtual machine by id
    Vm {
        vmid: u32,
        #[command(flatten)]
        args: RestoreArgs,
    },
}

#[derive(Subcommand, Debug)]
enum DrAction {
    /// Move traffic and the write primary to the secondary site
    Failover {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Return traffic and the write primary to the primary site
    Failback {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the readiness gate
    ValidateDr,
    /// Enter maintenance by hand, or clear it and record the live site
    EmergencyMode {
        #[arg(long)]
        clear: bool,
        #[arg(long, requires = "clear")]
        site: Option<String>,
    },
    /// Write the Markdown DR runbook
    GeneratePlan,
    /// Show the current DR state and recent transitions
    Status,
}

fn parse_since(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{s}' is neither RFC 3339 nor YYYY-MM-DD"))
}

fn exit_for(status: Status) -> ExitCode {
    if status.is_failure() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_report(report: &Report) {
    println!("{}", report.to_text());
}

fn open_catalog(settings: &Settings) -> Result<Catalog> {
    std::fs::create_dir_all(&settings.paths.catalog_dir)
        .with_context(|| format!("creating {}", settings.paths.catalog_dir.display()))?;
    Catalog::open(&settings.catalog_path(), &settings.environment)
        .with_context(|| format!("opening catalog {}", settings.catalog_path().display()))
}

fn load_inventory(settings: &Settings) -> Result<Arc<Inventory>> {
    let inventory = Inventory::load(&settings.paths.inventory)
        .with_context(|| format!("loading inventory {}", settings.paths.inventory.display()))?;
    Ok(Arc::new(inventory))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }

    let cli = Cli::parse();
    let overrides = Overrides {
        backup_root: cli.backup_root.clone(),
        catalog_dir: cli.catalog_dir.clone(),
        inventory: cli.inventory.clone(),
        workers: cli.workers,
        log_level: cli.log_level.clone(),
    };
    let settings = Settings::resolve(&cli.config_dir, &cli.environment, &overrides)
        .with_context(|| format!("resolving settings for '{}'", cli.environment))?;
    logging::init(&settings.log.level)?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %settings.environment,
        "infra-backup starting"
    );

    let settings = Arc::new(settings);
    match cli.command {
        Command::Backup {
            kind,
            scope,
            encrypt,
            verify,
            test_restore,
            upload_remote,
            dry_run,
            since,
        } => {
            let request = BatchRequest {
                encrypt,
                verify: verify || test_restore,
                restore_test: test_restore,
                upload_remote,
                dry_run,
                since,
                ..BatchRequest::new(kind, scope)
            };
            backup(settings, request).await
        }
        Command::Verify {
            scope,
            test_restore,
            html_report,
        } => verify_cmd(&settings, scope, test_restore, html_report).await,
        Command::Restore { target } => restore(settings, target).await,
        Command::DisasterRecovery { action } => disaster_recovery(&settings, action).await,
        Command::Cleanup { dry_run } => cleanup(&settings, dry_run).await,
        Command::List { component, limit } => list(&settings, component, limit).await,
        Command::Daemon => {
            let shutdown = ShutdownCoordinator::new();
            let scheduler = Scheduler::new(settings.clone(), load_inventory(&settings)?, open_catalog(&settings)?)
                .with_cancel(shutdown.token());
            daemon::run(Arc::new(scheduler), &settings.schedules, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn backup(settings: Arc<Settings>, request: BatchRequest) -> Result<ExitCode> {
    let cancel = ShutdownCoordinator::new().listen();
    let scheduler = Scheduler::new(settings.clone(), load_inventory(&settings)?, open_catalog(&settings)?)
        .with_cancel(cancel);

    let result = scheduler.run_batch(&request).await?;
    print_report(&result.report());
    Ok(exit_for(result.status()))
}

async fn verify_cmd(settings: &Settings, scope: Scope, restore_test: bool, html: bool) -> Result<ExitCode> {
    let catalog = open_catalog(settings)?;
    let verifier = Verifier::standard(settings);
    let options = VerifyOptions::from_settings(settings, restore_test);

    let outcome = verify::reverify(&catalog, &verifier, scope, &options).await?;
    print_report(&outcome.report);

    if html {
        let path = report_path(settings, "verify");
        outcome
            .report
            .write_html(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("HTML report: {}", path.display());
    }
    Ok(exit_for(outcome.status()))
}

fn report_path(settings: &Settings, prefix: &str) -> PathBuf {
    settings.paths.report_dir.join(format!(
        "{prefix}_{}_{}.html",
        settings.environment,
        Utc::now().format("%Y%m%d_%H%M%S")
    ))
}

async fn restore(settings: Arc<Settings>, target: RestoreTarget) -> Result<ExitCode> {
    let runner = RestoreRunner::new(settings.clone(), load_inventory(&settings)?, open_catalog(&settings)?);

    let (label, args) = match &target {
        RestoreTarget::Database { host, args } => (format!("database on {host}"), args.clone()),
        RestoreTarget::Vm { vmid, args } => (format!("VM {vmid}"), args.clone()),
    };
    let mut request = RestoreRequest {
        backup: args.backup,
        dry_run: args.dry_run,
        force: args.force,
    };

    if !request.dry_run && !request.force {
        let preview = run_restore(&runner, &target, &RestoreRequest { dry_run: true, ..request.clone() }).await?;
        print_restore(&preview);
        if !confirm(&format!("This overwrites the live {label}. Type 'yes' to continue: ")).await? {
            println!("Restore cancelled");
            return Ok(ExitCode::SUCCESS);
        }
        request.force = true;
    }

    let runner = runner.with_cancel(ShutdownCoordinator::new().listen());
    let outcome = run_restore(&runner, &target, &request).await?;
    print_restore(&outcome);
    Ok(ExitCode::SUCCESS)
}

async fn run_restore(
    runner: &RestoreRunner,
    target: &RestoreTarget,
    request: &RestoreRequest,
) -> infra_backup::Result<RestoreOutcome> {
    match target {
        RestoreTarget::Database { host, .. } => runner.database(host, request).await,
        RestoreTarget::Vm { vmid, .. } => runner.vm(*vmid, request).await,
    }
}

fn print_restore(outcome: &RestoreOutcome) {
    let plan = &outcome.plan;
    println!("Restore {} from job {}", plan.target, plan.job_id);
    println!("  artifact: {}", plan.artifact.display());
    for (i, step) in plan.steps.iter().enumerate() {
        println!("  {}. {step}", i + 1);
    }
    if outcome.executed {
        match outcome.entity_count {
            Some(n) => println!("Restored ({n} entities)"),
            None => println!("Restored"),
        }
    } else {
        println!("Dry run: nothing was changed");
    }
}

async fn confirm(prompt: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("refusing to restore without --force on a non-interactive terminal");
    }
    let prompt = prompt.to_string();
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        use std::io::Write;
        print!("{prompt}");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(answer.trim() == "yes")
}

async fn disaster_recovery(settings: &Settings, action: DrAction) -> Result<ExitCode> {
    let orchestrator = Orchestrator::from_settings(settings, open_catalog(settings)?)?;
    let env = settings.environment.as_str();

    match action {
        DrAction::Failover { force, dry_run } => {
            let run = orchestrator.failover(RunOptions { force, dry_run }).await?;
            print_report(&run.report(env));
            Ok(exit_for(run.status()))
        }
        DrAction::Failback { force, dry_run } => {
            let run = orchestrator.failback(RunOptions { force, dry_run }).await?;
            print_report(&run.report(env));
            Ok(exit_for(run.status()))
        }
        DrAction::ValidateDr => {
            let readiness = orchestrator.validate().await?;
            print_report(&readiness.report(env));
            Ok(if readiness.is_ready() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        DrAction::EmergencyMode { clear, site } => {
            let status = orchestrator.emergency_mode(clear, site.as_deref()).await?;
            println!("DR state: {} (active site {})", status.state, status.active_site);
            Ok(ExitCode::SUCCESS)
        }
        DrAction::GeneratePlan => {
            let path = orchestrator.generate_plan().await?;
            println!("DR plan written to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        DrAction::Status => {
            let status = orchestrator.status().await?;
            println!("DR state: {}", status.state);
            println!("Active site: {}", status.active_site);
            match orchestrator.last_readiness().await? {
                Some((level, at)) => println!("Last readiness check: {level} at {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last readiness check: never"),
            }

            let history = orchestrator.history(10).await?;
            if !history.is_empty() {
                println!("\nRecent transitions:");
            }
            for t in history {
                println!(
                    "  {}  {:<8} {} -> {} ({}){}{}",
                    t.at.format("%Y-%m-%d %H:%M:%S"),
                    t.operation.as_str(),
                    t.from,
                    t.to,
                    t.outcome,
                    if t.forced { " [forced]" } else { "" },
                    if t.detail.is_empty() { String::new() } else { format!(": {}", t.detail) }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn cleanup(settings: &Settings, dry_run: bool) -> Result<ExitCode> {
    let catalog = open_catalog(settings)?;
    let outcome = retention::run(&catalog, &settings.retention, dry_run).await?;
    print_report(&outcome.report(&settings.environment));
    Ok(exit_for(outcome.status()))
}

async fn list(settings: &Settings, component: Option<SourceKind>, limit: usize) -> Result<ExitCode> {
    let catalog = open_catalog(settings)?;
    let recent = catalog
        .read(move |conn| jobs::recent_jobs(conn, component, limit))
        .await?;

    if recent.is_empty() {
        println!("No backup jobs recorded for {}", settings.environment);
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:<36}  {:<14}  {:<16}  {:<12}  {:<20}  STATUS",
        "JOB", "COMPONENT", "HOST", "KIND", "STARTED"
    );
    for job in recent {
        println!(
            "{:<36}  {:<14}  {:<16}  {:<12}  {:<20}  {}",
            job.id,
            job.component.as_str(),
            job.host,
            job.kind.as_str(),
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            job.status
        );
    }
    Ok(ExitCode::SUCCESS)
}
