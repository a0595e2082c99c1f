//! Configuration management.
//!
//! Settings resolve in layers: command-line overrides, then environment
//! variables (`INFRA_BACKUP_` prefix, `__` between nested keys, e.g.
//! `INFRA_BACKUP_RETENTION__FULL_DAYS=45`), then the per-environment TOML file
//! `{config_dir}/{environment}.toml`, then built-in defaults.

use crate::dr::site::Site;
use crate::inventory::Scope;
use crate::model::BackupKind;
use crate::notify::Level;
use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "INFRA_BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Environment name (prod, staging, ...). Selects the config file and catalog.
    pub environment: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub preflight: PreflightConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub upload: Option<UploadConfig>,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub dr: Option<DrConfig>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the artifact tree; each environment gets its own subdirectory.
    pub backup_root: PathBuf,
    /// Directory holding one SQLite catalog per environment
    pub catalog_dir: PathBuf,
    /// Scratch space for raw extractions before they enter the pipeline
    pub staging_dir: PathBuf,
    pub inventory: PathBuf,
    pub report_dir: PathBuf,
    /// Location of the generated disaster-recovery runbook
    pub dr_plan: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/backups/infra"),
            catalog_dir: PathBuf::from("/var/lib/infra-backup/catalog"),
            staging_dir: PathBuf::from("/var/lib/infra-backup/staging"),
            inventory: PathBuf::from("/etc/infra-backup/inventory.toml"),
            report_dir: PathBuf::from("/var/lib/infra-backup/reports"),
            dr_plan: PathBuf::from("/var/lib/infra-backup/dr-plan.md"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub full_days: i64,
    pub incremental_days: i64,
    pub differential_days: i64,
    /// Never purge the newest valid full backup of a target, whatever its age.
    pub protect_latest_full: bool,
    /// Run a retention pass after every batch that did not fail.
    pub run_after_backup: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            full_days: 30,
            incremental_days: 7,
            differential_days: 14,
            protect_latest_full: true,
            run_after_backup: false,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self, kind: BackupKind) -> chrono::Duration {
        let days = match kind {
            BackupKind::Full => self.full_days,
            BackupKind::Incremental => self.incremental_days,
            BackupKind::Differential => self.differential_days,
        };
        chrono::Duration::days(days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Name of the environment variable holding the passphrase
    pub passphrase_env: String,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            passphrase_env: "BACKUP_ENCRYPTION_PASSPHRASE".to_string(),
            argon2_memory_kib: 19 * 1024,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

impl EncryptionConfig {
    pub fn passphrase(&self) -> Option<Secret> {
        Secret::from_env(&self.passphrase_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Parent directory for ephemeral restore-test targets
    pub scratch_dir: PathBuf,
    pub psql_command: String,
    /// Maintenance database used to create and drop throwaway restore-test databases
    pub scratch_database: String,
    pub mongorestore_command: String,
    pub mongosh_command: String,
    pub mongo_uri: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("/var/lib/infra-backup/scratch"),
            psql_command: "psql".to_string(),
            scratch_database: "postgres".to_string(),
            mongorestore_command: "mongorestore".to_string(),
            mongosh_command: "mongosh".to_string(),
            mongo_uri: "mongodb://127.0.0.1:27017".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub extract_secs: u64,
    pub transfer_secs: u64,
    pub command_secs: u64,
    pub dns_secs: u64,
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extract_secs: 3600,
            transfer_secs: 1800,
            command_secs: 300,
            dns_secs: 60,
            probe_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn extract(&self) -> Duration {
        Duration::from_secs(self.extract_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn dns(&self) -> Duration {
        Duration::from_secs(self.dns_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// Extra local tools that must be on PATH before a batch starts
    pub required_tools: Vec<String>,
    pub min_free_disk_mb: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            required_tools: Vec::new(),
            min_free_disk_mb: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent targets per batch. 1 keeps the historical sequential behavior.
    pub workers: usize,
    /// Seconds after which an environment lease is considered abandoned
    pub lease_ttl_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            lease_ttl_secs: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Object-storage client invocation. `{path}` is the local file,
    /// `{key}` its `environment/component/file` key.
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    /// Environment variable holding a bearer token for the webhook
    pub webhook_token_env: Option<String>,
    /// Lowest level forwarded to the webhook
    pub min_level: Level,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_token_env: None,
            min_level: Level::Warning,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One cron entry for daemon mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub cron: String,
    pub kind: BackupKind,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub upload_remote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrConfig {
    pub primary: Site,
    pub secondary: Site,
    pub dns: DnsConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub commands: DrCommands,

    #[serde(default = "default_dr_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Base URL of the record-management API
    pub api_url: String,
    pub zone: String,
    /// Fully-qualified public record that moves between sites
    pub record: String,
    #[serde(default = "default_dns_ttl")]
    pub ttl: u32,
    #[serde(default = "default_dns_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_backup_age_hours: i64,
    pub max_replication_lag_secs: u64,
    /// Files that must exist before a failover (the DR plan is always required)
    pub required_artifacts: Vec<PathBuf>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_backup_age_hours: 24,
            max_replication_lag_secs: 300,
            required_artifacts: Vec::new(),
        }
    }
}

/// Shell commands run on site hosts. `{service}`, `{source}` and `{address}`
/// are substituted where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrCommands {
    pub maintenance_on: String,
    pub maintenance_off: String,
    pub stop_replication: String,
    pub promote: String,
    /// Rebuild a database from `{source}` before failback
    pub resync: String,
    /// Put the old primary database back into standby, replicating from `{source}`
    pub demote: String,
    pub start_service: String,
    pub service_active: String,
    /// Prints replication lag in whole seconds
    pub replication_lag: String,
}

impl Default for DrCommands {
    fn default() -> Self {
        Self {
            maintenance_on: "sudo touch /etc/nginx/maintenance.on && sudo systemctl reload nginx".to_string(),
            maintenance_off: "sudo rm -f /etc/nginx/maintenance.on && sudo systemctl reload nginx".to_string(),
            stop_replication: "sudo -u postgres psql -tAc \"ALTER SYSTEM RESET primary_conninfo\" && sudo -u postgres psql -tAc \"SELECT pg_reload_conf()\"".to_string(),
            promote: "sudo -u postgres psql -tAc \"SELECT pg_promote()\"".to_string(),
            resync: concat!(
                "sudo systemctl stop postgresql",
                " && sudo -u postgres rm -rf /var/lib/postgresql/data.resync",
                " && sudo -u postgres pg_basebackup -h {source} -U replicator -D /var/lib/postgresql/data.resync -X stream -R",
                " && sudo -u postgres rm -rf /var/lib/postgresql/data",
                " && sudo -u postgres mv /var/lib/postgresql/data.resync /var/lib/postgresql/data",
                " && sudo systemctl start postgresql"
            )
            .to_string(),
            demote: concat!(
                "sudo -u postgres psql -tAc \"ALTER SYSTEM SET primary_conninfo = 'host={source} user=replicator'\"",
                " && sudo -u postgres touch /var/lib/postgresql/data/standby.signal",
                " && sudo systemctl restart postgresql"
            )
            .to_string(),
            start_service: "sudo systemctl start {service}".to_string(),
            service_active: "systemctl is-active {service}".to_string(),
            replication_lag: "sudo -u postgres psql -tAc \"SELECT COALESCE(EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp()), 0)::int\"".to_string(),
        }
    }
}

// Default values
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dr_lease_ttl_secs() -> i64 {
    2 * 3600
}

fn default_dns_ttl() -> u32 {
    60
}

fn default_dns_token_env() -> String {
    "DNS_API_TOKEN".to_string()
}

/// Values given on the command line; they win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backup_root: Option<PathBuf>,
    pub catalog_dir: Option<PathBuf>,
    pub inventory: Option<PathBuf>,
    pub workers: Option<usize>,
    pub log_level: Option<String>,
}

impl Settings {
    /// Built-in defaults for an environment, with no file or env layers applied.
    pub fn defaults(environment: &str) -> Self {
        Settings {
            environment: environment.to_string(),
            paths: PathsConfig::default(),
            retention: RetentionConfig::default(),
            encryption: EncryptionConfig::default(),
            verification: VerificationConfig::default(),
            timeouts: TimeoutConfig::default(),
            preflight: PreflightConfig::default(),
            scheduler: SchedulerConfig::default(),
            upload: None,
            notify: NotifyConfig::default(),
            dr: None,
            log: LogConfig::default(),
            schedules: Vec::new(),
        }
    }

    /// Resolve settings for `environment` from all layers.
    pub fn resolve(config_dir: &Path, environment: &str, overrides: &Overrides) -> anyhow::Result<Self> {
        let file = config_dir.join(format!("{environment}.toml"));
        Self::resolve_from(Some(&file), environment, overrides)
    }

    pub fn resolve_from(file: Option<&Path>, environment: &str, overrides: &Overrides) -> anyhow::Result<Self> {
        if environment.is_empty() || environment.contains(['/', '\\']) {
            anyhow::bail!("invalid environment name '{environment}'");
        }

        let mut builder = config::Config::builder().set_default("environment", environment)?;

        if let Some(file) = file {
            if file.exists() {
                tracing::debug!(path = %file.display(), "Loading environment config file");
            }
            builder = builder.add_source(
                config::File::from(file.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override("environment", environment)?;

        if let Some(root) = &overrides.backup_root {
            builder = builder.set_override("paths.backup_root", root.to_string_lossy().to_string())?;
        }
        if let Some(dir) = &overrides.catalog_dir {
            builder = builder.set_override("paths.catalog_dir", dir.to_string_lossy().to_string())?;
        }
        if let Some(inv) = &overrides.inventory {
            builder = builder.set_override("paths.inventory", inv.to_string_lossy().to_string())?;
        }
        if let Some(workers) = overrides.workers {
            builder = builder.set_override("scheduler.workers", workers as i64)?;
        }
        if let Some(level) = &overrides.log_level {
            builder = builder.set_override("log.level", level.clone())?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.workers == 0 {
            anyhow::bail!("scheduler.workers must be at least 1");
        }
        for (name, days) in [
            ("full_days", self.retention.full_days),
            ("incremental_days", self.retention.incremental_days),
            ("differential_days", self.retention.differential_days),
        ] {
            if days < 1 {
                anyhow::bail!("retention.{name} must be at least 1");
            }
        }
        if let Some(dr) = &self.dr {
            if dr.primary.name == dr.secondary.name {
                anyhow::bail!("dr.primary and dr.secondary must be distinct sites");
            }
        }
        Ok(())
    }

    /// Artifact tree for this environment.
    pub fn environment_root(&self) -> PathBuf {
        self.paths.backup_root.join(&self.environment)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.paths.catalog_dir.join(format!("{}.db", self.environment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let settings = Settings::resolve(dir.path(), "staging", &Overrides::default())?;
        assert_eq!(settings.environment, "staging");
        assert_eq!(settings.retention.full_days, 30);
        assert_eq!(settings.scheduler.workers, 1);
        assert!(settings.retention.protect_latest_full);
        assert!(settings.dr.is_none());
        Ok(())
    }

    #[test]
    fn test_file_then_flag_precedence() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(
            dir.path().join("prod.toml"),
            r#"
[paths]
backup_root = "/srv/backups"

[retention]
full_days = 60
incremental_days = 3

[scheduler]
workers = 2

[[schedules]]
name = "nightly"
cron = "0 0 2 * * *"
kind = "full"
scope = "database"
encrypt = true
"#,
        )?;

        let overrides = Overrides {
            workers: Some(4),
            ..Default::default()
        };
        let settings = Settings::resolve(dir.path(), "prod", &overrides)?;
        assert_eq!(settings.paths.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(settings.retention.full_days, 60);
        assert_eq!(settings.retention.incremental_days, 3);
        assert_eq!(settings.retention.differential_days, 14);
        assert_eq!(settings.scheduler.workers, 4);
        assert_eq!(settings.schedules.len(), 1);
        assert_eq!(settings.schedules[0].scope, Scope::Database);
        assert!(settings.schedules[0].verify);
        assert_eq!(settings.environment_root(), PathBuf::from("/srv/backups/prod"));
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_environment_name() {
        let dir = TempDir::new().unwrap();
        assert!(Settings::resolve(dir.path(), "../etc", &Overrides::default()).is_err());
        assert!(Settings::resolve(dir.path(), "", &Overrides::default()).is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            workers: Some(0),
            ..Default::default()
        };
        assert!(Settings::resolve(dir.path(), "dev", &overrides).is_err());
    }

    #[test]
    fn test_retention_max_age_per_kind() {
        let retention = RetentionConfig::default();
        assert_eq!(retention.max_age(BackupKind::Full), chrono::Duration::days(30));
        assert_eq!(retention.max_age(BackupKind::Incremental), chrono::Duration::days(7));
        assert_eq!(retention.max_age(BackupKind::Differential), chrono::Duration::days(14));
    }
}
