//! Typed host inventory.
//!
//! Maps role tags to host records (connection details, metadata and the data
//! sources each host carries) and resolves a requested scope into the concrete
//! work list a batch runs over. Everything is validated at load time so a
//! batch never discovers a malformed host halfway through.

use crate::model::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Infrastructure,
    Database,
    App,
    Config,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Infrastructure => "infrastructure",
            Role::Database => "database",
            Role::App => "app",
            Role::Config => "config",
        }
    }
}

/// Which part of the inventory a batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    All,
    Infrastructure,
    Database,
    Apps,
    Config,
}

impl Scope {
    pub fn includes(&self, role: Role) -> bool {
        match self {
            Scope::All => true,
            Scope::Infrastructure => role == Role::Infrastructure,
            Scope::Database => role == Role::Database,
            Scope::Apps => role == Role::App,
            Scope::Config => role == Role::Config,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::All => "all",
            Scope::Infrastructure => "infrastructure",
            Scope::Database => "database",
            Scope::Apps => "apps",
            Scope::Config => "config",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Scope::All),
            "infrastructure" => Ok(Scope::Infrastructure),
            "database" => Ok(Scope::Database),
            "apps" => Ok(Scope::Apps),
            "config" => Ok(Scope::Config),
            other => Err(format!(
                "unknown scope '{other}' (expected all, infrastructure, database, apps or config)"
            )),
        }
    }
}

/// How to reach a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConnection {
    pub address: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key for SSH authentication; agent auth is tried when unset
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".into()
}

impl HostConnection {
    pub fn local() -> Self {
        Self {
            address: "localhost".into(),
            port: default_ssh_port(),
            user: default_ssh_user(),
            key_path: None,
        }
    }

    /// Local hosts run commands directly instead of over SSH.
    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// A data source carried by a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SourceSpec {
    #[serde(rename = "relational-db")]
    Relational {
        database: String,
        /// Tables dumped by incremental runs; all tables when empty
        #[serde(default)]
        tables: Vec<String>,
        #[serde(default = "default_modified_column")]
        modified_column: String,
        #[serde(default = "default_pg_dump")]
        dump_command: String,
        #[serde(default = "default_psql")]
        query_command: String,
    },
    #[serde(rename = "documents")]
    Document {
        database: String,
        #[serde(default)]
        collections: Vec<String>,
        #[serde(default = "default_modified_field")]
        modified_field: String,
        #[serde(default = "default_mongo_uri")]
        uri: String,
        #[serde(default = "default_mongodump")]
        dump_command: String,
        #[serde(default = "default_mongosh")]
        shell_command: String,
    },
    #[serde(rename = "files")]
    Filesystem {
        paths: Vec<PathBuf>,
        /// File names containing any of these strings are skipped
        #[serde(default)]
        exclude: Vec<String>,
    },
    #[serde(rename = "infrastructure")]
    Infrastructure {
        /// Virtual machine ids archived with the hypervisor dump tool
        #[serde(default)]
        vm_ids: Vec<u32>,
        /// State/config trees archived alongside the VMs
        #[serde(default)]
        paths: Vec<PathBuf>,
    },
}

fn default_modified_column() -> String {
    "updated_at".into()
}

fn default_modified_field() -> String {
    "updatedAt".into()
}

fn default_pg_dump() -> String {
    "pg_dump".into()
}

fn default_psql() -> String {
    "psql".into()
}

fn default_mongodump() -> String {
    "mongodump".into()
}

fn default_mongosh() -> String {
    "mongosh".into()
}

fn default_mongo_uri() -> String {
    "mongodb://127.0.0.1:27017".into()
}

impl SourceSpec {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSpec::Relational { .. } => SourceKind::Relational,
            SourceSpec::Document { .. } => SourceKind::Document,
            SourceSpec::Filesystem { .. } => SourceKind::Filesystem,
            SourceSpec::Infrastructure { .. } => SourceKind::Infrastructure,
        }
    }

    /// Executables the extraction runs on the source host.
    pub fn tools(&self) -> Vec<String> {
        let program = |cmd: &str| cmd.split_whitespace().next().unwrap_or(cmd).to_string();
        match self {
            SourceSpec::Relational { dump_command, query_command, .. } => {
                vec![program(dump_command), program(query_command)]
            }
            SourceSpec::Document { dump_command, shell_command, .. } => {
                vec![program(dump_command), program(shell_command)]
            }
            SourceSpec::Filesystem { .. } => Vec::new(),
            SourceSpec::Infrastructure { vm_ids, .. } if vm_ids.is_empty() => vec!["tar".into()],
            SourceSpec::Infrastructure { .. } => vec!["vzdump".into(), "tar".into()],
        }
    }

    fn validate(&self, host: &str) -> Result<(), InventoryError> {
        let invalid = |reason: &str| InventoryError::Invalid {
            host: host.to_string(),
            reason: reason.to_string(),
        };
        match self {
            SourceSpec::Relational { database, .. } | SourceSpec::Document { database, .. } => {
                if database.trim().is_empty() {
                    return Err(invalid("database name must not be empty"));
                }
            }
            SourceSpec::Filesystem { paths, .. } => {
                if paths.is_empty() {
                    return Err(invalid("files source needs at least one path"));
                }
                if paths.iter().any(|p| !p.is_absolute()) {
                    return Err(invalid("files source paths must be absolute"));
                }
            }
            SourceSpec::Infrastructure { vm_ids, paths } => {
                if vm_ids.is_empty() && paths.is_empty() {
                    return Err(invalid("infrastructure source needs vm_ids or paths"));
                }
            }
        }
        Ok(())
    }
}

/// One host from the inventory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: String,

    #[serde(flatten)]
    pub connection: HostConnection,

    pub roles: Vec<Role>,

    #[serde(default)]
    pub sources: Vec<SourceSpec>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    hosts: Vec<HostRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Failed to read inventory {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse inventory: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid host '{host}': {reason}")]
    Invalid { host: String, reason: String },

    #[error("Duplicate host name '{0}'")]
    Duplicate(String),
}

/// A concrete unit of batch work: one source on one host.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub host: HostRecord,
    pub source: SourceSpec,
}

impl WorkItem {
    pub fn component(&self) -> SourceKind {
        self.source.kind()
    }

    /// Stable identity used to find this target's earlier backups.
    pub fn target_key(&self) -> String {
        format!("{}:{}", self.host.name, self.component())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<HostRecord>,
    by_role: BTreeMap<Role, Vec<usize>>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, InventoryError> {
        let file: InventoryFile = toml::from_str(content)?;
        Self::from_hosts(file.hosts)
    }

    pub fn from_hosts(hosts: Vec<HostRecord>) -> Result<Self, InventoryError> {
        let mut seen = HashSet::new();
        let mut by_role: BTreeMap<Role, Vec<usize>> = BTreeMap::new();

        for (idx, host) in hosts.iter().enumerate() {
            if host.name.trim().is_empty() {
                return Err(InventoryError::Invalid {
                    host: format!("#{idx}"),
                    reason: "name must not be empty".into(),
                });
            }
            if !seen.insert(host.name.clone()) {
                return Err(InventoryError::Duplicate(host.name.clone()));
            }
            if host.connection.address.trim().is_empty() {
                return Err(InventoryError::Invalid {
                    host: host.name.clone(),
                    reason: "address must not be empty".into(),
                });
            }
            if host.roles.is_empty() {
                return Err(InventoryError::Invalid {
                    host: host.name.clone(),
                    reason: "at least one role is required".into(),
                });
            }
            let mut kinds = HashSet::new();
            for source in &host.sources {
                source.validate(&host.name)?;
                // Artifact names are keyed by (component, host, time)
                if !kinds.insert(source.kind()) {
                    return Err(InventoryError::Invalid {
                        host: host.name.clone(),
                        reason: format!("more than one {} source", source.kind()),
                    });
                }
            }
            for role in &host.roles {
                by_role.entry(*role).or_default().push(idx);
            }
        }

        Ok(Self { hosts, by_role })
    }

    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn hosts_with_role(&self, role: Role) -> impl Iterator<Item = &HostRecord> {
        self.by_role
            .get(&role)
            .into_iter()
            .flatten()
            .map(move |idx| &self.hosts[*idx])
    }

    /// Expand a scope into work items, one per (host, source), in inventory order.
    /// A host matching the scope through several roles still appears once.
    pub fn resolve(&self, scope: Scope) -> Vec<WorkItem> {
        self.hosts
            .iter()
            .filter(|h| h.roles.iter().any(|r| scope.includes(*r)))
            .flat_map(|h| {
                h.sources.iter().map(move |s| WorkItem {
                    host: h.clone(),
                    source: s.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[hosts]]
name = "db-01"
address = "10.0.1.10"
user = "backup"
roles = ["database"]
[hosts.metadata]
rack = "a1"
[[hosts.sources]]
kind = "relational-db"
database = "app"
[[hosts.sources]]
kind = "files"
paths = ["/var/log/postgresql"]

[[hosts]]
name = "web-01"
address = "10.0.2.10"
roles = ["app", "config"]
[[hosts.sources]]
kind = "files"
paths = ["/srv/app", "/etc/nginx"]
exclude = [".tmp"]

[[hosts]]
name = "pve-01"
address = "10.0.0.2"
roles = ["infrastructure"]
[[hosts.sources]]
kind = "infrastructure"
vm_ids = [100, 101]
"#;

    #[test]
    fn test_load_and_resolve_scopes() {
        let inv = Inventory::from_toml(SAMPLE).unwrap();
        assert_eq!(inv.hosts().len(), 3);

        let all = inv.resolve(Scope::All);
        assert_eq!(all.len(), 4);

        let db = inv.resolve(Scope::Database);
        assert_eq!(db.len(), 2);
        assert!(db.iter().all(|w| w.host.name == "db-01"));
        assert_eq!(db[0].component(), SourceKind::Relational);

        // web-01 carries two roles but its source is listed once
        let apps = inv.resolve(Scope::Apps);
        assert_eq!(apps.len(), 1);
        let config = inv.resolve(Scope::Config);
        assert_eq!(config.len(), 1);

        let infra = inv.resolve(Scope::Infrastructure);
        assert_eq!(infra.len(), 1);
        assert_eq!(infra[0].target_key(), "pve-01:infrastructure");
    }

    #[test]
    fn test_defaults_and_metadata() {
        let inv = Inventory::from_toml(SAMPLE).unwrap();
        let db = inv.host("db-01").unwrap();
        assert_eq!(db.connection.port, 22);
        assert_eq!(db.connection.user, "backup");
        assert_eq!(db.metadata.get("rack").map(String::as_str), Some("a1"));
        match &db.sources[0] {
            SourceSpec::Relational { modified_column, dump_command, .. } => {
                assert_eq!(modified_column, "updated_at");
                assert_eq!(dump_command, "pg_dump");
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert_eq!(inv.hosts_with_role(Role::App).count(), 1);
        assert_eq!(db.sources[0].tools(), vec!["pg_dump".to_string(), "psql".to_string()]);
        assert!(db.sources[1].tools().is_empty());
    }

    #[test]
    fn test_rejects_duplicate_hosts() {
        let doc = r#"
[[hosts]]
name = "a"
address = "10.0.0.1"
roles = ["app"]
[[hosts]]
name = "a"
address = "10.0.0.2"
roles = ["app"]
"#;
        assert!(matches!(Inventory::from_toml(doc), Err(InventoryError::Duplicate(_))));
    }

    #[test]
    fn test_rejects_unknown_role() {
        let doc = r#"
[[hosts]]
name = "a"
address = "10.0.0.1"
roles = ["webserver"]
"#;
        assert!(matches!(Inventory::from_toml(doc), Err(InventoryError::Parse(_))));
    }

    #[test]
    fn test_rejects_relative_file_paths() {
        let doc = r#"
[[hosts]]
name = "a"
address = "10.0.0.1"
roles = ["app"]
[[hosts.sources]]
kind = "files"
paths = ["relative/path"]
"#;
        assert!(matches!(Inventory::from_toml(doc), Err(InventoryError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_missing_roles() {
        let doc = r#"
[[hosts]]
name = "a"
address = "10.0.0.1"
roles = []
"#;
        assert!(matches!(Inventory::from_toml(doc), Err(InventoryError::Invalid { .. })));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("apps".parse::<Scope>().unwrap(), Scope::Apps);
        assert!("everything".parse::<Scope>().is_err());
        assert!(Scope::All.includes(Role::Config));
        assert!(!Scope::Database.includes(Role::App));
    }
}
