//! Data source adapters.
//!
//! Each adapter turns one source on one host into a raw local file in the
//! job's staging directory and reports how many entities (rows, documents,
//! files, VMs) it captured. Full extractions take everything; incremental and
//! differential ones only take entities modified at or after `since`.

pub mod document;
pub mod filesystem;
pub mod infrastructure;
pub mod relational;

use crate::config::TimeoutConfig;
use crate::error::Result;
use crate::exec::{shell_quote, HostExec};
use crate::inventory::{HostRecord, SourceSpec};
use crate::model::{BackupKind, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ExtractRequest<'a> {
    pub host: &'a HostRecord,
    pub source: &'a SourceSpec,
    pub kind: BackupKind,
    pub since: Option<DateTime<Utc>>,
    /// Local file the raw extraction is written to
    pub dest: PathBuf,
    pub timeouts: &'a TimeoutConfig,
    /// Fires when the batch is cancelled; remote scratch space is still removed
    pub cancel: CancellationToken,
}

impl ExtractRequest<'_> {
    /// Reference time for change filtering; `None` means take everything.
    pub fn change_filter(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            BackupKind::Full => None,
            BackupKind::Incremental | BackupKind::Differential => self.since,
        }
    }

    /// Directory for intermediate pieces next to the destination.
    pub fn scratch_dir(&self) -> &Path {
        self.dest.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[derive(Debug, Clone)]
pub struct RawExtract {
    pub path: PathBuf,
    pub entity_count: u64,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn extract(&self, exec: &dyn HostExec, request: &ExtractRequest<'_>) -> Result<RawExtract>;
}

/// Adapters by source kind.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn standard() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(relational::RelationalAdapter));
        registry.register(Arc::new(document::DocumentAdapter));
        registry.register(Arc::new(filesystem::FilesystemAdapter));
        registry.register(Arc::new(infrastructure::InfrastructureAdapter));
        registry
    }

    /// Add or replace the adapter for its kind.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

/// Timestamp literal accepted by SQL, `find -newermt` and JSON dates.
pub(crate) fn since_literal(since: DateTime<Utc>) -> String {
    since.format("%Y-%m-%d %H:%M:%S+00:00").to_string()
}

/// Shell pipeline that archives regular files under `paths` into `archive`,
/// listing them NUL-separated in `list`, and prints the file count.
pub(crate) fn find_and_tar_command(
    paths: &[PathBuf],
    exclude: &[String],
    since: Option<DateTime<Utc>>,
    list: &str,
    archive: &str,
) -> String {
    let roots: Vec<String> = paths
        .iter()
        .map(|p| shell_quote(&p.to_string_lossy()))
        .collect();

    let mut find = format!("find {} -type f", roots.join(" "));
    if let Some(since) = since {
        find.push_str(&format!(" -newermt {}", shell_quote(&since_literal(since))));
    }
    for pattern in exclude {
        find.push_str(&format!(" ! -name {}", shell_quote(&format!("*{pattern}*"))));
    }

    format!(
        "{find} -print0 > {list} && tar --null -T {list} -cf {archive} && tr -cd '\\000' < {list} | wc -c",
        list = shell_quote(list),
        archive = shell_quote(archive),
    )
}
