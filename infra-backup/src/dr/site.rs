use crate::config::DrConfig;
use crate::inventory::HostConnection;
use serde::{Deserialize, Serialize};

/// One site's topology as the DR orchestrator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub name: String,

    /// Address the public DNS record points at while this site is active
    pub public_address: String,

    /// Reverse proxy serving the public entrypoints (maintenance switch)
    pub edge: HostConnection,

    /// Database host: replica on the standby site, writer on the active one
    pub database: HostConnection,

    /// Application host; the edge host when unset
    #[serde(default)]
    pub app: Option<HostConnection>,

    /// Services started on the application host after cutover
    #[serde(default)]
    pub services: Vec<String>,

    /// TCP ports that must accept connections once the site is live
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Site {
    pub fn app_host(&self) -> &HostConnection {
        self.app.as_ref().unwrap_or(&self.edge)
    }
}

impl DrConfig {
    pub fn site(&self, name: &str) -> Option<&Site> {
        [&self.primary, &self.secondary].into_iter().find(|s| s.name == name)
    }

    /// The site that is not `name`.
    pub fn other(&self, name: &str) -> &Site {
        if self.primary.name == name {
            &self.secondary
        } else {
            &self.primary
        }
    }
}
