//! Side effects of DR transitions.
//!
//! The orchestrator only decides *what* happens next; everything that touches
//! a site goes through [`DrBackend`]. [`RemoteDrBackend`] runs the configured
//! command templates over SSH and talks to the DNS provider's HTTP API.

use super::site::Site;
use super::DrError;
use crate::config::{DnsConfig, DrCommands, DrConfig, TimeoutConfig};
use crate::exec::{self, shell_quote, CommandOutput};
use crate::inventory::HostConnection;
use crate::secret::Secret;
use async_trait::async_trait;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[async_trait]
pub trait DrBackend: Send + Sync {
    /// Reachability of the site's edge and database hosts.
    async fn probe(&self, site: &Site) -> Result<(), DrError>;

    /// Replication lag of the site's database replica, in seconds.
    async fn replication_lag(&self, site: &Site) -> Result<u64, DrError>;

    async fn set_maintenance(&self, site: &Site, on: bool) -> Result<(), DrError>;

    /// Stop replication and make the site's database the writer.
    async fn promote_database(&self, site: &Site) -> Result<(), DrError>;

    /// Rebuild the site's database from `source`.
    async fn resync_database(&self, site: &Site, source: &Site) -> Result<(), DrError>;

    /// Return the site's database to standby, replicating from `source`.
    async fn demote_database(&self, site: &Site, source: &Site) -> Result<(), DrError>;

    /// Point the public record at the site.
    async fn update_dns(&self, site: &Site) -> Result<(), DrError>;

    async fn start_services(&self, site: &Site) -> Result<(), DrError>;

    /// Services active, ports open and the public record resolving to the site.
    async fn validate_site(&self, site: &Site) -> Result<(), DrError>;
}

const DNS_ATTEMPTS: u32 = 3;

pub struct RemoteDrBackend {
    commands: DrCommands,
    dns: DnsConfig,
    dns_token: Option<Secret>,
    timeouts: TimeoutConfig,
    http: reqwest::Client,
}

impl RemoteDrBackend {
    pub fn new(config: &DrConfig, timeouts: &TimeoutConfig) -> Result<Self, DrError> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.dns())
            .build()
            .map_err(|e| DrError::Dns(e.to_string()))?;
        Ok(Self {
            commands: config.commands.clone(),
            dns: config.dns.clone(),
            dns_token: Secret::from_env(&config.dns.token_env),
            timeouts: timeouts.clone(),
            http,
        })
    }

    async fn run(&self, site: &Site, host: &HostConnection, command: &str) -> Result<CommandOutput, DrError> {
        let label = format!("{}:{}", site.name, host.address);
        debug!(host = %label, "Running DR command");
        let exec = exec::for_host(&label, host, self.timeouts.probe());
        Ok(exec.run_checked(command, self.timeouts.command()).await?)
    }

    async fn dns_resolves_to(&self, address: &str) -> Result<bool, DrError> {
        let expected: IpAddr = address
            .parse()
            .map_err(|_| DrError::Validation(format!("public address '{address}' is not an IP")))?;
        let resolved = tokio::net::lookup_host((self.dns.record.as_str(), 443))
            .await
            .map_err(|e| DrError::Validation(format!("resolving {}: {e}", self.dns.record)))?;
        Ok(resolved.map(|a| a.ip()).any(|ip| ip == expected))
    }
}

#[async_trait]
impl DrBackend for RemoteDrBackend {
    async fn probe(&self, site: &Site) -> Result<(), DrError> {
        self.run(site, &site.edge, "true").await?;
        self.run(site, &site.database, "true").await?;
        Ok(())
    }

    async fn replication_lag(&self, site: &Site) -> Result<u64, DrError> {
        let out = self.run(site, &site.database, &self.commands.replication_lag).await?;
        let text = out.stdout.trim();
        text.parse::<f64>()
            .map(|secs| secs.max(0.0).round() as u64)
            .map_err(|_| DrError::Command(format!("unexpected replication lag output '{text}'")))
    }

    async fn set_maintenance(&self, site: &Site, on: bool) -> Result<(), DrError> {
        let command = if on { &self.commands.maintenance_on } else { &self.commands.maintenance_off };
        self.run(site, &site.edge, command).await?;
        info!(site = %site.name, on, "Maintenance mode switched");
        Ok(())
    }

    async fn promote_database(&self, site: &Site) -> Result<(), DrError> {
        self.run(site, &site.database, &self.commands.stop_replication).await?;
        self.run(site, &site.database, &self.commands.promote).await?;
        Ok(())
    }

    async fn resync_database(&self, site: &Site, source: &Site) -> Result<(), DrError> {
        let command = self.commands.resync.replace("{source}", &shell_quote(&source.database.address));
        self.run(site, &site.database, &command).await?;
        Ok(())
    }

    async fn demote_database(&self, site: &Site, source: &Site) -> Result<(), DrError> {
        let command = self.commands.demote.replace("{source}", &source.database.address);
        self.run(site, &site.database, &command).await?;
        Ok(())
    }

    async fn update_dns(&self, site: &Site) -> Result<(), DrError> {
        let url = format!(
            "{}/zones/{}/records/{}",
            self.dns.api_url.trim_end_matches('/'),
            self.dns.zone,
            self.dns.record
        );
        let mut request = self.http.put(&url).json(&json!({
            "type": "A",
            "content": site.public_address,
            "ttl": self.dns.ttl,
        }));
        if let Some(token) = &self.dns_token {
            request = request.bearer_auth(token.expose());
        }

        let response = request.send().await.map_err(|e| DrError::Dns(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DrError::Dns(format!("record update responded with {}", response.status())));
        }
        info!(record = %self.dns.record, address = %site.public_address, ttl = self.dns.ttl, "DNS record updated");
        Ok(())
    }

    async fn start_services(&self, site: &Site) -> Result<(), DrError> {
        for service in &site.services {
            let command = self.commands.start_service.replace("{service}", &shell_quote(service));
            self.run(site, site.app_host(), &command).await?;
            debug!(site = %site.name, service = %service, "Service started");
        }
        Ok(())
    }

    async fn validate_site(&self, site: &Site) -> Result<(), DrError> {
        for service in &site.services {
            let command = self.commands.service_active.replace("{service}", &shell_quote(service));
            self.run(site, site.app_host(), &command)
                .await
                .map_err(|e| DrError::Validation(format!("service {service} not active: {e}")))?;
        }

        let host = site.app_host().address.clone();
        for port in &site.ports {
            match tokio::time::timeout(self.timeouts.probe(), TcpStream::connect((host.as_str(), *port))).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(DrError::Validation(format!("{host}:{port} refused: {e}"))),
                Err(_) => return Err(DrError::Validation(format!("{host}:{port} timed out"))),
            }
        }

        // The public record is eventually consistent
        for attempt in 1..=DNS_ATTEMPTS {
            if self.dns_resolves_to(&site.public_address).await? {
                return Ok(());
            }
            warn!(record = %self.dns.record, attempt, "Public record not yet resolving to the new site");
            if attempt < DNS_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(u64::from(self.dns.ttl.min(30)))).await;
            }
        }
        Err(DrError::Validation(format!(
            "{} does not resolve to {}",
            self.dns.record, site.public_address
        )))
    }
}
