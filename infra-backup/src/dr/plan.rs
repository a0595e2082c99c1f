//! Markdown DR runbook rendered from the configured topology.

use super::site::Site;
use super::state::{DrState, Operation};
use super::DrStatus;
use crate::catalog::CatalogEntry;
use crate::config::DrConfig;
use chrono::{DateTime, Utc};
use std::fmt::Write;

fn describe(op: Operation, state: DrState, from: &Site, to: &Site) -> String {
    match (op, state) {
        (_, DrState::EmergencyMode) => format!(
            "Switch public entrypoints on {} (and {} where reachable) to the maintenance response",
            to.name, from.name
        ),
        (_, DrState::Resyncing) => format!(
            "Rebuild the {} database ({}) from {} ({})",
            to.name, to.database.address, from.name, from.database.address
        ),
        (Operation::Failback, DrState::DbPromoting) => format!(
            "Promote the {} database, then return {} to standby replicating from it",
            to.name, from.name
        ),
        (_, DrState::DbPromoting) => format!(
            "Stop replication on {} and promote it to read-write",
            to.database.address
        ),
        (_, DrState::DnsCutover) => format!("Point the public record at {} ({})", to.name, to.public_address),
        (_, DrState::ServicesStarting) => {
            if to.services.is_empty() {
                format!("No services configured for {}", to.name)
            } else {
                format!("Start {} on {}", to.services.join(", "), to.app_host().address)
            }
        }
        (_, DrState::Validating) => format!(
            "Confirm services are active, ports {:?} accept connections and the record resolves to {}",
            to.ports, to.public_address
        ),
        (_, DrState::Normal) => format!("Clear maintenance on {} and notify", to.name),
        (_, DrState::FailoverFailed) => "Halt; maintenance stays on".to_string(),
    }
}

fn procedure(out: &mut String, op: Operation, from: &Site, to: &Site) {
    let _ = writeln!(out, "## {} ({} -> {})\n", capitalize(op.as_str()), from.name, to.name);
    let _ = writeln!(out, "Command: `infra-backup disaster-recovery {op}`\n");
    for (i, state) in op.steps().iter().enumerate() {
        let _ = writeln!(out, "{}. **{}**: {}", i + 1, state, describe(op, *state, from, to));
    }
    let _ = writeln!(
        out,
        "\nAny failed step stops the run in `{}` with maintenance left on. There is no automatic rollback.\n",
        DrState::FailoverFailed
    );
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn render(
    environment: &str,
    config: &DrConfig,
    status: &DrStatus,
    newest_full: Option<&CatalogEntry>,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Disaster recovery plan: {environment}\n");
    let _ = writeln!(out, "Generated {}\n", now.format("%Y-%m-%d %H:%M UTC"));

    let _ = writeln!(out, "## Current state\n");
    let _ = writeln!(out, "- State: `{}`", status.state);
    let _ = writeln!(out, "- Active site: {}", status.active_site);
    match newest_full {
        Some(e) => {
            let _ = writeln!(
                out,
                "- Newest valid full backup: {} on {} at {}",
                e.job.component,
                e.job.host,
                e.job.started_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        None => {
            let _ = writeln!(out, "- Newest valid full backup: none");
        }
    }

    let _ = writeln!(out, "\n## Sites\n");
    let _ = writeln!(out, "| Site | Public address | Edge | Database | Services | Ports |");
    let _ = writeln!(out, "|---|---|---|---|---|---|");
    for site in [&config.primary, &config.secondary] {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} |",
            site.name,
            site.public_address,
            site.edge.address,
            site.database.address,
            site.services.join(", "),
            site.ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
        );
    }
    let _ = writeln!(
        out,
        "\nPublic record `{}` in zone `{}`, TTL {}s. Clients may keep the old address for up to one TTL after cutover.\n",
        config.dns.record, config.dns.zone, config.dns.ttl
    );

    let _ = writeln!(out, "## Readiness gate\n");
    let _ = writeln!(out, "Run `infra-backup disaster-recovery validate-dr` before any failover. It checks:\n");
    let _ = writeln!(
        out,
        "- a valid full backup younger than {}h",
        config.readiness.max_backup_age_hours
    );
    let _ = writeln!(out, "- the target site's edge and database hosts are reachable");
    let _ = writeln!(
        out,
        "- replication lag under {}s",
        config.readiness.max_replication_lag_secs
    );
    let _ = writeln!(out, "- this plan and the required DR artifacts exist");
    let _ = writeln!(
        out,
        "\nA failed gate blocks the run unless `--force` is given; forced runs are recorded as overrides.\n"
    );

    procedure(&mut out, Operation::Failover, &config.primary, &config.secondary);
    procedure(&mut out, Operation::Failback, &config.secondary, &config.primary);

    let _ = writeln!(out, "## Manual recovery\n");
    let _ = writeln!(
        out,
        "- Enter maintenance by hand: `infra-backup disaster-recovery emergency-mode`"
    );
    let _ = writeln!(
        out,
        "- After `{}`, repair the site by hand, then clear maintenance and record which site is live:\n  `infra-backup disaster-recovery emergency-mode --clear --site <{}|{}>`",
        DrState::FailoverFailed,
        config.primary.name,
        config.secondary.name
    );
    out
}
