//! Advisory leases that keep batch runs and DR operations on one environment
//! mutually exclusive across processes. A lease past its expiry is treated as
//! abandoned and may be taken over.

use super::{fmt_ts, parse_ts, Catalog};
use crate::error::{BackupError, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

pub fn backup_scope(environment: &str) -> String {
    format!("{environment}:backup")
}

pub fn dr_scope(environment: &str) -> String {
    format!("{environment}:dr")
}

/// Identity of this process as a lease holder.
pub fn holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}:{}:{}", std::process::id(), &uuid::Uuid::new_v4().to_string()[..8])
}

/// A held lease. Call [`LeaseGuard::release`] when done; an unreleased
/// lease simply expires.
#[must_use = "the lease is held until released or expired"]
pub struct LeaseGuard {
    catalog: Catalog,
    scope: String,
    holder: String,
}

impl LeaseGuard {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(self) -> Result<()> {
        let (scope, holder) = (self.scope.clone(), self.holder.clone());
        self.catalog
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM leases WHERE scope = ?1 AND holder = ?2",
                    params![scope, holder],
                )?;
                Ok(())
            })
            .await?;
        debug!(scope = %self.scope, "Lease released");
        Ok(())
    }
}

impl Catalog {
    /// Take the lease for `scope`, failing with `LeaseHeld` if another live holder has it.
    pub async fn acquire_lease(&self, scope: &str, ttl_secs: i64) -> Result<LeaseGuard> {
        let holder = holder_id();
        let (scope_owned, holder_owned) = (scope.to_string(), holder.clone());

        let outcome = self
            .write(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = Utc::now();
                let existing: Option<(String, String)> = tx
                    .query_row(
                        "SELECT holder, expires_at FROM leases WHERE scope = ?1",
                        params![scope_owned],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                if let Some((current, expires_at)) = existing {
                    if parse_ts(&expires_at)? > now {
                        return Ok(Err(current));
                    }
                    warn!(scope = %scope_owned, stale_holder = %current, "Taking over expired lease");
                }

                tx.execute(
                    "INSERT OR REPLACE INTO leases (scope, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        scope_owned,
                        holder_owned,
                        fmt_ts(now),
                        fmt_ts(now + Duration::seconds(ttl_secs)),
                    ],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;

        match outcome {
            Ok(()) => {
                debug!(scope, holder = %holder, "Lease acquired");
                Ok(LeaseGuard {
                    catalog: self.clone(),
                    scope: scope.to_string(),
                    holder,
                })
            }
            Err(current) => Err(BackupError::LeaseHeld {
                scope: scope.to_string(),
                holder: current,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::open_temp;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released() {
        let (_dir, catalog) = open_temp();
        let scope = backup_scope("prod");

        let first = catalog.acquire_lease(&scope, 60).await.unwrap();
        let second = catalog.acquire_lease(&scope, 60).await;
        assert!(matches!(second, Err(BackupError::LeaseHeld { .. })));

        // Other scopes are independent
        let dr = catalog.acquire_lease(&dr_scope("prod"), 60).await.unwrap();

        first.release().await.unwrap();
        let again = catalog.acquire_lease(&scope, 60).await.unwrap();
        again.release().await.unwrap();
        dr.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (_dir, catalog) = open_temp();
        let scope = backup_scope("prod");
        let _abandoned = catalog.acquire_lease(&scope, -1).await.unwrap();
        let fresh = catalog.acquire_lease(&scope, 60).await.unwrap();
        assert_ne!(fresh.holder(), _abandoned.holder());
    }
}
