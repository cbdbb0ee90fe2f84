//! The lock manager.

use crate::error::{LockError, Result};
use orca_core::config::LockConfig;
use orca_core::{Clock, LockId, LockRecord, LockToken, TaskId, Time};
use orca_storage::{CasOutcome, Storage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What `release` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease was live and is now cleared
    Released,
    /// Nothing to do: already released, expired or reclaimed
    NotHeld,
}

/// Acquires, renews and releases leases keyed by resource.
#[derive(Clone)]
pub struct LockManager {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl LockManager {
    /// Create a lock manager with default settings.
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            config: LockConfig::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    /// The injected clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// TTL applied when callers have no opinion.
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
    }

    /// Acquire `resource_key` for `holder`.
    ///
    /// Re-acquiring a live lease you already hold for the same task extends
    /// it and keeps its lock id. A live lease held by someone else, or by
    /// this holder for another task, fails with [`LockError::Conflict`]
    /// immediately.
    pub async fn acquire(
        &self,
        resource_key: &str,
        task_id: TaskId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken> {
        self.acquire_inner(resource_key, task_id, holder, ttl, true).await
    }

    /// Acquire a fresh lease, never joining an existing one.
    ///
    /// Any live lease conflicts, including one held by `holder` itself, so
    /// the returned token always belongs to this call alone.
    pub async fn acquire_new(
        &self,
        resource_key: &str,
        task_id: TaskId,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken> {
        self.acquire_inner(resource_key, task_id, holder, ttl, false).await
    }

    async fn acquire_inner(
        &self,
        resource_key: &str,
        task_id: TaskId,
        holder: &str,
        ttl: Duration,
        reentrant: bool,
    ) -> Result<LockToken> {
        let ttl_delta = self.check_ttl(ttl)?;

        for _ in 0..=self.config.cas_retries {
            let now = self.clock.now();
            let record = self.storage.get_lock(resource_key).await?;

            let (expected, token) = match &record {
                Some(r) => match r.live_token(now) {
                    Some(live) if reentrant && live.holder == holder && live.task_id == task_id => (
                        Some(r.version),
                        LockToken {
                            expires_at: now + ttl_delta,
                            ..live.clone()
                        },
                    ),
                    Some(live) => return Err(self.conflict(live, now)),
                    None => (Some(r.version), self.grant(resource_key, task_id, holder, now, ttl_delta)),
                },
                None => (None, self.grant(resource_key, task_id, holder, now, ttl_delta)),
            };

            match self
                .storage
                .compare_and_set_lock(resource_key, expected, Some(token.clone()))
                .await?
            {
                CasOutcome::Applied(_) => {
                    debug!(
                        resource = resource_key,
                        holder,
                        lock_id = %token.lock_id,
                        expires_at = %token.expires_at,
                        "lock acquired"
                    );
                    return Ok(token);
                }
                CasOutcome::Conflict(_) => {
                    debug!(resource = resource_key, holder, "lost compare-and-set, re-reading");
                }
            }
        }

        warn!(resource = resource_key, holder, "lock acquisition contended");
        Err(LockError::Contention {
            resource: resource_key.to_string(),
            attempts: self.config.cas_retries + 1,
        })
    }

    /// Release a lease. Idempotent.
    pub async fn release(&self, token: &LockToken) -> Result<ReleaseOutcome> {
        for _ in 0..=self.config.cas_retries {
            let now = self.clock.now();
            let Some(record) = self.storage.get_lock(&token.resource_key).await? else {
                return Ok(ReleaseOutcome::NotHeld);
            };

            let ours_and_live = record
                .live_token(now)
                .is_some_and(|current| current.lock_id == token.lock_id);
            if !ours_and_live {
                debug!(resource = %token.resource_key, lock_id = %token.lock_id, "release of a lease that is not held");
                return Ok(ReleaseOutcome::NotHeld);
            }

            match self
                .storage
                .compare_and_set_lock(&token.resource_key, Some(record.version), None)
                .await?
            {
                CasOutcome::Applied(_) => {
                    debug!(resource = %token.resource_key, holder = %token.holder, "lock released");
                    return Ok(ReleaseOutcome::Released);
                }
                CasOutcome::Conflict(_) => continue,
            }
        }

        Err(LockError::Contention {
            resource: token.resource_key.clone(),
            attempts: self.config.cas_retries + 1,
        })
    }

    /// Extend a live lease.
    ///
    /// Fails with [`LockError::Conflict`] if another holder now owns the
    /// resource, and with [`LockError::ExpiredElsewhere`] if this lease has
    /// expired or was reclaimed.
    pub async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<LockToken> {
        let ttl_delta = self.check_ttl(ttl)?;

        for _ in 0..=self.config.cas_retries {
            let now = self.clock.now();
            let record = self.storage.get_lock(&token.resource_key).await?;
            let Some(record) = record else {
                return Err(self.expired_elsewhere(token));
            };

            let renewed = match &record.current {
                Some(current) if current.lock_id == token.lock_id => {
                    if current.is_expired_at(now) {
                        return Err(self.expired_elsewhere(token));
                    }
                    LockToken {
                        expires_at: now + ttl_delta,
                        ..current.clone()
                    }
                }
                Some(current) if !current.is_expired_at(now) && current.holder != token.holder => {
                    return Err(self.conflict(current, now));
                }
                _ => return Err(self.expired_elsewhere(token)),
            };

            match self
                .storage
                .compare_and_set_lock(&token.resource_key, Some(record.version), Some(renewed.clone()))
                .await?
            {
                CasOutcome::Applied(_) => {
                    debug!(resource = %token.resource_key, expires_at = %renewed.expires_at, "lock renewed");
                    return Ok(renewed);
                }
                CasOutcome::Conflict(_) => continue,
            }
        }

        Err(LockError::Contention {
            resource: token.resource_key.clone(),
            attempts: self.config.cas_retries + 1,
        })
    }

    /// True iff a live lease exists for `resource_key`.
    pub async fn is_held(&self, resource_key: &str) -> Result<bool> {
        Ok(self.current(resource_key).await?.is_some())
    }

    /// The live lease on `resource_key`, if any.
    pub async fn current(&self, resource_key: &str) -> Result<Option<LockToken>> {
        let now = self.clock.now();
        Ok(self
            .storage
            .get_lock(resource_key)
            .await?
            .and_then(|r| r.live_token(now).cloned()))
    }

    /// Force-release an expired lease observed during a scan.
    ///
    /// Holder identity is ignored: expiry overrides ownership. The release
    /// only happens if the stored record is still exactly `observed` (same
    /// version) and its token is expired now, so a lease renewed or
    /// re-granted after the scan is left alone. Returns the reclaimed token.
    pub async fn reclaim_expired(&self, observed: &LockRecord) -> Result<Option<LockToken>> {
        let now = self.clock.now();
        let Some(expired) = observed.expired_token(now) else {
            return Ok(None);
        };

        match self
            .storage
            .compare_and_set_lock(&observed.resource_key, Some(observed.version), None)
            .await?
        {
            CasOutcome::Applied(_) => {
                info!(
                    resource = %observed.resource_key,
                    holder = %expired.holder,
                    expired_at = %expired.expires_at,
                    "expired lock reclaimed"
                );
                Ok(Some(expired.clone()))
            }
            CasOutcome::Conflict(_) => {
                debug!(resource = %observed.resource_key, "lock changed since scan, not reclaiming");
                Ok(None)
            }
        }
    }

    fn check_ttl(&self, ttl: Duration) -> Result<chrono::Duration> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl {
                ttl,
                reason: "leases must have a positive ttl".to_string(),
            });
        }
        if ttl > self.config.max_ttl() {
            return Err(LockError::InvalidTtl {
                ttl,
                reason: format!("exceeds the maximum of {:?}", self.config.max_ttl()),
            });
        }
        chrono::Duration::from_std(ttl).map_err(|e| LockError::InvalidTtl {
            ttl,
            reason: e.to_string(),
        })
    }

    fn grant(&self, resource_key: &str, task_id: TaskId, holder: &str, now: Time, ttl: chrono::Duration) -> LockToken {
        LockToken {
            lock_id: LockId::new(),
            task_id,
            resource_key: resource_key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    fn conflict(&self, live: &LockToken, now: Time) -> LockError {
        let retry_after = live.remaining(now).to_std().unwrap_or_default();
        LockError::Conflict {
            resource: live.resource_key.clone(),
            current_owner: live.holder.clone(),
            wait: retry_after <= self.config.wait_horizon(),
            retry_after,
        }
    }

    fn expired_elsewhere(&self, token: &LockToken) -> LockError {
        LockError::ExpiredElsewhere {
            resource: token.resource_key.clone(),
            lock_id: token.lock_id,
        }
    }
}
