//! The recovery sweep.

use crate::alert::{AlertSink, LogAlertSink, RecoveryAlert};
use crate::policy::{RecoveryAction, RecoveryPolicy};
use orca_core::config::RecoveryConfig;
use orca_core::{
    AgentId, AuditEvent, AuditEventType, InvalidTransition, LockRecord, LockToken, RequestContext, RouteState,
    TaskId, Time, WorkFilter, WorkItem,
};
use orca_lock::{LockError, LockManager};
use orca_storage::{Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A single resource whose recovery failed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("recovery of {resource} (held by {holder}) failed: {message}")]
pub struct RecoveryItemError {
    /// Resource key of the expired lease
    pub resource: String,
    /// Holder of the expired lease
    pub holder: String,
    /// What went wrong
    pub message: String,
}

/// Counters for one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Lock records examined
    pub scanned_count: usize,
    /// Records whose lease had expired
    pub expired_count: usize,
    /// Expired leases that were reclaimed
    pub recovered_count: usize,
    /// Expired leases left alone because they changed after the scan
    pub skipped_count: usize,
    /// Executing items found with no lease at all
    pub orphaned_count: usize,
    /// Per-resource failures
    pub errors: Vec<RecoveryItemError>,
}

impl RecoveryStats {
    /// `errors / (expired_count + orphaned_count)`, zero when there was
    /// nothing to recover.
    pub fn error_rate(&self) -> f64 {
        let attempted = self.expired_count + self.orphaned_count;
        if attempted == 0 {
            0.0
        } else {
            self.errors.len() as f64 / attempted as f64
        }
    }
}

/// Result of one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Counters
    pub stats: RecoveryStats,
    /// Tasks queued for a fresh routing decision
    pub requeued: Vec<TaskId>,
    /// Tasks surfaced for manual intervention
    pub escalated: Vec<TaskId>,
    /// The cycle stopped early because of cancellation
    pub cancelled: bool,
}

enum ItemOutcome {
    Skipped,
    Reclaimed(Option<(TaskId, RecoveryAction)>),
}

#[derive(Debug, thiserror::Error)]
enum ItemFailure {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Periodically reclaims expired leases and recovers their work.
pub struct RecoverySweep {
    storage: Arc<dyn Storage>,
    locks: LockManager,
    policy: RecoveryPolicy,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    alert_error_rate: f64,
}

impl RecoverySweep {
    /// Create a sweep with default settings.
    pub fn new(storage: Arc<dyn Storage>, locks: LockManager) -> Self {
        let config = RecoveryConfig::default();
        Self {
            storage,
            locks,
            policy: RecoveryPolicy::from(&config),
            alerts: Arc::new(LogAlertSink),
            interval: config.interval(),
            alert_error_rate: config.alert_error_rate,
        }
    }

    /// Apply a recovery config section.
    pub fn with_config(mut self, config: &RecoveryConfig) -> Self {
        self.policy = RecoveryPolicy::from(config);
        self.interval = config.interval();
        self.alert_error_rate = config.alert_error_rate;
        self
    }

    /// Replace the recovery policy.
    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the alert sink.
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    /// Run one full cycle.
    pub async fn run_once(&self, ctx: &RequestContext) -> Result<RecoveryReport, StorageError> {
        self.sweep(ctx, &CancellationToken::new()).await
    }

    /// Run one cycle, stopping between items if `cancel` fires.
    ///
    /// Expired leases are reclaimed first. Executing items left with no
    /// lease (because an earlier cycle reclaimed it but could not update the
    /// item) are then recovered from a scan of the work items. Only the two
    /// scans can fail the cycle. Failures on individual resources are
    /// collected in the report's `errors`.
    pub async fn sweep(&self, ctx: &RequestContext, cancel: &CancellationToken) -> Result<RecoveryReport, StorageError> {
        let ctx = ctx.acting_as(AgentId::recovery());
        let records = self.storage.list_locks().await?;
        let now = self.locks.clock().now();
        let mut report = RecoveryReport::default();

        for record in records {
            if cancel.is_cancelled() {
                info!(correlation_id = %ctx.correlation_id, "recovery sweep cancelled mid-cycle");
                report.cancelled = true;
                break;
            }
            report.stats.scanned_count += 1;

            let Some(expired) = record.expired_token(now) else {
                continue;
            };
            report.stats.expired_count += 1;
            let holder = expired.holder.clone();

            match self.recover(&ctx, &record).await {
                Ok(ItemOutcome::Skipped) => report.stats.skipped_count += 1,
                Ok(ItemOutcome::Reclaimed(work)) => {
                    report.stats.recovered_count += 1;
                    match work {
                        Some((task_id, RecoveryAction::Requeue)) => report.requeued.push(task_id),
                        Some((task_id, RecoveryAction::Escalate)) => report.escalated.push(task_id),
                        None => {}
                    }
                }
                Err(e) => {
                    warn!(resource = %record.resource_key, holder = %holder, error = %e, "recovery failed");
                    self.record_failure(&ctx, &mut report, record.resource_key.clone(), holder, e)
                        .await;
                }
            }
        }

        if !report.cancelled {
            self.recover_orphans(&ctx, cancel, &mut report).await?;
        }

        let rate = report.stats.error_rate();
        if !report.stats.errors.is_empty() && rate > self.alert_error_rate {
            self.alerts
                .alert(&RecoveryAlert {
                    correlation_id: ctx.correlation_id.clone(),
                    expired_count: report.stats.expired_count,
                    errors: report.stats.errors.clone(),
                    error_rate: rate,
                    threshold: self.alert_error_rate,
                })
                .await;
        }

        debug!(
            correlation_id = %ctx.correlation_id,
            scanned = report.stats.scanned_count,
            expired = report.stats.expired_count,
            orphaned = report.stats.orphaned_count,
            recovered = report.stats.recovered_count,
            skipped = report.stats.skipped_count,
            errors = report.stats.errors.len(),
            "recovery sweep cycle finished"
        );
        Ok(report)
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "recovery sweep started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("recovery sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let ctx = RequestContext::new(AgentId::recovery());
                    match self.sweep(&ctx, &cancel).await {
                        Ok(report) if report.stats.expired_count + report.stats.orphaned_count > 0 => info!(
                            correlation_id = %ctx.correlation_id,
                            recovered = report.stats.recovered_count,
                            requeued = report.requeued.len(),
                            escalated = report.escalated.len(),
                            errors = report.stats.errors.len(),
                            "recovered expired leases"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "recovery sweep cycle failed"),
                    }
                }
            }
        }
    }

    async fn recover(&self, ctx: &RequestContext, record: &LockRecord) -> Result<ItemOutcome, ItemFailure> {
        let Some(token) = self.locks.reclaim_expired(record).await? else {
            debug!(resource = %record.resource_key, "lease changed since scan, skipping");
            return Ok(ItemOutcome::Skipped);
        };
        let now = self.locks.clock().now();

        // The item is settled before anything is audited, so a failure here
        // leaves an Executing item with no lease for the orphan scan.
        let settled = self.settle_leased_item(&token, now).await;

        self.storage
            .append_audit(
                &AuditEvent::new(
                    AuditEventType::LockReclaimed,
                    &token.resource_key,
                    ctx.actor.clone(),
                    now,
                    format!("lease held by {} expired at {}", token.holder, token.expires_at),
                )
                .correlated(&ctx.correlation_id),
            )
            .await?;

        let Some((item, action, reason)) = settled? else {
            return Ok(ItemOutcome::Reclaimed(None));
        };
        self.audit_action(ctx, &item, action, &reason, now).await?;

        info!(
            resource = %token.resource_key,
            holder = %token.holder,
            task_id = %item.task_id,
            action = ?action,
            "recovered orphaned work"
        );
        Ok(ItemOutcome::Reclaimed(Some((item.task_id, action))))
    }

    /// Requeue or escalate the item a reclaimed lease was protecting.
    async fn settle_leased_item(
        &self,
        token: &LockToken,
        now: Time,
    ) -> Result<Option<(WorkItem, RecoveryAction, String)>, ItemFailure> {
        let Some(item) = self.storage.load_work_item(token.task_id).await? else {
            return Ok(None);
        };
        if item.resource_key.as_deref() != Some(token.resource_key.as_str()) {
            debug!(task_id = %item.task_id, resource = %token.resource_key, "item no longer uses this lease");
            return Ok(None);
        }
        self.settle(item, now).await
    }

    /// Apply the policy to `item` and save it.
    ///
    /// Returns `None` when the item is not recoverable or changed since it
    /// was read.
    async fn settle(
        &self,
        mut item: WorkItem,
        now: Time,
    ) -> Result<Option<(WorkItem, RecoveryAction, String)>, ItemFailure> {
        if !self.policy.is_recoverable(&item) {
            debug!(task_id = %item.task_id, state = %item.state, "work already settled");
            return Ok(None);
        }

        let action = self.policy.decide(&item);
        let reason = self.policy.explain(&item, action);
        action.apply(&mut item, now, reason.clone())?;
        match self.storage.save_work_item(&item).await {
            Ok(version) => item.version = version,
            Err(e) if e.is_conflict() => {
                debug!(task_id = %item.task_id, "work item changed concurrently, leaving it");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Some((item, action, reason)))
    }

    /// Recover executing items whose lease is gone.
    async fn recover_orphans(
        &self,
        ctx: &RequestContext,
        cancel: &CancellationToken,
        report: &mut RecoveryReport,
    ) -> Result<(), StorageError> {
        let filter = WorkFilter {
            states: Some(vec![RouteState::Executing]),
            ..WorkFilter::default()
        };
        let items = self.storage.list_work_items(&filter).await?;

        for item in items {
            if cancel.is_cancelled() {
                info!(correlation_id = %ctx.correlation_id, "recovery sweep cancelled mid-cycle");
                report.cancelled = true;
                break;
            }
            let resource = item
                .resource_key
                .clone()
                .unwrap_or_else(|| item.task_id.to_string());
            let holder = item.instance_id.clone().unwrap_or_default();

            match self.recover_orphan(ctx, item).await {
                Ok(None) => {}
                Ok(Some((task_id, action))) => {
                    report.stats.orphaned_count += 1;
                    match action {
                        RecoveryAction::Requeue => report.requeued.push(task_id),
                        RecoveryAction::Escalate => report.escalated.push(task_id),
                    }
                }
                Err(e) => {
                    report.stats.orphaned_count += 1;
                    warn!(resource = %resource, error = %e, "orphan recovery failed");
                    self.record_failure(ctx, report, resource, holder, e).await;
                }
            }
        }
        Ok(())
    }

    async fn recover_orphan(
        &self,
        ctx: &RequestContext,
        item: WorkItem,
    ) -> Result<Option<(TaskId, RecoveryAction)>, ItemFailure> {
        if let Some(key) = &item.resource_key {
            let leased = self
                .storage
                .get_lock(key)
                .await?
                .is_some_and(|record| record.current.is_some());
            // Expired leases are reclaimed by the lock scan first.
            if leased {
                return Ok(None);
            }
        }

        let now = self.locks.clock().now();
        let Some((item, action, reason)) = self.settle(item, now).await? else {
            return Ok(None);
        };
        self.audit_action(ctx, &item, action, &reason, now).await?;
        info!(task_id = %item.task_id, action = ?action, "recovered executing work with no lease");
        Ok(Some((item.task_id, action)))
    }

    async fn audit_action(
        &self,
        ctx: &RequestContext,
        item: &WorkItem,
        action: RecoveryAction,
        reason: &str,
        now: Time,
    ) -> Result<(), StorageError> {
        let event_type = match action {
            RecoveryAction::Requeue => AuditEventType::WorkRequeued,
            RecoveryAction::Escalate => AuditEventType::WorkEscalated,
        };
        self.storage
            .append_audit(
                &AuditEvent::new(event_type, item.task_id.to_string(), ctx.actor.clone(), now, reason)
                    .correlated(&ctx.correlation_id),
            )
            .await
    }

    async fn record_failure(
        &self,
        ctx: &RequestContext,
        report: &mut RecoveryReport,
        resource: String,
        holder: String,
        failure: ItemFailure,
    ) {
        let item_error = RecoveryItemError {
            resource,
            holder,
            message: failure.to_string(),
        };
        self.audit_failure(ctx, &item_error).await;
        report.stats.errors.push(item_error);
    }

    async fn audit_failure(&self, ctx: &RequestContext, item_error: &RecoveryItemError) {
        let event = AuditEvent::new(
            AuditEventType::RecoveryItemFailed,
            &item_error.resource,
            ctx.actor.clone(),
            self.locks.clock().now(),
            &item_error.message,
        )
        .correlated(&ctx.correlation_id);
        if let Err(e) = self.storage.append_audit(&event).await {
            warn!(resource = %item_error.resource, error = %e, "could not audit recovery failure");
        }
    }
}
