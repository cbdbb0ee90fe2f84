//! The router.

use crate::error::{Result, RoutingError};
use crate::profile::{InstanceProfile, InstanceProfileBuilder};
use crate::registry::InstanceRegistry;
use crate::requirements::{RequirementsExtractor, TaskRequirements};
use crate::scorer::{RouteScorer, ScoreOutcome};
use orca_core::config::RoutingConfig;
use orca_core::{
    AgentId, AuditEvent, AuditEventType, Clock, DecisionId, EventId, LockToken, RequestContext,
    RerouteEvent, RerouteReason, RouteDecision, RouteState, ScoreBreakdown, ScoreDimension, TaskId,
    TaskSubmission, WorkItem,
};
use orca_lock::LockManager;
use orca_storage::Storage;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A routed task that now holds its execution lease.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Decision the task was dispatched under
    pub decision: RouteDecision,
    /// Lease on `task:<task_id>`, held by the selected instance
    pub token: LockToken,
}

/// Every decision and reroute recorded for a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteHistory {
    /// Decisions, oldest first
    pub decisions: Vec<RouteDecision>,
    /// Reroutes, oldest first
    pub reroutes: Vec<RerouteEvent>,
}

/// Routes tasks to instances and records why.
pub struct Router {
    storage: Arc<dyn Storage>,
    registry: Arc<dyn InstanceRegistry>,
    clock: Arc<dyn Clock>,
    extractor: RequirementsExtractor,
    builder: InstanceProfileBuilder,
    scorer: RouteScorer,
}

impl Router {
    /// Create a router with default weights.
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<dyn InstanceRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            registry,
            clock,
            extractor: RequirementsExtractor::new(),
            builder: InstanceProfileBuilder::new(),
            scorer: RouteScorer::default(),
        }
    }

    /// Apply a routing config section.
    pub fn with_config(mut self, config: &RoutingConfig) -> Self {
        self.scorer = RouteScorer::new(config.weights.clone());
        self
    }

    /// Resource key of a task's execution lease.
    pub fn execution_key(task_id: TaskId) -> String {
        format!("task:{}", task_id)
    }

    /// Choose an instance for `task`.
    ///
    /// The decision is persisted and audited before it is returned. A task
    /// that cannot be placed ends in `Failed` and the error lists every
    /// candidate's rejection reasons.
    pub async fn route(&self, ctx: &RequestContext, task: &TaskSubmission) -> Result<RouteDecision> {
        let reqs = self.extractor.extract(task)?;
        let now = self.clock.now();

        let mut item = match self.storage.load_work_item(task.task_id).await? {
            Some(item) => item,
            None => WorkItem::new(task.task_id, task.node_type, now),
        };
        // Re-scoring routed work, or retrying failed work, supersedes the
        // last decision.
        let supersedes = item.current_decision;
        item.transition(RouteState::Scoring, now)?;
        item.version = self.storage.save_work_item(&item).await?;

        let decision = match self.decide(ctx, &reqs, None, supersedes).await {
            Ok(decision) => decision,
            Err(e) => {
                self.fail_scoring(&mut item, &e).await?;
                return Err(e);
            }
        };
        self.record(ctx, &mut item, &decision).await?;
        Ok(decision)
    }

    /// Replace the task's current decision.
    ///
    /// The prior decision is kept; the new one points back at it and a
    /// [`RerouteEvent`] links the two. Unless the reason is
    /// [`RerouteReason::BetterMatch`], the previously selected instance is
    /// not a candidate.
    pub async fn reroute(
        &self,
        ctx: &RequestContext,
        task: &TaskSubmission,
        reason: RerouteReason,
    ) -> Result<RerouteEvent> {
        let previous = self
            .storage
            .latest_decision(task.task_id)
            .await?
            .ok_or(RoutingError::NotRouted(task.task_id))?;
        let mut item = self
            .storage
            .load_work_item(task.task_id)
            .await?
            .ok_or(RoutingError::NotRouted(task.task_id))?;
        let reqs = self.extractor.extract(task)?;

        let now = self.clock.now();
        if item.state != RouteState::Rerouted {
            item.transition(RouteState::Rerouted, now)?;
        }
        item.resource_key = None;
        item.transition(RouteState::Scoring, now)?;
        item.version = self.storage.save_work_item(&item).await?;

        let exclude = reason
            .excludes_previous()
            .then_some((previous.selected_instance_id.as_str(), reason));
        let decision = match self.decide(ctx, &reqs, exclude, Some(previous.decision_id)).await {
            Ok(decision) => decision,
            Err(e) => {
                self.fail_scoring(&mut item, &e).await?;
                return Err(e);
            }
        };
        self.record(ctx, &mut item, &decision).await?;

        let event = RerouteEvent {
            event_id: EventId::new(),
            task_id: task.task_id,
            previous_decision: previous.decision_id,
            new_decision: decision.decision_id,
            previous_instance_id: previous.selected_instance_id.clone(),
            new_instance_id: decision.selected_instance_id.clone(),
            reason,
            correlation_id: ctx.correlation_id.clone(),
            occurred_at: now,
        };
        self.storage.append_reroute(&event).await?;
        self.audit(
            ctx,
            AuditEventType::Rerouted,
            task.task_id.to_string(),
            format!(
                "{}: {} -> {}",
                reason, event.previous_instance_id, event.new_instance_id
            ),
        )
        .await?;

        info!(
            task_id = %task.task_id,
            from = %event.previous_instance_id,
            to = %event.new_instance_id,
            reason = %reason,
            "task rerouted"
        );
        Ok(event)
    }

    /// Route (unless already routed) and take the execution lease.
    ///
    /// The lease is held by the selected instance on
    /// [`Router::execution_key`]. On success the work item is `Executing`
    /// and its attempt counter has been bumped. The lease is always a fresh
    /// grant, so of two concurrent dispatches of one task at most one
    /// succeeds; the other gets a lock conflict or a storage conflict.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        task: &TaskSubmission,
        locks: &LockManager,
        ttl: Duration,
    ) -> Result<Dispatch> {
        let routed = self
            .storage
            .load_work_item(task.task_id)
            .await?
            .is_some_and(|item| item.state == RouteState::Routed);
        let decision = if routed {
            self.storage
                .latest_decision(task.task_id)
                .await?
                .ok_or(RoutingError::NotRouted(task.task_id))?
        } else {
            self.route(ctx, task).await?
        };

        let key = Self::execution_key(task.task_id);
        let token = locks
            .acquire_new(&key, task.task_id, &decision.selected_instance_id, ttl)
            .await?;

        let item = match self.start_execution(task.task_id, &decision, &key).await {
            Ok(item) => item,
            Err(e) => {
                if let Err(release) = locks.release(&token).await {
                    warn!(resource = %key, error = %release, "could not release lease after failed dispatch");
                }
                return Err(e);
            }
        };

        self.audit(
            ctx,
            AuditEventType::LockAcquired,
            key.clone(),
            format!(
                "execution lease for task {} granted to {} until {}",
                task.task_id, token.holder, token.expires_at
            ),
        )
        .await?;

        debug!(
            task_id = %task.task_id,
            instance = %decision.selected_instance_id,
            attempt = item.attempts,
            "task dispatched"
        );
        Ok(Dispatch { decision, token })
    }

    /// Mark executing work as done.
    pub async fn complete(&self, task_id: TaskId) -> Result<WorkItem> {
        let mut item = self
            .storage
            .load_work_item(task_id)
            .await?
            .ok_or(RoutingError::NotRouted(task_id))?;
        item.transition(RouteState::Completed, self.clock.now())?;
        item.resource_key = None;
        item.note = None;
        item.version = self.storage.save_work_item(&item).await?;
        Ok(item)
    }

    /// Give up on executing work.
    pub async fn fail(&self, task_id: TaskId, note: impl Into<String>) -> Result<WorkItem> {
        let mut item = self
            .storage
            .load_work_item(task_id)
            .await?
            .ok_or(RoutingError::NotRouted(task_id))?;
        item.transition(RouteState::Failed, self.clock.now())?;
        item.resource_key = None;
        item.note = Some(note.into());
        item.version = self.storage.save_work_item(&item).await?;
        Ok(item)
    }

    /// All decisions and reroutes recorded for a task.
    pub async fn history(&self, task_id: TaskId) -> Result<RouteHistory> {
        Ok(RouteHistory {
            decisions: self.storage.list_decisions(task_id).await?,
            reroutes: self.storage.list_reroutes(task_id).await?,
        })
    }

    async fn start_execution(&self, task_id: TaskId, decision: &RouteDecision, key: &str) -> Result<WorkItem> {
        let mut item = self
            .storage
            .load_work_item(task_id)
            .await?
            .ok_or(RoutingError::NotRouted(task_id))?;
        if item.current_decision != Some(decision.decision_id) {
            return Err(RoutingError::Storage(orca_storage::StorageError::Conflict(format!(
                "task {} was re-routed during dispatch",
                task_id
            ))));
        }
        item.transition(RouteState::Executing, self.clock.now())?;
        item.attempts += 1;
        item.instance_id = Some(decision.selected_instance_id.clone());
        item.resource_key = Some(key.to_string());
        item.version = self.storage.save_work_item(&item).await?;
        Ok(item)
    }

    /// Score every candidate and build the winning decision.
    ///
    /// Candidates are visited in instance id order and only a strictly
    /// higher score replaces the leader, so ties go to the smallest id.
    async fn decide(
        &self,
        ctx: &RequestContext,
        reqs: &TaskRequirements,
        exclude: Option<(&str, RerouteReason)>,
        supersedes: Option<DecisionId>,
    ) -> Result<RouteDecision> {
        let mut instances = self.registry.list_instances().await?;
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let mut rejected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut best: Option<(InstanceProfile, ScoreBreakdown)> = None;
        let mut considered = 0;

        for descriptor in &instances {
            if let Some((previous, reason)) = exclude {
                if descriptor.instance_id == previous {
                    rejected.insert(
                        descriptor.instance_id.clone(),
                        vec![format!("previous instance excluded ({})", reason)],
                    );
                    continue;
                }
            }
            considered += 1;

            let profile = self.builder.build(descriptor);
            match self.scorer.score(reqs, &profile) {
                ScoreOutcome::Eligible(breakdown) => {
                    let leads = best.as_ref().map_or(true, |(_, lead)| breakdown.total > lead.total);
                    if leads {
                        best = Some((profile, breakdown));
                    }
                }
                ScoreOutcome::Ineligible(reasons) => {
                    debug!(task_id = %reqs.task_id, instance = %profile.instance_id, ?reasons, "candidate rejected");
                    rejected.insert(profile.instance_id.clone(), reasons);
                }
            }
        }

        let Some((profile, breakdown)) = best else {
            return Err(RoutingError::NoEligibleInstance {
                task_id: reqs.task_id,
                rejections: rejected,
            });
        };

        let mut rationale = vec![format!(
            "selected {} with score {:.3} out of {} candidates",
            profile.instance_id, breakdown.total, considered
        )];
        rationale.extend(breakdown.explain());
        rationale.extend(
            rejected
                .iter()
                .map(|(id, reasons)| format!("rejected {}: {}", id, reasons.join("; "))),
        );

        let mut evidence_refs: Vec<String> = breakdown
            .contributions
            .iter()
            .filter(|c| {
                matches!(
                    c.dimension,
                    ScoreDimension::RequiredCapability | ScoreDimension::PreferredCapability
                )
            })
            .map(|c| {
                format!(
                    "capability:{}={}@{}",
                    c.key,
                    profile.capability(&c.key).unwrap_or_default(),
                    profile.instance_id
                )
            })
            .collect();
        evidence_refs.push(format!("instance:{}", profile.instance_id));

        Ok(RouteDecision {
            decision_id: DecisionId::new(),
            task_id: reqs.task_id,
            selected_instance_id: profile.instance_id.clone(),
            score: breakdown.total,
            breakdown,
            rationale,
            evidence_refs,
            rejected,
            candidates_considered: considered,
            supersedes,
            correlation_id: ctx.correlation_id.clone(),
            decided_at: self.clock.now(),
        })
    }

    /// Persist a decision and move the item to `Routed`.
    async fn record(&self, ctx: &RequestContext, item: &mut WorkItem, decision: &RouteDecision) -> Result<()> {
        self.storage.append_decision(decision).await?;
        self.audit(
            ctx,
            AuditEventType::RouteDecided,
            decision.task_id.to_string(),
            format!(
                "routed to {} (score {:.3})",
                decision.selected_instance_id, decision.score
            ),
        )
        .await?;

        item.transition(RouteState::Routed, self.clock.now())?;
        item.current_decision = Some(decision.decision_id);
        item.instance_id = Some(decision.selected_instance_id.clone());
        item.note = None;
        item.version = self.storage.save_work_item(item).await?;

        info!(
            task_id = %decision.task_id,
            instance = %decision.selected_instance_id,
            score = decision.score,
            candidates = decision.candidates_considered,
            "task routed"
        );
        Ok(())
    }

    async fn fail_scoring(&self, item: &mut WorkItem, error: &RoutingError) -> Result<()> {
        warn!(task_id = %item.task_id, error = %error, "routing failed");
        item.transition(RouteState::Failed, self.clock.now())?;
        item.note = Some(error.to_string());
        item.version = self.storage.save_work_item(item).await?;
        Ok(())
    }

    async fn audit(
        &self,
        ctx: &RequestContext,
        event_type: AuditEventType,
        subject: String,
        reason: String,
    ) -> Result<()> {
        let actor = if ctx.actor == AgentId::system() {
            AgentId::router()
        } else {
            ctx.actor.clone()
        };
        let event = AuditEvent::new(event_type, subject, actor, self.clock.now(), reason)
            .correlated(&ctx.correlation_id);
        self.storage.append_audit(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::InstanceDescriptor;
    use crate::registry::StaticRegistry;
    use async_trait::async_trait;
    use orca_core::{AuditEvent, LockRecord, ManualClock, NodeType, WorkFilter};
    use orca_storage::{CasOutcome, MemoryStorage};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        registry: Arc<StaticRegistry>,
        clock: ManualClock,
        router: Router,
    }

    fn fixture(instances: Vec<InstanceDescriptor>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(StaticRegistry::new(instances));
        let clock = ManualClock::starting_now();
        let router = Router::new(storage.clone(), registry.clone(), Arc::new(clock.clone()));
        Fixture { storage, registry, clock, router }
    }

    fn python_task() -> TaskSubmission {
        TaskSubmission::new(TaskId::new(), NodeType::Generate).require("python", ">=3.10")
    }

    fn python_pair() -> Vec<InstanceDescriptor> {
        vec![
            InstanceDescriptor::new("py39").with_capability("python", "3.9"),
            InstanceDescriptor::new("py311").with_capability("python", "3.11"),
        ]
    }

    #[tokio::test]
    async fn test_route_selects_instance_satisfying_version() {
        let f = fixture(python_pair());
        let task = python_task();
        let ctx = RequestContext::system();

        let decision = f.router.route(&ctx, &task).await.unwrap();
        assert_eq!(decision.selected_instance_id, "py311");
        assert!(decision.rationale.iter().any(|r| r.contains("python") && r.contains(">=3.10")));
        assert_eq!(
            decision.rejected["py39"],
            vec!["python 3.9 does not satisfy >=3.10".to_string()]
        );
        assert!(decision.evidence_refs.contains(&"capability:python=3.11@py311".to_string()));
        assert_eq!(decision.correlation_id, ctx.correlation_id);

        // Persisted and audited before returning.
        assert_eq!(f.storage.list_decisions(task.task_id).await.unwrap(), vec![decision.clone()]);
        let audit = f.storage.list_audit().await.unwrap();
        assert_eq!(audit[0].event_type, AuditEventType::RouteDecided);
        assert_eq!(audit[0].actor, AgentId::router());

        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Routed);
        assert_eq!(item.current_decision, Some(decision.decision_id));
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        let task = python_task();
        let first = fixture(python_pair()).router.route(&RequestContext::system(), &task).await.unwrap();
        let second = fixture(python_pair()).router.route(&RequestContext::system(), &task).await.unwrap();
        assert_eq!(first.selected_instance_id, second.selected_instance_id);
        assert_eq!(first.score, second.score);
        assert_eq!(first.breakdown, second.breakdown);
        assert_eq!(first.rationale, second.rationale);
    }

    #[tokio::test]
    async fn test_ties_go_to_smallest_instance_id() {
        let f = fixture(vec![InstanceDescriptor::new("beta"), InstanceDescriptor::new("alpha")]);
        let task = TaskSubmission::new(TaskId::new(), NodeType::Review);
        let decision = f.router.route(&RequestContext::system(), &task).await.unwrap();
        assert_eq!(decision.selected_instance_id, "alpha");
        assert_eq!(decision.candidates_considered, 2);
    }

    #[tokio::test]
    async fn test_no_eligible_instance_lists_every_candidate() {
        let f = fixture(vec![
            InstanceDescriptor::new("py39").with_capability("python", "3.9"),
            InstanceDescriptor::new("rusty").with_capability("rust", "1.80"),
        ]);
        let task = python_task();
        let err = f.router.route(&RequestContext::system(), &task).await.unwrap_err();
        match err {
            RoutingError::NoEligibleInstance { task_id, rejections } => {
                assert_eq!(task_id, task.task_id);
                assert_eq!(rejections.len(), 2);
                assert_eq!(rejections["rusty"], vec!["missing required capability python".to_string()]);
            }
            other => panic!("expected NoEligibleInstance, got {:?}", other),
        }

        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Failed);
        assert!(f.storage.list_decisions(task.task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_rejected() {
        let f = fixture(python_pair());
        f.registry.set_health("py311", false).await;
        let err = f.router.route(&RequestContext::system(), &python_task()).await.unwrap_err();
        let RoutingError::NoEligibleInstance { rejections, .. } = err else {
            panic!("expected NoEligibleInstance");
        };
        assert!(rejections["py311"].contains(&"instance is unhealthy".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_takes_lease_for_selected_instance() {
        let f = fixture(python_pair());
        let locks = LockManager::new(f.storage.clone(), Arc::new(f.clock.clone()));
        let task = python_task();

        let dispatch = f
            .router
            .dispatch(&RequestContext::system(), &task, &locks, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(dispatch.token.holder, "py311");
        assert_eq!(dispatch.token.resource_key, Router::execution_key(task.task_id));
        assert!(locks.is_held(&Router::execution_key(task.task_id)).await.unwrap());

        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Executing);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.resource_key.as_deref(), Some(dispatch.token.resource_key.as_str()));

        f.router.complete(task.task_id).await.unwrap();
        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert!(item.state.is_terminal());
    }

    #[tokio::test]
    async fn test_reroute_excludes_failed_instance_and_keeps_history() {
        let mut instances = python_pair();
        instances.push(InstanceDescriptor::new("py312").with_capability("python", "3.12"));
        let f = fixture(instances);
        let locks = LockManager::new(f.storage.clone(), Arc::new(f.clock.clone()));
        let task = python_task();
        let ctx = RequestContext::system();

        let first = f.router.dispatch(&ctx, &task, &locks, Duration::from_secs(60)).await.unwrap();
        locks.release(&first.token).await.unwrap();

        let event = f.router.reroute(&ctx, &task, RerouteReason::InstanceFailed).await.unwrap();
        assert_eq!(event.previous_decision, first.decision.decision_id);
        assert_eq!(event.previous_instance_id, first.decision.selected_instance_id);
        assert_ne!(event.new_instance_id, event.previous_instance_id);
        assert_eq!(event.reason, RerouteReason::InstanceFailed);

        let history = f.router.history(task.task_id).await.unwrap();
        assert_eq!(history.decisions.len(), 2);
        assert_eq!(history.decisions[0], first.decision);
        assert_eq!(history.decisions[1].supersedes, Some(first.decision.decision_id));
        assert_eq!(history.reroutes, vec![event.clone()]);
        assert!(history.decisions[1].rejected[&event.previous_instance_id][0].contains("instance_failed"));

        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Routed);
        assert_eq!(item.instance_id.as_deref(), Some(event.new_instance_id.as_str()));
    }

    #[tokio::test]
    async fn test_better_match_may_keep_instance() {
        let f = fixture(vec![InstanceDescriptor::new("only")]);
        let task = TaskSubmission::new(TaskId::new(), NodeType::Review);
        let ctx = RequestContext::system();
        f.router.route(&ctx, &task).await.unwrap();

        let event = f.router.reroute(&ctx, &task, RerouteReason::BetterMatch).await.unwrap();
        assert_eq!(event.new_instance_id, "only");

        // The only instance cannot be excluded and still leave a candidate.
        let err = f.router.reroute(&ctx, &task, RerouteReason::InstanceUnreachable).await.unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleInstance { .. }));
    }

    #[tokio::test]
    async fn test_reroute_of_unrouted_task_fails() {
        let f = fixture(python_pair());
        let err = f
            .router
            .reroute(&RequestContext::system(), &python_task(), RerouteReason::LeaseExpired)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotRouted(_)));
    }

    #[tokio::test]
    async fn test_failed_task_can_be_routed_again() {
        let f = fixture(vec![InstanceDescriptor::new("py39").with_capability("python", "3.9")]);
        let task = python_task();
        let ctx = RequestContext::system();
        assert!(f.router.route(&ctx, &task).await.is_err());

        f.registry
            .upsert(InstanceDescriptor::new("py311").with_capability("python", "3.11"))
            .await;
        let decision = f.router.route(&ctx, &task).await.unwrap();
        assert_eq!(decision.selected_instance_id, "py311");
    }

    #[tokio::test]
    async fn test_dispatch_conflicts_while_old_lease_is_live() {
        let f = fixture(vec![
            InstanceDescriptor::new("py311").with_capability("python", "3.11"),
            InstanceDescriptor::new("py312").with_capability("python", "3.12"),
        ]);
        let locks = LockManager::new(f.storage.clone(), Arc::new(f.clock.clone()));
        let task = python_task();
        let ctx = RequestContext::system();

        let first = f.router.dispatch(&ctx, &task, &locks, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.token.holder, "py311");

        // Rerouted without the old holder letting go of the lease.
        f.router.reroute(&ctx, &task, RerouteReason::InstanceUnreachable).await.unwrap();
        let err = f
            .router
            .dispatch(&ctx, &task, &locks, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Lock(orca_lock::LockError::Conflict { .. })));

        // Once the lease expires the new instance can take it.
        f.clock.advance(Duration::from_secs(61));
        let second = f.router.dispatch(&ctx, &task, &locks, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.token.holder, "py312");
        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.attempts, 2);
    }

    #[tokio::test]
    async fn test_routing_a_routed_task_again_rescores() {
        let f = fixture(python_pair());
        let task = python_task();
        let ctx = RequestContext::system();

        let first = f.router.route(&ctx, &task).await.unwrap();
        let second = f.router.route(&ctx, &task).await.unwrap();
        assert_eq!(second.selected_instance_id, first.selected_instance_id);
        assert_eq!(second.score, first.score);
        assert_eq!(second.breakdown, first.breakdown);
        assert_eq!(second.supersedes, Some(first.decision_id));

        let item = f.storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Routed);
        assert_eq!(item.current_decision, Some(second.decision_id));
        assert_eq!(f.router.history(task.task_id).await.unwrap().decisions.len(), 2);
    }

    /// Gives other tasks a turn before every storage call.
    struct YieldingStorage(MemoryStorage);

    #[async_trait]
    impl Storage for YieldingStorage {
        async fn get_lock(&self, key: &str) -> orca_storage::Result<Option<LockRecord>> {
            tokio::task::yield_now().await;
            self.0.get_lock(key).await
        }
        async fn compare_and_set_lock(
            &self,
            key: &str,
            expected: Option<u64>,
            new: Option<LockToken>,
        ) -> orca_storage::Result<CasOutcome> {
            tokio::task::yield_now().await;
            self.0.compare_and_set_lock(key, expected, new).await
        }
        async fn list_locks(&self) -> orca_storage::Result<Vec<LockRecord>> {
            tokio::task::yield_now().await;
            self.0.list_locks().await
        }
        async fn append_decision(&self, d: &RouteDecision) -> orca_storage::Result<()> {
            tokio::task::yield_now().await;
            self.0.append_decision(d).await
        }
        async fn list_decisions(&self, id: TaskId) -> orca_storage::Result<Vec<RouteDecision>> {
            tokio::task::yield_now().await;
            self.0.list_decisions(id).await
        }
        async fn append_reroute(&self, e: &RerouteEvent) -> orca_storage::Result<()> {
            tokio::task::yield_now().await;
            self.0.append_reroute(e).await
        }
        async fn list_reroutes(&self, id: TaskId) -> orca_storage::Result<Vec<RerouteEvent>> {
            tokio::task::yield_now().await;
            self.0.list_reroutes(id).await
        }
        async fn save_work_item(&self, item: &WorkItem) -> orca_storage::Result<u64> {
            tokio::task::yield_now().await;
            self.0.save_work_item(item).await
        }
        async fn load_work_item(&self, id: TaskId) -> orca_storage::Result<Option<WorkItem>> {
            tokio::task::yield_now().await;
            self.0.load_work_item(id).await
        }
        async fn list_work_items(&self, filter: &WorkFilter) -> orca_storage::Result<Vec<WorkItem>> {
            tokio::task::yield_now().await;
            self.0.list_work_items(filter).await
        }
        async fn append_audit(&self, e: &AuditEvent) -> orca_storage::Result<()> {
            tokio::task::yield_now().await;
            self.0.append_audit(e).await
        }
        async fn list_audit(&self) -> orca_storage::Result<Vec<AuditEvent>> {
            tokio::task::yield_now().await;
            self.0.list_audit().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_of_one_task_has_single_winner() {
        let storage = Arc::new(YieldingStorage(MemoryStorage::new()));
        let clock = ManualClock::starting_now();
        let router = Router::new(
            storage.clone(),
            Arc::new(StaticRegistry::new(python_pair())),
            Arc::new(clock.clone()),
        );
        let locks = LockManager::new(storage.clone(), Arc::new(clock.clone()));
        let task = python_task();
        let ctx = RequestContext::system();
        let ttl = Duration::from_secs(60);

        let (a, b) = tokio::join!(
            router.dispatch(&ctx, &task, &locks, ttl),
            router.dispatch(&ctx, &task, &locks, ttl),
        );
        let (winner, loser) = match (a, b) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            (a, b) => panic!("expected exactly one dispatch to win, got {:?} and {:?}", a, b),
        };
        assert!(matches!(
            loser,
            RoutingError::Lock(_) | RoutingError::Storage(_) | RoutingError::InvalidTransition(_)
        ));

        let key = Router::execution_key(task.task_id);
        let lease = locks.current(&key).await.unwrap().unwrap();
        assert_eq!(lease.lock_id, winner.token.lock_id);

        let item = storage.load_work_item(task.task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Executing);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.current_decision, Some(winner.decision.decision_id));
    }
}
