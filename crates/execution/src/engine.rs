//! The execution engine - drives a task graph through routing and leases.

use crate::graph::{GraphError, GraphSummary, NodeStatus, TaskGraph};
use async_trait::async_trait;
use orca_core::config::OrcaConfig;
use orca_core::{
    AuditEvent, AuditEventType, RequestContext, RerouteReason, RouteState, TaskId, TaskNode, TaskSubmission,
};
use orca_lock::{LockError, LockManager, ReleaseOutcome};
use orca_recovery::RecoveryReport;
use orca_routing::{Dispatch, Router, RoutingError};
use orca_storage::{Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A runner could not complete a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RunnerError(pub String);

/// Executes a dispatched task on its selected instance.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run `task` under `dispatch`.
    ///
    /// The engine renews the lease while this runs; a result that arrives
    /// after the lease was lost anyway is discarded and the task rerouted.
    async fn run(&self, task: &TaskNode, dispatch: &Dispatch) -> Result<(), RunnerError>;
}

/// Errors that stop the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Graph status bookkeeping failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Routing failed for a reason other than ineligibility
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Lease bookkeeping failed
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Configuration for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Execution attempts per task before it is failed
    pub max_attempts: u32,
    /// TTL of the execution lease
    pub lease_ttl: Duration,
    /// Max cycles before stopping (None = until the graph is finished)
    pub max_cycles: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&OrcaConfig::default())
    }
}

impl From<&OrcaConfig> for EngineConfig {
    fn from(config: &OrcaConfig) -> Self {
        Self {
            max_attempts: config.recovery.max_attempts,
            lease_ttl: config.routing.lease_ttl(),
            max_cycles: None,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Tasks that ran to completion
    pub succeeded: Vec<TaskId>,
    /// Tasks given up on
    pub failed: Vec<TaskId>,
    /// Tasks sent to another instance after a failure
    pub rerouted: Vec<TaskId>,
    /// Tasks whose lease was busy; they stay pending
    pub waiting: Vec<TaskId>,
}

impl CycleReport {
    /// Whether the graph moved.
    pub fn made_progress(&self) -> bool {
        !(self.succeeded.is_empty() && self.failed.is_empty() && self.rerouted.is_empty())
    }
}

/// Result of a single execution cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    /// Ready nodes were dispatched
    Progress(CycleReport),
    /// Nothing is ready but the graph is not finished
    Idle,
    /// Nothing left to run
    Finished,
}

/// The execution engine.
///
/// Runs the dispatch loop:
/// ```text
/// Ready nodes → Route + Lease → Run (renewing) → Complete | Reroute | Fail → Release
/// ```
///
/// The work item is updated while the lease is still held, so a recovery
/// sweep never sees a released lease in front of a stale `Executing` item.
pub struct ExecutionEngine {
    graph: TaskGraph,
    storage: Arc<dyn Storage>,
    router: Arc<Router>,
    locks: LockManager,
    runner: Arc<dyn TaskRunner>,
    config: EngineConfig,
    cycles_run: usize,
}

impl ExecutionEngine {
    /// Create a new execution engine.
    pub fn new(
        graph: TaskGraph,
        storage: Arc<dyn Storage>,
        router: Arc<Router>,
        locks: LockManager,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            graph,
            storage,
            router,
            locks,
            runner,
            config: EngineConfig::default(),
            cycles_run: 0,
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one execution cycle over the currently ready nodes.
    pub async fn run_cycle(&mut self, ctx: &RequestContext) -> Result<CycleResult, EngineError> {
        if self.graph.is_finished() {
            return Ok(CycleResult::Finished);
        }
        let ready: Vec<TaskNode> = self.graph.ready_nodes().into_iter().cloned().collect();
        if ready.is_empty() {
            debug!("no ready nodes");
            return Ok(CycleResult::Idle);
        }

        info!(cycle = self.cycles_run + 1, ready = ready.len(), "starting execution cycle");
        let mut report = CycleReport::default();
        for node in &ready {
            self.execute(ctx, node, &mut report).await?;
        }
        self.cycles_run += 1;
        Ok(CycleResult::Progress(report))
    }

    /// Run cycles until the graph is finished or stops moving.
    pub async fn run(&mut self, ctx: &RequestContext) -> Result<GraphSummary, EngineError> {
        loop {
            if let Some(max) = self.config.max_cycles {
                if self.cycles_run >= max {
                    info!("Reached max cycles ({})", max);
                    break;
                }
            }

            match self.run_cycle(ctx).await? {
                CycleResult::Finished => {
                    info!("graph finished");
                    break;
                }
                CycleResult::Idle => {
                    warn!("no runnable nodes left");
                    break;
                }
                CycleResult::Progress(report) if !report.made_progress() => {
                    warn!(waiting = report.waiting.len(), "every ready node is waiting on a lease");
                    break;
                }
                CycleResult::Progress(_) => {}
            }
        }

        let summary = self.graph.summary();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            blocked = summary.blocked,
            pending = summary.pending,
            "execution stopped"
        );
        Ok(summary)
    }

    /// Feed a recovery sweep's outcome back into the graph.
    ///
    /// Requeued tasks are rerouted away from the instance whose lease expired
    /// and become pending again; escalated tasks are failed. Tasks that have
    /// moved on since the sweep (the engine already rerouted or finished
    /// them) are left alone. Returns the tasks that will run again.
    pub async fn apply_recovery(
        &mut self,
        ctx: &RequestContext,
        report: &RecoveryReport,
    ) -> Result<Vec<TaskId>, EngineError> {
        let mut requeued = Vec::new();

        for &task_id in &report.requeued {
            let Some(node) = self.graph.node(task_id).cloned() else {
                continue;
            };
            let state = self.storage.load_work_item(task_id).await?.map(|item| item.state);
            if state != Some(RouteState::Rerouted) {
                debug!(task_id = %task_id, ?state, "requeued task already moved on");
                continue;
            }
            let submission = TaskSubmission::from(&node);
            match self.router.reroute(ctx, &submission, RerouteReason::LeaseExpired).await {
                Ok(_) => {
                    if matches!(self.graph.status(task_id), Some(NodeStatus::Running | NodeStatus::Failed)) {
                        self.graph.reset(task_id)?;
                    }
                    requeued.push(task_id);
                }
                Err(RoutingError::NoEligibleInstance { .. }) => {
                    warn!(task_id = %task_id, "no instance left for recovered task");
                    self.fail_node(task_id)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        for &task_id in &report.escalated {
            let escalated = self
                .storage
                .load_work_item(task_id)
                .await?
                .is_some_and(|item| item.escalated && item.state == RouteState::Failed);
            if escalated && self.graph.contains(task_id) {
                warn!(task_id = %task_id, "recovered task escalated for manual intervention");
                self.fail_node(task_id)?;
            }
        }

        Ok(requeued)
    }

    /// Get cycles run so far.
    pub fn cycles(&self) -> usize {
        self.cycles_run
    }

    /// The graph being executed.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    async fn execute(&mut self, ctx: &RequestContext, node: &TaskNode, report: &mut CycleReport) -> Result<(), EngineError> {
        let task_id = node.task_id;
        let submission = TaskSubmission::from(node);
        self.graph.mark_running(task_id)?;

        let dispatch = match self
            .router
            .dispatch(ctx, &submission, &self.locks, self.config.lease_ttl)
            .await
        {
            Ok(dispatch) => dispatch,
            Err(RoutingError::Lock(LockError::Conflict { current_owner, retry_after, .. })) => {
                debug!(task_id = %task_id, owner = %current_owner, ?retry_after, "execution lease busy");
                self.graph.reset(task_id)?;
                report.waiting.push(task_id);
                return Ok(());
            }
            Err(RoutingError::NoEligibleInstance { rejections, .. }) => {
                warn!(task_id = %task_id, candidates = rejections.len(), "no eligible instance");
                self.graph.mark_failed(task_id)?;
                report.failed.push(task_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.run_with_heartbeat(node, &dispatch).await {
            Ok(()) => {
                if self.complete_if_held(&dispatch).await? {
                    self.release(ctx, &dispatch).await?;
                    self.graph.mark_succeeded(task_id)?;
                    report.succeeded.push(task_id);
                    info!(task_id = %task_id, instance = %dispatch.decision.selected_instance_id, "task succeeded");
                } else {
                    // The result arrived after the lease was lost; someone
                    // else may already own the task.
                    warn!(task_id = %task_id, "lease lost before completion");
                    self.retry_or_fail(ctx, &submission, RerouteReason::LeaseExpired, report).await?;
                    self.release(ctx, &dispatch).await?;
                }
            }
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    instance = %dispatch.decision.selected_instance_id,
                    error = %e,
                    "task failed"
                );
                self.retry_or_fail(ctx, &submission, RerouteReason::InstanceFailed, report).await?;
                self.release(ctx, &dispatch).await?;
            }
        }
        Ok(())
    }

    /// Run the task, renewing its lease every third of the TTL.
    ///
    /// A failed renewal stops the heartbeat but not the run; the lost lease
    /// is noticed when the result comes back.
    async fn run_with_heartbeat(&self, node: &TaskNode, dispatch: &Dispatch) -> Result<(), RunnerError> {
        let ttl = self.config.lease_ttl;
        let period = (ttl / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run = self.runner.run(node, dispatch);
        tokio::pin!(run);
        let mut renewing = true;

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = heartbeat.tick(), if renewing => {
                    match self.locks.renew(&dispatch.token, ttl).await {
                        Ok(renewed) => debug!(
                            resource = %renewed.resource_key,
                            expires_at = %renewed.expires_at,
                            "execution lease renewed"
                        ),
                        Err(e) => {
                            warn!(resource = %dispatch.token.resource_key, error = %e, "could not renew execution lease");
                            renewing = false;
                        }
                    }
                }
            }
        }
    }

    /// Complete the work item if this dispatch still holds its lease.
    async fn complete_if_held(&self, dispatch: &Dispatch) -> Result<bool, EngineError> {
        let held = self
            .locks
            .current(&dispatch.token.resource_key)
            .await?
            .is_some_and(|current| current.lock_id == dispatch.token.lock_id);
        if !held {
            return Ok(false);
        }
        match self.router.complete(dispatch.token.task_id).await {
            Ok(_) => Ok(true),
            // Recovered by a sweep between the check and the update.
            Err(RoutingError::InvalidTransition(_)) => Ok(false),
            Err(RoutingError::Storage(e)) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reroute while attempts remain, otherwise fail the task.
    async fn retry_or_fail(
        &mut self,
        ctx: &RequestContext,
        submission: &TaskSubmission,
        reason: RerouteReason,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let task_id = submission.task_id;
        let item = self.storage.load_work_item(task_id).await?;
        let retryable = item.as_ref().is_some_and(|item| {
            item.attempts < self.config.max_attempts
                && matches!(item.state, RouteState::Executing | RouteState::Rerouted)
        });

        if !retryable {
            if item.as_ref().is_some_and(|item| item.state == RouteState::Executing) {
                self.router.fail(task_id, format!("gave up after {}", reason)).await?;
            }
            self.graph.mark_failed(task_id)?;
            report.failed.push(task_id);
            return Ok(());
        }

        match self.router.reroute(ctx, submission, reason).await {
            Ok(event) => {
                debug!(task_id = %task_id, to = %event.new_instance_id, "retrying on another instance");
                self.graph.reset(task_id)?;
                report.rerouted.push(task_id);
            }
            Err(RoutingError::NoEligibleInstance { .. }) => {
                self.graph.mark_failed(task_id)?;
                report.failed.push(task_id);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Release the execution lease. A lease that is already gone is fine.
    async fn release(&self, ctx: &RequestContext, dispatch: &Dispatch) -> Result<(), EngineError> {
        let token = &dispatch.token;
        match self.locks.release(token).await? {
            ReleaseOutcome::Released => {
                let event = AuditEvent::new(
                    AuditEventType::LockReleased,
                    &token.resource_key,
                    ctx.actor.clone(),
                    self.locks.clock().now(),
                    format!("{} finished task {}", token.holder, token.task_id),
                )
                .correlated(&ctx.correlation_id);
                if let Err(e) = self.storage.append_audit(&event).await {
                    error!(resource = %token.resource_key, error = %e, "could not audit lease release");
                }
            }
            ReleaseOutcome::NotHeld => {
                debug!(resource = %token.resource_key, "execution lease already gone");
            }
        }
        Ok(())
    }

    fn fail_node(&mut self, task_id: TaskId) -> Result<(), GraphError> {
        match self.graph.status(task_id) {
            Some(NodeStatus::Failed) | Some(NodeStatus::Succeeded) | None => Ok(()),
            Some(_) => self.graph.mark_failed(task_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use orca_core::{LockToken, ManualClock, NodeType};
    use orca_recovery::RecoverySweep;
    use orca_routing::{InstanceDescriptor, StaticRegistry};
    use orca_storage::MemoryStorage;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records calls and fails on chosen instances.
    #[derive(Default)]
    struct ScriptedRunner {
        failing_instances: HashSet<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedRunner {
        fn failing_on(instances: &[&str]) -> Self {
            Self {
                failing_instances: instances.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, task: &TaskNode, dispatch: &Dispatch) -> Result<(), RunnerError> {
            let instance = dispatch.decision.selected_instance_id.clone();
            self.calls.lock().unwrap().push((task.title.clone(), instance.clone()));
            if self.failing_instances.contains(&instance) {
                return Err(RunnerError(format!("{} crashed", instance)));
            }
            Ok(())
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        clock: ManualClock,
        router: Arc<Router>,
        locks: LockManager,
    }

    fn fixture(instances: Vec<InstanceDescriptor>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_now();
        let registry = Arc::new(StaticRegistry::new(instances));
        let router = Arc::new(Router::new(storage.clone(), registry, Arc::new(clock.clone())));
        let locks = LockManager::new(storage.clone(), Arc::new(clock.clone()));
        Fixture { storage, clock, router, locks }
    }

    fn two_instances() -> Vec<InstanceDescriptor> {
        vec![InstanceDescriptor::new("a"), InstanceDescriptor::new("b")]
    }

    fn chain(titles: &[&str]) -> (TaskGraph, Vec<TaskId>) {
        let mut builder = GraphBuilder::new();
        let mut ids: Vec<TaskId> = Vec::new();
        for title in titles {
            let node = TaskNode::new(NodeType::Scan, *title);
            let deps: Vec<TaskId> = ids.last().copied().into_iter().collect();
            ids.push(node.task_id);
            builder.add_node(node, &deps).unwrap();
        }
        (builder.build().unwrap(), ids)
    }

    fn engine(f: &Fixture, graph: TaskGraph, runner: Arc<ScriptedRunner>) -> ExecutionEngine {
        ExecutionEngine::new(graph, f.storage.clone(), f.router.clone(), f.locks.clone(), runner)
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan", "verify", "review"]);
        let runner = Arc::new(ScriptedRunner::default());
        let mut engine = engine(&f, graph, runner.clone());

        let summary = engine.run(&RequestContext::system()).await.unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(engine.cycles(), 3);

        let titles: Vec<_> = runner.calls().into_iter().map(|(t, _)| t).collect();
        assert_eq!(titles, vec!["scan", "verify", "review"]);

        for id in ids {
            let item = f.storage.load_work_item(id).await.unwrap().unwrap();
            assert_eq!(item.state, RouteState::Completed);
            assert!(!f.locks.is_held(&Router::execution_key(id)).await.unwrap());
        }
        let released = f
            .storage
            .list_audit()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::LockReleased)
            .count();
        assert_eq!(released, 3);
    }

    #[tokio::test]
    async fn test_failed_run_is_rerouted_to_another_instance() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan"]);
        let runner = Arc::new(ScriptedRunner::failing_on(&["a"]));
        let mut engine = engine(&f, graph, runner.clone());

        let summary = engine.run(&RequestContext::system()).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let instances: Vec<_> = runner.calls().into_iter().map(|(_, i)| i).collect();
        assert_eq!(instances, vec!["a", "b"]);

        let history = f.router.history(ids[0]).await.unwrap();
        assert_eq!(history.decisions.len(), 2);
        assert_eq!(history.reroutes[0].reason, RerouteReason::InstanceFailed);
    }

    #[tokio::test]
    async fn test_exhausted_task_fails_and_blocks_dependents() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan", "review"]);
        let runner = Arc::new(ScriptedRunner::failing_on(&["a", "b"]));
        let mut engine = engine(&f, graph, runner.clone());

        let summary = engine.run(&RequestContext::system()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.blocked, 1);
        assert!(engine.graph().is_finished());

        // Only the last instance is excluded on reroute, so a is tried again
        // until the attempt budget runs out.
        let instances: Vec<_> = runner.calls().into_iter().map(|(_, i)| i).collect();
        assert_eq!(instances, vec!["a", "b", "a"]);
        let item = f.storage.load_work_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Failed);
        assert!(f.storage.load_work_item(ids[1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempt_budget_stops_retries() {
        let f = fixture(vec![
            InstanceDescriptor::new("a"),
            InstanceDescriptor::new("b"),
            InstanceDescriptor::new("c"),
        ]);
        let (graph, ids) = chain(&["scan"]);
        let runner = Arc::new(ScriptedRunner::failing_on(&["a", "b", "c"]));
        let config = EngineConfig {
            max_attempts: 2,
            ..EngineConfig::default()
        };
        let mut engine = engine(&f, graph, runner.clone()).with_config(config);

        let summary = engine.run(&RequestContext::system()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(runner.calls().len(), 2);
        let item = f.storage.load_work_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Failed);
        assert_eq!(item.attempts, 2);
    }

    #[tokio::test]
    async fn test_recovered_task_is_rerouted_and_rerun() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan"]);
        let task_id = ids[0];
        let runner = Arc::new(ScriptedRunner::default());
        let mut engine = engine(&f, graph, runner.clone());
        let ctx = RequestContext::system();

        // Simulate a crash: dispatched on "a", never released.
        let node = engine.graph().node(task_id).cloned().unwrap();
        engine.graph.mark_running(task_id).unwrap();
        f.router
            .dispatch(&ctx, &TaskSubmission::from(&node), &f.locks, Duration::from_secs(1))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(2));

        let sweep = RecoverySweep::new(f.storage.clone(), f.locks.clone());
        let report = sweep.run_once(&ctx).await.unwrap();
        assert_eq!(report.requeued, vec![task_id]);

        let requeued = engine.apply_recovery(&ctx, &report).await.unwrap();
        assert_eq!(requeued, vec![task_id]);
        assert_eq!(engine.graph().status(task_id), Some(NodeStatus::Pending));

        let summary = engine.run(&ctx).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(runner.calls(), vec![("scan".to_string(), "b".to_string())]);

        let history = f.router.history(task_id).await.unwrap();
        assert_eq!(history.reroutes[0].reason, RerouteReason::LeaseExpired);
    }

    #[tokio::test]
    async fn test_escalated_task_fails_its_node() {
        let f = fixture(two_instances());
        let mut builder = GraphBuilder::new();
        let node = TaskNode::new(NodeType::Apply, "apply");
        let task_id = node.task_id;
        builder.add_node(node.clone(), &[]).unwrap();
        let mut engine = engine(&f, builder.build().unwrap(), Arc::new(ScriptedRunner::default()));
        let ctx = RequestContext::system();

        engine.graph.mark_running(task_id).unwrap();
        f.router
            .dispatch(&ctx, &TaskSubmission::from(&node), &f.locks, Duration::from_secs(1))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(2));

        let report = RecoverySweep::new(f.storage.clone(), f.locks.clone())
            .run_once(&ctx)
            .await
            .unwrap();
        assert_eq!(report.escalated, vec![task_id]);

        let requeued = engine.apply_recovery(&ctx, &report).await.unwrap();
        assert!(requeued.is_empty());
        assert_eq!(engine.graph().status(task_id), Some(NodeStatus::Failed));
        assert!(engine.graph().is_finished());
    }

    #[tokio::test]
    async fn test_busy_lease_leaves_node_waiting() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan"]);
        let task_id = ids[0];
        // A stale holder still owns the execution lease.
        f.locks
            .acquire(&Router::execution_key(task_id), task_id, "ghost", Duration::from_secs(60))
            .await
            .unwrap();

        let mut engine = engine(&f, graph, Arc::new(ScriptedRunner::default()));
        let result = engine.run_cycle(&RequestContext::system()).await.unwrap();
        match result {
            CycleResult::Progress(report) => {
                assert_eq!(report.waiting, vec![task_id]);
                assert!(!report.made_progress());
            }
            other => panic!("unexpected cycle result: {:?}", other),
        }
        assert_eq!(engine.graph().status(task_id), Some(NodeStatus::Pending));
    }

    /// Moves the clock on while running, optionally past the lease.
    struct SlowRunner {
        clock: ManualClock,
        locks: LockManager,
        advance: Duration,
        wall_time: Duration,
        /// (token at dispatch, live lease mid-run)
        seen: Mutex<Vec<(LockToken, LockToken)>>,
    }

    #[async_trait]
    impl TaskRunner for SlowRunner {
        async fn run(&self, _task: &TaskNode, dispatch: &Dispatch) -> Result<(), RunnerError> {
            self.clock.advance(self.advance);
            tokio::time::sleep(self.wall_time).await;
            if let Ok(Some(current)) = self.locks.current(&dispatch.token.resource_key).await {
                self.seen.lock().unwrap().push((dispatch.token.clone(), current));
            }
            self.clock.advance(self.advance);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_long_run_keeps_its_lease_alive() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan"]);
        let runner = Arc::new(SlowRunner {
            clock: f.clock.clone(),
            locks: f.locks.clone(),
            advance: Duration::from_millis(20),
            wall_time: Duration::from_millis(100),
            seen: Mutex::new(Vec::new()),
        });
        let config = EngineConfig {
            lease_ttl: Duration::from_millis(30),
            ..EngineConfig::default()
        };
        let mut engine = ExecutionEngine::new(graph, f.storage.clone(), f.router.clone(), f.locks.clone(), runner.clone())
            .with_config(config);

        let summary = engine.run(&RequestContext::system()).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        // Renewed past the original expiry while the runner slept.
        let seen = runner.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let (granted, live) = &seen[0];
        assert_eq!(live.lock_id, granted.lock_id);
        assert!(live.expires_at > granted.expires_at);

        let history = f.router.history(ids[0]).await.unwrap();
        assert!(history.reroutes.is_empty());
        let item = f.storage.load_work_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Completed);
    }

    #[tokio::test]
    async fn test_recovery_after_engine_reroute_is_not_applied_twice() {
        let f = fixture(two_instances());
        let (graph, ids) = chain(&["scan"]);
        let task_id = ids[0];
        // Outlives a 1s lease in one step, with no wall time for a heartbeat.
        let runner = Arc::new(SlowRunner {
            clock: f.clock.clone(),
            locks: f.locks.clone(),
            advance: Duration::from_secs(2),
            wall_time: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let config = EngineConfig {
            lease_ttl: Duration::from_secs(1),
            ..EngineConfig::default()
        };
        let mut engine = ExecutionEngine::new(graph, f.storage.clone(), f.router.clone(), f.locks.clone(), runner)
            .with_config(config);
        let ctx = RequestContext::system();

        let result = engine.run_cycle(&ctx).await.unwrap();
        let CycleResult::Progress(report) = result else {
            panic!("expected progress, got {:?}", result);
        };
        assert_eq!(report.rerouted, vec![task_id]);

        // A sweep that saw the task before the engine rerouted it.
        let stale = RecoveryReport {
            requeued: vec![task_id],
            ..RecoveryReport::default()
        };
        let requeued = engine.apply_recovery(&ctx, &stale).await.unwrap();
        assert!(requeued.is_empty());

        let history = f.router.history(task_id).await.unwrap();
        assert_eq!(history.reroutes.len(), 1);
        assert_eq!(history.reroutes[0].reason, RerouteReason::LeaseExpired);
        let item = f.storage.load_work_item(task_id).await.unwrap().unwrap();
        assert_eq!(item.state, RouteState::Routed);
        assert_eq!(engine.graph().status(task_id), Some(NodeStatus::Pending));
    }
}
