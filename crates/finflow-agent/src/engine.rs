//! GraphFlow, the orchestration engine.
//!
//! A request moves through `Routing → Executing → Aggregating →
//! Completed | Failed`. Executing walks the plan stage by stage: a
//! single-node stage runs inline on the request context, a multi-node stage
//! runs one branch per node on forks of it. After each stage the conditional
//! edges leaving its nodes are evaluated to find the next stage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finflow_core::config::EngineConfig;
use finflow_core::context::ExecutionContext;
use finflow_core::error::{FinflowError, Result};
use finflow_core::event::EventBus;
use finflow_core::types::{
    EngineEvent, EngineState, FailureKind, NodeFailure, NodeId, NodeOutput, RequestId,
    WorkerResponse,
};

use crate::aggregator::{AggregationResult, Aggregator};
use crate::graph::{ExecutionPlan, Node, WorkerNode, WorkflowGraph};
use crate::router::{detect_sector, Intent, IntentRouter, RouteDecision};
use crate::team::{self, TeamResult};

/// Scratch hints supplied with a request (user email, risk tolerance, ...).
pub type SessionContext = HashMap<String, serde_json::Value>;

/// Scratch key holding the merged content handed to the synthesizer.
pub const MERGED_CONTENT_KEY: &str = "merged_content";

/// Timeouts and concurrency limits, resolved from `[engine]`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    pub branch_timeout: Duration,
    pub worker_timeout: Duration,
    pub max_concurrent_branches: usize,
    pub max_concurrent_requests: usize,
    pub max_selector_iterations: usize,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            branch_timeout: Duration::from_secs(config.branch_timeout_secs),
            worker_timeout: Duration::from_secs(config.worker_timeout_secs),
            max_concurrent_branches: config.max_concurrent_branches.max(1),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            max_selector_iterations: config.max_selector_iterations,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Everything the caller learns about a finished request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    pub intent: Intent,
    pub state: EngineState,
    /// Every state the request passed through, in order.
    pub states: Vec<EngineState>,
    pub result: AggregationResult,
    pub plan: ExecutionPlan,
    /// Top-level stages actually run.
    pub executed: Vec<Vec<NodeId>>,
    /// The request context, kept for diagnostics.
    pub context: ExecutionContext,
    /// Routing failed and the default entry was used.
    pub routing_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_error: Option<String>,
    /// Required top-level nodes that produced nothing and had no fallback.
    pub unrecovered: Vec<NodeId>,
    pub elapsed_ms: u64,
}

impl RequestOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == EngineState::Completed
    }

    /// Text to present: the synthesis when there is one, else the merge.
    pub fn response(&self) -> &str {
        self.result.final_text()
    }
}

/// The orchestration engine. Cheap to share behind an `Arc`; the graph is
/// immutable and every request gets its own context.
pub struct GraphFlow {
    graph: Arc<WorkflowGraph>,
    router: Arc<IntentRouter>,
    aggregator: Aggregator,
    settings: EngineSettings,
    branch_permits: Arc<Semaphore>,
    request_permits: Arc<Semaphore>,
    event_bus: Arc<EventBus>,
    synthesizer: Option<WorkerNode>,
}

impl std::fmt::Debug for GraphFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFlow").finish_non_exhaustive()
    }
}

impl GraphFlow {
    pub fn new(graph: Arc<WorkflowGraph>, router: IntentRouter, settings: EngineSettings) -> Self {
        Self {
            graph,
            router: Arc::new(router),
            aggregator: Aggregator::new(),
            branch_permits: Arc::new(Semaphore::new(settings.max_concurrent_branches)),
            request_permits: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
            settings,
            event_bus: Arc::new(EventBus::default()),
            synthesizer: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Worker invoked once on the merged content of each successful request.
    pub fn with_synthesizer(mut self, node: WorkerNode) -> Self {
        self.synthesizer = Some(node);
        self
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Route a query and project its plan without running anything.
    pub fn plan(&self, query: &str) -> (Result<RouteDecision>, ExecutionPlan) {
        match self.router.route(query) {
            Ok(decision) => {
                let plan = ExecutionPlan::from_decision(&self.graph, &decision);
                (Ok(decision), plan)
            }
            Err(e) => (Err(e), ExecutionPlan::fallback(&self.graph)),
        }
    }

    /// Run one request to completion.
    pub async fn submit(&self, query: &str, session: Option<SessionContext>) -> RequestOutcome {
        self.submit_with_cancel(query, session, CancellationToken::new())
            .await
    }

    /// Run one request; cancelling the token aborts outstanding worker calls
    /// and moves the request straight to aggregation.
    pub async fn submit_with_cancel(
        &self,
        query: &str,
        session: Option<SessionContext>,
        cancel: CancellationToken,
    ) -> RequestOutcome {
        // The semaphore is never closed
        let _request_permit = self.request_permits.acquire().await.ok();

        let started = Instant::now();
        let deadline = started + self.settings.request_timeout;
        let request_id = RequestId::new();
        let mut states = Vec::new();

        self.event_bus.publish(EngineEvent::RequestStarted {
            request_id: request_id.clone(),
            query: query.to_string(),
        });
        info!(request_id = %request_id, "Request started");

        self.transition(&request_id, &mut states, EngineState::Routing);
        let (routed, plan) = self.plan(query);
        let routing_error = match routed {
            Ok(_) => None,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Routing failed, using default entry");
                Some(e.to_string())
            }
        };
        self.event_bus.publish(EngineEvent::Routed {
            request_id: request_id.clone(),
            intent: plan.intent.to_string(),
            entry: plan.entry.clone(),
            broad: plan.broad,
            fallback: routing_error.is_some(),
        });
        info!(
            request_id = %request_id,
            intent = %plan.intent,
            entry = %plan.entry,
            broad = plan.broad,
            stages = plan.stages.len(),
            "Request routed"
        );

        let mut ctx = ExecutionContext::new(request_id.clone(), query);
        if let Some(session) = session {
            ctx = ctx.with_session(session);
        }
        ctx.set_fact("intent", serde_json::Value::String(plan.intent.to_string()));
        if ctx.fact("sector").is_none() {
            if let Some(sector) = detect_sector(query) {
                ctx.set_fact("sector", serde_json::Value::String(sector.to_string()));
            }
        }

        self.transition(&request_id, &mut states, EngineState::Executing);
        let run = RequestRun {
            graph: &self.graph,
            settings: &self.settings,
            permits: &self.branch_permits,
            events: &self.event_bus,
            request_id: request_id.clone(),
            deadline,
            cancel,
        };
        let walk = run.walk(&plan, &mut ctx).await;

        self.transition(&request_id, &mut states, EngineState::Aggregating);
        let mut result = self.aggregator.merge(walk.outputs, walk.failures);
        if !walk.insufficient_teams.is_empty() {
            result.insufficient = true;
        }
        if !result.insufficient {
            if let Some(synth) = &self.synthesizer {
                ctx.set_fact(
                    MERGED_CONTENT_KEY,
                    serde_json::Value::String(result.content.clone()),
                );
                let mut synthesized = run.invoke_worker(synth, &mut ctx, deadline).await;
                match synthesized.outputs.pop() {
                    Some(out) => result.synthesis = Some(out.content),
                    None => result.failures.extend(synthesized.failures),
                }
            }
        }

        let state = if result.insufficient || !walk.unrecovered.is_empty() {
            EngineState::Failed
        } else {
            EngineState::Completed
        };
        self.transition(&request_id, &mut states, state);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.event_bus.publish(EngineEvent::RequestFinished {
            request_id: request_id.clone(),
            state,
            contributors: result.contributors.len(),
            failures: result.failures.len(),
            elapsed_ms,
        });
        info!(
            request_id = %request_id,
            state = %state,
            contributors = result.contributors.len(),
            failures = result.failures.len(),
            elapsed_ms,
            "Request finished"
        );

        RequestOutcome {
            request_id,
            intent: plan.intent,
            state,
            states,
            result,
            executed: walk.executed,
            plan,
            context: ctx,
            routing_fallback: routing_error.is_some(),
            routing_error,
            unrecovered: walk.unrecovered,
            elapsed_ms,
        }
    }

    fn transition(&self, request_id: &RequestId, states: &mut Vec<EngineState>, state: EngineState) {
        debug!(request_id = %request_id, state = %state, "State transition");
        states.push(state);
        self.event_bus.publish(EngineEvent::StateChanged {
            request_id: request_id.clone(),
            state,
        });
    }
}

/// What the Executing phase produced.
#[derive(Debug, Default)]
struct Walk {
    outputs: Vec<NodeOutput>,
    failures: Vec<NodeFailure>,
    executed: Vec<Vec<NodeId>>,
    unrecovered: Vec<NodeId>,
    /// Required teams below the top level that ended with no output.
    insufficient_teams: Vec<NodeId>,
}

/// Per-request execution handle shared by the engine and team code.
pub(crate) struct RequestRun<'a> {
    pub graph: &'a WorkflowGraph,
    pub settings: &'a EngineSettings,
    permits: &'a Semaphore,
    events: &'a EventBus,
    pub request_id: RequestId,
    /// The request deadline; every other deadline is at most this.
    deadline: Instant,
    cancel: CancellationToken,
}

impl<'a> RequestRun<'a> {
    async fn walk(&self, plan: &ExecutionPlan, ctx: &mut ExecutionContext) -> Walk {
        let mut walk = Walk::default();
        let mut stage: Vec<NodeId> = plan.stages.first().cloned().unwrap_or_default();
        let mut visited: HashSet<NodeId> = stage.iter().cloned().collect();

        while !stage.is_empty() {
            if let Some(kind) = self.expired(self.deadline) {
                for id in &stage {
                    let f = self.fail(ctx, id, kind, "not started before the request deadline");
                    walk.failures.push(f);
                }
                break;
            }

            debug!(request_id = %self.request_id, stage = ?stage, "Running stage");
            let results = if stage.len() == 1 {
                vec![self.execute_node(&stage[0], ctx, self.deadline).await]
            } else {
                let branch_deadline = self
                    .deadline
                    .min(Instant::now() + self.settings.branch_timeout);
                team::run_branches(self, &stage, ctx, branch_deadline).await
            };
            walk.executed.push(stage.clone());

            let mut next = Vec::new();
            for (id, result) in stage.iter().zip(results) {
                let produced = result.has_output();
                // Required teams nested below the stage node
                for nested in result
                    .failures
                    .iter()
                    .filter(|f| f.kind == FailureKind::Insufficient && &f.node_id != id)
                {
                    warn!(request_id = %self.request_id, node_id = %nested.node_id, "Required nested team produced no output");
                    walk.insufficient_teams.push(nested.node_id.clone());
                    walk.unrecovered.push(nested.node_id.clone());
                }
                walk.outputs.extend(result.outputs);
                walk.failures.extend(result.failures);

                let mut fired = false;
                for edge in self.graph.continuations(id) {
                    if edge.holds(ctx) {
                        fired = true;
                        if visited.insert(edge.to.clone()) {
                            next.push(edge.to.clone());
                        }
                    }
                }

                let required = self.graph.node(id).is_some_and(|n| !n.is_optional());
                if !produced && !fired && required {
                    warn!(request_id = %self.request_id, node_id = %id, "Required node produced no output and has no fallback");
                    walk.unrecovered.push(id.clone());
                }
            }
            stage = next;
        }
        walk
    }

    /// Run a worker or team node.
    pub fn execute_node<'b>(
        &'b self,
        id: &'b NodeId,
        ctx: &'b mut ExecutionContext,
        deadline: Instant,
    ) -> BoxFuture<'b, TeamResult> {
        Box::pin(async move {
            match self.graph.node(id) {
                Some(Node::Worker(w)) => self.invoke_worker(w, ctx, deadline).await,
                Some(Node::Team(t)) => team::execute(self, t, ctx, deadline).await,
                None => TeamResult::failed(self.fail(
                    ctx,
                    id,
                    FailureKind::Worker,
                    format!("unknown node {}", id),
                )),
            }
        })
    }

    /// One bounded worker call: deadline, input contract, permit, then the
    /// call itself raced against cancellation.
    pub async fn invoke_worker(
        &self,
        node: &WorkerNode,
        ctx: &mut ExecutionContext,
        deadline: Instant,
    ) -> TeamResult {
        if let Some(kind) = self.expired(deadline) {
            return TeamResult::failed(self.fail(ctx, &node.id, kind, "not started before the deadline"));
        }

        let missing = ctx.missing_inputs(&node.reads);
        if !missing.is_empty() {
            let err = FinflowError::MalformedContext {
                node: node.id.to_string(),
                message: format!("missing inputs: {}", missing.join(", ")),
            };
            return TeamResult::failed(self.fail(ctx, &node.id, FailureKind::Worker, err.to_string()));
        }

        let timeout = node.timeout.unwrap_or(self.settings.worker_timeout);
        let call_deadline = deadline.min(Instant::now() + timeout);
        let started = Instant::now();

        let _permit = match timeout_at(call_deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return TeamResult::failed(self.fail(
                    ctx,
                    &node.id,
                    FailureKind::Cancelled,
                    "worker pool closed",
                ))
            }
            Err(_) => {
                let kind = self.timeout_kind();
                return TeamResult::failed(self.fail(
                    ctx,
                    &node.id,
                    kind,
                    "timed out waiting for a worker slot",
                ));
            }
        };

        self.publish(EngineEvent::NodeStarted {
            request_id: self.request_id.clone(),
            node_id: node.id.clone(),
        });
        debug!(node_id = %node.id, worker = node.worker.name(), "Invoking worker");

        let outcome: std::result::Result<WorkerResponse, (FailureKind, String)> = tokio::select! {
            _ = self.cancel.cancelled() => Err((FailureKind::Cancelled, "request cancelled".to_string())),
            r = timeout_at(call_deadline, node.worker.respond(ctx)) => match r {
                Ok(Ok(resp)) if resp.content.trim().is_empty() => {
                    Err((FailureKind::Worker, "worker returned an empty output".to_string()))
                }
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err((FailureKind::Worker, e.to_string())),
                Err(_) => {
                    let kind = self.timeout_kind();
                    let err = FinflowError::BranchTimeout {
                        node: node.id.to_string(),
                        timeout_ms: call_deadline.saturating_duration_since(started).as_millis() as u64,
                    };
                    Err((kind, err.to_string()))
                }
            },
        };

        match outcome {
            Ok(resp) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                ctx.record_output(&node.id, &resp, &node.writes);
                self.publish(EngineEvent::NodeCompleted {
                    request_id: self.request_id.clone(),
                    node_id: node.id.clone(),
                    elapsed_ms,
                });
                info!(node_id = %node.id, elapsed_ms, "Worker completed");
                TeamResult::output(NodeOutput {
                    node_id: node.id.clone(),
                    label: node.name.clone(),
                    content: resp.content,
                    tools_used: resp
                        .used_tools
                        .iter()
                        .filter(|t| t.succeeded)
                        .map(|t| t.name.clone())
                        .collect(),
                    elapsed_ms,
                })
            }
            Err((kind, message)) => TeamResult::failed(self.fail(ctx, &node.id, kind, message)),
        }
    }

    /// `Some(kind)` once `deadline` (or the request itself) is over.
    pub fn expired(&self, deadline: Instant) -> Option<FailureKind> {
        let now = Instant::now();
        if self.cancel.is_cancelled() || now >= self.deadline {
            Some(FailureKind::Cancelled)
        } else if now >= deadline {
            Some(FailureKind::Timeout)
        } else {
            None
        }
    }

    /// A bound just elapsed: past the request deadline it is a cancellation.
    fn timeout_kind(&self) -> FailureKind {
        if self.cancel.is_cancelled() || Instant::now() >= self.deadline {
            FailureKind::Cancelled
        } else {
            FailureKind::Timeout
        }
    }

    /// Record a node failure in the context, publish it and return it.
    pub fn fail(
        &self,
        ctx: &mut ExecutionContext,
        node: &NodeId,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> NodeFailure {
        let message = message.into();
        warn!(node_id = %node, kind = %kind, error = %message, "Node failed");
        ctx.record_failure(node, &message);
        self.publish(EngineEvent::NodeFailed {
            request_id: self.request_id.clone(),
            node_id: node.clone(),
            kind,
            message: message.clone(),
        });
        NodeFailure::new(node.clone(), kind, message)
    }

    pub fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use finflow_core::types::TeamMode;
    use finflow_test_utils::MockWorker;

    use crate::graph::{Member, TeamNode};
    use crate::router::KeywordClassifier;
    use crate::termination::TerminationCondition;

    fn worker(id: &str, w: MockWorker) -> WorkerNode {
        WorkerNode::new(id, Arc::new(w))
    }

    fn engine(graph: WorkflowGraph, settings: EngineSettings) -> GraphFlow {
        let graph = Arc::new(graph);
        let router = IntentRouter::new(
            Box::new(KeywordClassifier::default()),
            graph.entries().clone(),
            graph.default_entry().clone(),
            1.0,
        );
        GraphFlow::new(graph, router, settings)
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            request_timeout: Duration::from_secs(10),
            branch_timeout: Duration::from_secs(2),
            worker_timeout: Duration::from_secs(5),
            max_concurrent_branches: 8,
            max_concurrent_requests: 2,
            max_selector_iterations: 4,
        }
    }

    #[tokio::test]
    async fn test_sequential_members_see_predecessors() {
        let second = MockWorker::new("second");
        let probe = second.history_probe();
        let graph = WorkflowGraph::builder()
            .worker(worker("first", MockWorker::new("first").with_response("one")))
            .worker(worker("second", second.with_response("two")))
            .team(
                TeamNode::new("seq", TeamMode::Sequential),
                vec!["first".into(), "second".into()],
            )
            .default_entry("seq")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;

        assert!(outcome.is_completed());
        // user message + first output
        assert_eq!(*probe.lock().unwrap(), vec![2]);
        assert_eq!(outcome.result.content, "## first\n\none\n\n## second\n\ntwo");
        assert_eq!(
            outcome.states,
            vec![
                EngineState::Routing,
                EngineState::Executing,
                EngineState::Aggregating,
                EngineState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_sequential_termination_stops_early() {
        let late = MockWorker::new("late");
        let calls = late.call_counter();
        let graph = WorkflowGraph::builder()
            .worker(worker("early", MockWorker::new("early").with_response("all DONE")))
            .worker(worker("late", late))
            .team(
                TeamNode::new("seq", TeamMode::Sequential)
                    .with_termination(TerminationCondition::TextMention("DONE".into())),
                vec!["early".into(), "late".into()],
            )
            .default_entry("seq")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert!(outcome.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_member_does_not_stop_sequence() {
        let graph = WorkflowGraph::builder()
            .worker(worker("broken", MockWorker::new("broken").failing("boom")))
            .worker(worker("steady", MockWorker::new("steady")))
            .team(
                TeamNode::new("seq", TeamMode::Sequential),
                vec!["broken".into(), "steady".into()],
            )
            .default_entry("seq")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.result.contributors, vec![NodeId::from("steady")]);
        assert_eq!(outcome.result.failures.len(), 1);
        assert_eq!(outcome.result.failures[0].kind, FailureKind::Worker);
        assert_eq!(outcome.context.fact_str("broken_status"), Some("failed"));
    }

    #[tokio::test]
    async fn test_missing_inputs_is_malformed_context() {
        let needy = MockWorker::new("needy");
        let calls = needy.call_counter();
        let graph = WorkflowGraph::builder()
            .worker(worker("needy", needy).with_reads(vec!["portfolio_id".into()]))
            .default_entry("needy")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.state, EngineState::Failed);
        assert!(outcome.result.failures[0].message.contains("portfolio_id"));
    }

    #[tokio::test]
    async fn test_session_context_satisfies_reads() {
        let graph = WorkflowGraph::builder()
            .worker(worker("needy", MockWorker::new("needy")).with_reads(vec!["email".into()]))
            .default_entry("needy")
            .build()
            .unwrap();
        let session: SessionContext =
            [("email".to_string(), serde_json::json!("jane@example.com"))].into();
        let outcome = engine(graph, fast_settings())
            .submit("hello", Some(session))
            .await;
        assert!(outcome.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector_respects_iteration_bound() {
        let looping = MockWorker::new("looper");
        let calls = looping.call_counter();
        let graph = WorkflowGraph::builder()
            .worker(worker("looper", looping))
            .team(
                TeamNode::new("sel", TeamMode::Selector).with_max_iterations(3),
                vec!["looper".into()],
            )
            .default_entry("sel")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome.is_completed());
        // identical outputs collapse in the merge
        assert_eq!(outcome.result.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_selector_without_eligible_candidate_fails_closed() {
        let graph = WorkflowGraph::builder()
            .worker(worker("gated", MockWorker::new("gated")))
            .team(
                TeamNode::new("sel", TeamMode::Selector),
                vec![Member::new("gated").with_guard("approval exists")],
            )
            .default_entry("sel")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert_eq!(outcome.state, EngineState::Failed);
        assert_eq!(outcome.result.failures.len(), 1);
        assert_eq!(
            outcome.result.failures[0].kind,
            FailureKind::NoEligibleCandidate
        );
    }

    #[tokio::test]
    async fn test_delegate_publishes_findings() {
        let reader = MockWorker::new("reader").with_handler(|ctx| {
            Ok(WorkerResponse::text(format!(
                "saw {}",
                ctx.fact_str("drivers").unwrap_or("nothing")
            )))
        });
        let graph = WorkflowGraph::builder()
            .worker(worker("researcher", MockWorker::new("researcher").with_response("rates and oil")))
            .worker(worker("reader", reader))
            .team(
                TeamNode::new("research_team", TeamMode::Delegate).with_fact_key("drivers"),
                vec!["researcher".into()],
            )
            .continuation("research_team", "reader", None, 0)
            .default_entry("research_team")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.context.fact_str("drivers"), Some("rates and oil"));
        assert_eq!(
            outcome.context.output(&NodeId::from("reader")),
            Some("saw rates and oil")
        );
        assert_eq!(outcome.executed.len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_edge_rescues_failed_node() {
        let graph = WorkflowGraph::builder()
            .worker(worker("primary", MockWorker::new("primary").failing("down")))
            .worker(worker("backup", MockWorker::new("backup")))
            .continuation("primary", "backup", Some(r#"primary_status == "failed""#), 0)
            .default_entry("primary")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert!(outcome.is_completed());
        assert!(outcome.unrecovered.is_empty());
        assert_eq!(outcome.result.contributors, vec![NodeId::from("backup")]);
    }

    #[tokio::test]
    async fn test_required_node_without_fallback_fails_request() {
        let graph = WorkflowGraph::builder()
            .worker(worker("first", MockWorker::new("first")))
            .worker(worker("second", MockWorker::new("second").failing("down")))
            .continuation("first", "second", None, 0)
            .default_entry("first")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert_eq!(outcome.state, EngineState::Failed);
        assert_eq!(outcome.unrecovered, vec![NodeId::from("second")]);
        // partial results survive
        assert_eq!(outcome.result.contributors, vec![NodeId::from("first")]);
    }

    #[tokio::test]
    async fn test_nested_required_team_without_output_fails_request() {
        let graph = WorkflowGraph::builder()
            .worker(worker("a", MockWorker::new("a").failing("upstream 500")))
            .worker(worker("b", MockWorker::new("b").failing("upstream 503")))
            .worker(worker("c", MockWorker::new("c")))
            .team(
                TeamNode::new("inner", TeamMode::Parallel),
                vec!["a".into(), "b".into()],
            )
            .team(
                TeamNode::new("outer", TeamMode::Sequential),
                vec!["inner".into(), "c".into()],
            )
            .default_entry("outer")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;

        assert_eq!(outcome.state, EngineState::Failed);
        assert!(outcome.result.insufficient);
        assert_eq!(outcome.unrecovered, vec![NodeId::from("inner")]);
        assert_eq!(outcome.result.contributors, vec![NodeId::from("c")]);
        assert!(outcome
            .result
            .failures
            .iter()
            .any(|f| f.node_id.as_str() == "inner" && f.kind == FailureKind::Insufficient));
    }

    #[tokio::test]
    async fn test_optional_nested_team_without_output_is_tolerated() {
        let graph = WorkflowGraph::builder()
            .worker(worker("a", MockWorker::new("a").failing("upstream 500")))
            .worker(worker("c", MockWorker::new("c")))
            .team(
                TeamNode::new("inner", TeamMode::Parallel).optional(),
                vec!["a".into()],
            )
            .team(
                TeamNode::new("outer", TeamMode::Sequential),
                vec!["inner".into(), "c".into()],
            )
            .default_entry("outer")
            .build()
            .unwrap();
        let outcome = engine(graph, fast_settings()).submit("hello", None).await;
        assert!(outcome.is_completed());
        assert!(outcome.unrecovered.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broad_stage_branches_respect_branch_timeout() {
        let graph = WorkflowGraph::builder()
            .worker(worker("quick", MockWorker::new("quick")))
            .worker(worker(
                "r1",
                MockWorker::new("r1").with_delay(Duration::from_millis(1500)),
            ))
            .worker(worker(
                "r2",
                MockWorker::new("r2").with_delay(Duration::from_millis(1500)),
            ))
            .team(
                TeamNode::new("research_team", TeamMode::Sequential),
                vec!["r1".into(), "r2".into()],
            )
            .default_entry("quick")
            .broad_fanout(vec!["research_team".into()])
            .build()
            .unwrap();
        let started = Instant::now();
        let outcome = engine(graph, fast_settings()).submit("hello there", None).await;

        assert!(outcome.plan.broad);
        assert_eq!(
            outcome.executed,
            vec![vec![NodeId::from("quick"), NodeId::from("research_team")]]
        );
        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(10));
        assert!(outcome.is_completed());
        assert_eq!(
            outcome.result.contributors,
            vec![NodeId::from("quick"), NodeId::from("r1")]
        );
        assert_eq!(outcome.result.failures.len(), 1);
        assert_eq!(outcome.result.failures[0].node_id.as_str(), "r2");
        assert_eq!(outcome.result.failures[0].kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_cancels_outstanding_work() {
        let graph = WorkflowGraph::builder()
            .worker(worker(
                "slow",
                MockWorker::new("slow").with_delay(Duration::from_secs(60)),
            ))
            .default_entry("slow")
            .build()
            .unwrap();
        let mut settings = fast_settings();
        settings.request_timeout = Duration::from_secs(3);
        settings.worker_timeout = Duration::from_secs(30);
        let started = Instant::now();
        let outcome = engine(graph, settings).submit("hello", None).await;
        assert!(started.elapsed() <= Duration::from_secs(3) + Duration::from_millis(10));
        assert_eq!(outcome.state, EngineState::Failed);
        assert_eq!(outcome.result.failures[0].kind, FailureKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation() {
        let graph = WorkflowGraph::builder()
            .worker(worker(
                "slow",
                MockWorker::new("slow").with_delay(Duration::from_secs(5)),
            ))
            .default_entry("slow")
            .build()
            .unwrap();
        let flow = engine(graph, fast_settings());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let outcome = flow.submit_with_cancel("hello", None, cancel).await;
        assert_eq!(outcome.result.failures[0].kind, FailureKind::Cancelled);
        assert_eq!(outcome.state, EngineState::Failed);
    }

    #[tokio::test]
    async fn test_synthesizer_rewrites_merge() {
        let synth = MockWorker::new("synth").with_handler(|ctx| {
            let merged = ctx.fact_str(MERGED_CONTENT_KEY).unwrap_or_default();
            Ok(WorkerResponse::text(format!("SUMMARY of {} chars", merged.len())))
        });
        let graph = WorkflowGraph::builder()
            .worker(worker("a", MockWorker::new("a").with_response("alpha")))
            .default_entry("a")
            .build()
            .unwrap();
        let flow = engine(graph, fast_settings()).with_synthesizer(worker("synth", synth));
        let outcome = flow.submit("hello", None).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.response(), "SUMMARY of 11 chars");
        assert_eq!(outcome.result.content, "## a\n\nalpha");
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let graph = WorkflowGraph::builder()
            .worker(worker("a", MockWorker::new("a")))
            .default_entry("a")
            .build()
            .unwrap();
        let flow = engine(graph, fast_settings());
        let mut rx = flow.event_bus().subscribe();
        let outcome = flow.submit("hello", None).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.request_id(), &outcome.request_id);
            kinds.push(match event {
                EngineEvent::RequestStarted { .. } => "started",
                EngineEvent::Routed { .. } => "routed",
                EngineEvent::StateChanged { .. } => "state",
                EngineEvent::NodeStarted { .. } => "node_started",
                EngineEvent::NodeCompleted { .. } => "node_completed",
                EngineEvent::NodeFailed { .. } => "node_failed",
                EngineEvent::RequestFinished { .. } => "finished",
            });
        }
        assert_eq!(kinds.first(), Some(&"started"));
        assert_eq!(kinds.last(), Some(&"finished"));
        assert!(kinds.contains(&"node_completed"));
    }

    #[test]
    fn test_settings_from_config() {
        let s = EngineSettings::default();
        assert_eq!(s.request_timeout, Duration::from_secs(180));
        assert_eq!(s.max_selector_iterations, 6);
    }
}
