//! Team execution, one function per [`TeamMode`].
//!
//! Teams run their members through [`RequestRun::execute_node`], so members
//! may themselves be teams. Worker permits are only taken at the leaves.

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use finflow_core::context::ExecutionContext;
use finflow_core::error::FinflowError;
use finflow_core::types::{
    EngineEvent, FailureKind, NodeFailure, NodeId, NodeOutput, TeamMode,
};

use crate::engine::RequestRun;
use crate::graph::TeamNode;
use crate::termination::TeamProgress;

/// What a node (worker or team) contributed.
#[derive(Debug, Clone, Default)]
pub struct TeamResult {
    pub outputs: Vec<NodeOutput>,
    pub failures: Vec<NodeFailure>,
    /// The team reached a natural end: its termination condition held or
    /// its member list was exhausted. False when cut short by a deadline or
    /// the selector iteration bound.
    pub terminated: bool,
}

impl TeamResult {
    pub fn output(output: NodeOutput) -> Self {
        Self {
            outputs: vec![output],
            failures: vec![],
            terminated: true,
        }
    }

    pub fn failed(failure: NodeFailure) -> Self {
        Self {
            outputs: vec![],
            failures: vec![failure],
            terminated: true,
        }
    }

    pub fn has_output(&self) -> bool {
        !self.outputs.is_empty()
    }

    /// Append another node's outputs and failures; `terminated` is untouched.
    pub fn extend(&mut self, other: TeamResult) {
        self.outputs.extend(other.outputs);
        self.failures.extend(other.failures);
    }
}

/// Run a team in its configured mode.
pub(crate) async fn execute(
    run: &RequestRun<'_>,
    team: &TeamNode,
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> TeamResult {
    let missing = ctx.missing_inputs(&team.reads);
    if !missing.is_empty() {
        let err = FinflowError::MalformedContext {
            node: team.id.to_string(),
            message: format!("missing inputs: {}", missing.join(", ")),
        };
        return TeamResult::failed(run.fail(ctx, &team.id, FailureKind::Worker, err.to_string()));
    }

    let started = Instant::now();
    run.publish(EngineEvent::NodeStarted {
        request_id: run.request_id.clone(),
        node_id: team.id.clone(),
    });
    info!(team = %team.id, mode = %team.mode, "Team started");

    let mut result = match team.mode {
        TeamMode::Sequential => sequential(run, team, ctx, deadline).await,
        TeamMode::Parallel => parallel(run, team, ctx, deadline).await,
        TeamMode::Selector => selector(run, team, ctx, deadline).await,
        TeamMode::Delegate => delegate(run, team, ctx, deadline).await,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if result.has_output() {
        if !team.writes.is_empty() {
            let combined = result
                .outputs
                .iter()
                .map(|o| o.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            for key in &team.writes {
                ctx.set_fact(key.clone(), serde_json::Value::String(combined.clone()));
            }
        }
        ctx.set_fact(
            format!("{}_status", team.id),
            serde_json::Value::String("completed".into()),
        );
        run.publish(EngineEvent::NodeCompleted {
            request_id: run.request_id.clone(),
            node_id: team.id.clone(),
            elapsed_ms,
        });
        info!(
            team = %team.id,
            outputs = result.outputs.len(),
            failures = result.failures.len(),
            terminated = result.terminated,
            elapsed_ms,
            "Team finished"
        );
    } else if !team.optional && !result.failures.iter().any(|f| f.node_id == team.id) {
        let failure = run.fail(
            ctx,
            &team.id,
            FailureKind::Insufficient,
            format!("team {} produced no usable output", team.name),
        );
        result.failures.push(failure);
    } else if team.optional {
        ctx.record_failure(&team.id, "optional team produced no output");
    }
    result
}

/// Members whose guard currently holds, in declaration order.
fn eligible_members(run: &RequestRun<'_>, team: &TeamNode, ctx: &ExecutionContext) -> Vec<NodeId> {
    run.graph
        .members(&team.id)
        .into_iter()
        .filter(|e| e.holds(ctx))
        .map(|e| e.to.clone())
        .collect()
}

fn member_ids(run: &RequestRun<'_>, team: &TeamNode) -> Vec<NodeId> {
    run.graph
        .members(&team.id)
        .into_iter()
        .map(|e| e.to.clone())
        .collect()
}

async fn sequential(
    run: &RequestRun<'_>,
    team: &TeamNode,
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> TeamResult {
    let members = member_ids(run, team);
    let mut result = TeamResult::default();

    for (i, id) in members.iter().enumerate() {
        if let Some(kind) = run.expired(deadline) {
            for rest in &members[i..] {
                let f = run.fail(ctx, rest, kind, "not started before the deadline");
                result.failures.push(f);
            }
            return result;
        }
        let guard_holds = run
            .graph
            .members(&team.id)
            .get(i)
            .map_or(true, |e| e.holds(ctx));
        if !guard_holds {
            debug!(team = %team.id, node_id = %id, "Skipping member, guard does not hold");
            continue;
        }

        let member = run.execute_node(id, ctx, deadline).await;
        result.extend(member);

        let progress = TeamProgress {
            members: &members,
            outputs: &result.outputs,
        };
        if team.termination.evaluate(ctx, progress) {
            debug!(team = %team.id, after = %id, "Termination condition met");
            result.terminated = true;
            return result;
        }
    }

    result.terminated = true;
    result
}

async fn parallel(
    run: &RequestRun<'_>,
    team: &TeamNode,
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> TeamResult {
    let branch_timeout = team.branch_timeout.unwrap_or(run.settings.branch_timeout);
    let branch_deadline = deadline.min(Instant::now() + branch_timeout);
    let members = eligible_members(run, team, ctx);
    debug!(
        team = %team.id,
        branches = members.len(),
        branch_timeout_ms = branch_timeout.as_millis() as u64,
        "Forking branches"
    );

    let mut result = TeamResult::default();
    for branch in run_branches(run, &members, ctx, branch_deadline).await {
        result.extend(branch);
    }
    result.terminated = true;
    result
}

async fn selector(
    run: &RequestRun<'_>,
    team: &TeamNode,
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> TeamResult {
    let max_iterations = team
        .max_iterations
        .unwrap_or(run.settings.max_selector_iterations);
    let members = member_ids(run, team);
    let mut result = TeamResult::default();

    for iteration in 0..max_iterations {
        if let Some(kind) = run.expired(deadline) {
            let f = run.fail(ctx, &team.id, kind, "selector interrupted by the deadline");
            result.failures.push(f);
            return result;
        }

        // Highest priority wins; the earliest declared member wins a tie
        let candidate = run
            .graph
            .members(&team.id)
            .into_iter()
            .enumerate()
            .filter(|(_, e)| e.holds(ctx))
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(_, e)| e.to.clone());

        let Some(id) = candidate else {
            if iteration == 0 {
                let f = run.fail(
                    ctx,
                    &team.id,
                    FailureKind::NoEligibleCandidate,
                    "no eligible candidate on the first iteration",
                );
                result.failures.push(f);
            } else {
                debug!(team = %team.id, iteration, "No eligible candidate left");
                result.terminated = true;
            }
            return result;
        };

        debug!(team = %team.id, node_id = %id, iteration, "Selected candidate");
        let member = run.execute_node(&id, ctx, deadline).await;
        result.extend(member);

        let progress = TeamProgress {
            members: &members,
            outputs: &result.outputs,
        };
        if team.termination.evaluate(ctx, progress) {
            debug!(team = %team.id, iteration, "Termination condition met");
            result.terminated = true;
            return result;
        }
    }

    warn!(team = %team.id, max_iterations, "Selector reached its iteration bound");
    result.terminated = false;
    result
}

async fn delegate(
    run: &RequestRun<'_>,
    team: &TeamNode,
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> TeamResult {
    let Some(member) = member_ids(run, team).into_iter().next() else {
        return TeamResult::failed(run.fail(
            ctx,
            &team.id,
            FailureKind::Worker,
            "delegate team has no member",
        ));
    };

    let mut result = run.execute_node(&member, ctx, deadline).await;
    if let Some(last) = result.outputs.last() {
        let key = team.findings_key();
        debug!(team = %team.id, key = %key, "Publishing delegated findings");
        ctx.set_fact(key, serde_json::Value::String(last.content.clone()));
    }
    result.terminated = true;
    result
}

/// Run nodes concurrently, each on its own fork of `ctx`, then absorb the
/// forks' deltas in the given order.
pub(crate) async fn run_branches(
    run: &RequestRun<'_>,
    nodes: &[NodeId],
    ctx: &mut ExecutionContext,
    deadline: Instant,
) -> Vec<TeamResult> {
    let forks: Vec<ExecutionContext> = nodes.iter().map(|_| ctx.fork()).collect();
    let branches = nodes.iter().zip(forks).map(|(id, mut fork)| async move {
        let result = run.execute_node(id, &mut fork, deadline).await;
        (result, fork.into_delta())
    });

    let mut results = Vec::with_capacity(nodes.len());
    for (result, delta) in join_all(branches).await {
        ctx.absorb(delta);
        results.push(result);
    }
    results
}
