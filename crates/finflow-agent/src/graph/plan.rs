use std::collections::HashSet;

use serde::Serialize;

use finflow_core::types::NodeId;

use super::WorkflowGraph;
use crate::router::{Intent, RouteDecision};

/// Stages a request is expected to run through.
///
/// Stage 0 is the entry node plus, for broad requests, the graph's broad
/// fan-out. Later stages project every conditional edge regardless of its
/// guard; the engine evaluates guards as it walks, so the executed stages
/// are a prefix-wise subset of this plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub intent: Intent,
    pub entry: NodeId,
    pub broad: bool,
    pub stages: Vec<Vec<NodeId>>,
}

impl ExecutionPlan {
    pub fn from_decision(graph: &WorkflowGraph, decision: &RouteDecision) -> Self {
        Self::build(graph, decision.intent, decision.entry.clone(), decision.hint.broad)
    }

    /// Plan used when routing failed: the default entry, not broad.
    pub fn fallback(graph: &WorkflowGraph) -> Self {
        Self::build(graph, Intent::General, graph.default_entry().clone(), false)
    }

    fn build(graph: &WorkflowGraph, intent: Intent, entry: NodeId, broad: bool) -> Self {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut first = vec![entry.clone()];
        seen.insert(entry.clone());
        if broad {
            for id in graph.broad_fanout() {
                if seen.insert(id.clone()) {
                    first.push(id.clone());
                }
            }
        }

        let mut stages = vec![first];
        loop {
            let Some(last) = stages.last() else {
                break;
            };
            let mut next = Vec::new();
            for id in last {
                for edge in graph.continuations(id) {
                    if seen.insert(edge.to.clone()) {
                        next.push(edge.to.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            stages.push(next);
        }

        Self {
            intent,
            entry,
            broad,
            stages,
        }
    }

    /// Every node the plan may touch at top level, in stage order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.stages.iter().flatten()
    }
}
