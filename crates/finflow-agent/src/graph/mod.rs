//! Workflow graph: teams, workers and the edges between them.
//!
//! Membership edges run from a team to its members and carry the kind
//! matching the team's mode. `Conditional` edges continue the plan from one
//! top-level step to the next when their guard holds. A graph is validated
//! once by [`GraphBuilder::build`] and is immutable afterwards, so it can be
//! shared across concurrent requests behind an `Arc`.

pub mod edge;
pub mod node;
pub mod plan;

use std::collections::{HashMap, HashSet};

use finflow_core::error::{FinflowError, Result};
use finflow_core::types::{NodeId, TeamMode};

use crate::router::Intent;

pub use edge::{evaluate_guard, Edge, EdgeKind, Guard, GuardOp};
pub use node::{Node, TeamNode, WorkerNode};
pub use plan::ExecutionPlan;

/// A validated, immutable workflow graph.
#[derive(Debug)]
pub struct WorkflowGraph {
    nodes: HashMap<NodeId, Node>,
    /// Declaration order, used for stable listings.
    order: Vec<NodeId>,
    edges: Vec<Edge>,
    entries: HashMap<Intent, NodeId>,
    default_entry: NodeId,
    broad_fanout: Vec<NodeId>,
}

impl WorkflowGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Membership edges of a team, in declaration order.
    pub fn members(&self, team: &NodeId) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| &e.from == team && e.kind.is_membership())
            .collect()
    }

    /// Conditional edges leaving a node, highest priority first and
    /// declaration order within a priority.
    pub fn continuations(&self, from: &NodeId) -> Vec<&Edge> {
        let mut out: Vec<&Edge> = self
            .edges
            .iter()
            .filter(|e| &e.from == from && e.kind == EdgeKind::Conditional)
            .collect();
        out.sort_by_key(|e| std::cmp::Reverse(e.priority));
        out
    }

    pub fn entries(&self) -> &HashMap<Intent, NodeId> {
        &self.entries
    }

    pub fn entry_for(&self, intent: Intent) -> &NodeId {
        self.entries.get(&intent).unwrap_or(&self.default_entry)
    }

    pub fn default_entry(&self) -> &NodeId {
        &self.default_entry
    }

    pub fn broad_fanout(&self) -> &[NodeId] {
        &self.broad_fanout
    }
}

/// Member declaration handed to [`GraphBuilder::team`].
#[derive(Debug, Clone)]
pub struct Member {
    pub node: NodeId,
    pub guard: Option<String>,
    pub priority: i32,
}

impl Member {
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            guard: None,
            priority: 0,
        }
    }

    pub fn with_guard(mut self, expr: impl Into<String>) -> Self {
        self.guard = Some(expr.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for Member {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Collects nodes and edges; [`build`](Self::build) validates them.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    edges: Vec<Edge>,
    entries: HashMap<Intent, NodeId>,
    default_entry: Option<NodeId>,
    broad_fanout: Vec<NodeId>,
    errors: Vec<String>,
}

impl GraphBuilder {
    pub fn worker(mut self, node: WorkerNode) -> Self {
        self.insert(Node::Worker(node));
        self
    }

    /// Add a team and one membership edge per member, kind taken from the mode.
    pub fn team(mut self, team: TeamNode, members: Vec<Member>) -> Self {
        let team_id = team.id.clone();
        let mode = team.mode;
        self.insert(Node::Team(team));
        for m in members {
            let edge = Edge::member(team_id.clone(), m.node, mode).with_priority(m.priority);
            match m.guard {
                Some(expr) => match edge.with_guard(&expr) {
                    Ok(e) => self.edges.push(e),
                    Err(e) => self.errors.push(format!("team {}: {}", team_id, e)),
                },
                None => self.edges.push(edge),
            }
        }
        self
    }

    /// Add a raw edge. Membership edges added this way are validated like
    /// any other.
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Conditional continuation with an optional guard.
    pub fn continuation(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        guard: Option<&str>,
        priority: i32,
    ) -> Self {
        let edge = Edge::conditional(from, to).with_priority(priority);
        match guard {
            Some(expr) => match edge.with_guard(expr) {
                Ok(e) => self.edges.push(e),
                Err(e) => self.errors.push(e.to_string()),
            },
            None => self.edges.push(edge),
        }
        self
    }

    pub fn entry(mut self, intent: Intent, node: impl Into<NodeId>) -> Self {
        self.entries.insert(intent, node.into());
        self
    }

    pub fn default_entry(mut self, node: impl Into<NodeId>) -> Self {
        self.default_entry = Some(node.into());
        self
    }

    pub fn broad_fanout(mut self, nodes: Vec<NodeId>) -> Self {
        self.broad_fanout = nodes;
        self
    }

    fn insert(&mut self, node: Node) {
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            self.errors.push(format!("duplicate node id: {}", id));
            return;
        }
        self.order.push(id.clone());
        self.nodes.insert(id, node);
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<WorkflowGraph> {
        let default_entry = match self.default_entry {
            Some(d) => d,
            None => {
                // The general entry doubles as the default
                match self.entries.get(&Intent::General) {
                    Some(g) => g.clone(),
                    None => {
                        return Err(FinflowError::GraphConfig(
                            "no default entry configured".into(),
                        ))
                    }
                }
            }
        };
        let graph = WorkflowGraph {
            nodes: self.nodes,
            order: self.order,
            edges: self.edges,
            entries: self.entries,
            default_entry,
            broad_fanout: self.broad_fanout,
        };
        let mut errors = self.errors;
        errors.extend(validate(&graph));
        if errors.is_empty() {
            Ok(graph)
        } else {
            Err(FinflowError::GraphConfig(errors.join("; ")))
        }
    }
}

/// Every structural problem in the graph; empty when valid.
pub fn validate(graph: &WorkflowGraph) -> Vec<String> {
    let mut errors = Vec::new();

    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(end) {
                errors.push(format!("edge {} -> {} references unknown node {}", edge.from, edge.to, end));
            }
        }
        let Some(source) = graph.nodes.get(&edge.from) else {
            continue;
        };
        match source {
            Node::Worker(_) if edge.kind != EdgeKind::Conditional => errors.push(format!(
                "worker {} has a {} edge; workers only have conditional edges",
                edge.from, edge.kind
            )),
            Node::Team(team) if edge.kind.is_membership() => {
                let expected = EdgeKind::for_mode(team.mode);
                if edge.kind != expected {
                    errors.push(format!(
                        "team {} is {} but has a {} member edge",
                        team.id, team.mode, edge.kind
                    ));
                }
            }
            _ => {}
        }
    }

    for node in graph.nodes() {
        let Node::Team(team) = node else {
            continue;
        };
        let members = graph.members(&team.id);
        match team.mode {
            TeamMode::Delegate if members.len() != 1 => errors.push(format!(
                "delegate team {} must have exactly one member, has {}",
                team.id,
                members.len()
            )),
            TeamMode::Selector if members.is_empty() => errors.push(format!(
                "selector team {} has no candidates",
                team.id
            )),
            _ if members.is_empty() => {
                errors.push(format!("team {} has no members", team.id))
            }
            _ => {}
        }
        let mut seen = HashSet::new();
        for m in &members {
            if !seen.insert(&m.to) {
                errors.push(format!("team {} lists {} twice", team.id, m.to));
            }
        }
    }

    if let Some(cycle_at) = find_cycle(graph) {
        errors.push(format!("graph has a cycle through {}", cycle_at));
    }

    for (intent, entry) in &graph.entries {
        if !graph.nodes.contains_key(entry) {
            errors.push(format!("entry for {} is unknown node {}", intent, entry));
        }
    }
    if !graph.nodes.contains_key(&graph.default_entry) {
        errors.push(format!("default entry {} is not a node", graph.default_entry));
    }
    for id in &graph.broad_fanout {
        if !graph.nodes.contains_key(id) {
            errors.push(format!("broad fan-out node {} is not a node", id));
        }
    }

    errors
}

/// Depth-first search over all edges; returns a node on a cycle.
fn find_cycle(graph: &WorkflowGraph) -> Option<NodeId> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for e in &graph.edges {
        adjacency.entry(&e.from).or_default().push(&e.to);
    }

    let mut marks: HashMap<&NodeId, Mark> = HashMap::new();
    for start in &graph.order {
        if marks.contains_key(start) {
            continue;
        }
        // Explicit stack of (node, next child index)
        let mut stack: Vec<(&NodeId, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::Visiting);
        while let Some((node, idx)) = stack.pop() {
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if idx < children.len() {
                stack.push((node, idx + 1));
                let child = children[idx];
                match marks.get(child) {
                    Some(Mark::Visiting) => return Some(child.clone()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    None
}
