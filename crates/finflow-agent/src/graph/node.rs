use std::sync::Arc;
use std::time::Duration;

use finflow_core::config::{TeamConfig, WorkerConfig};
use finflow_core::traits::Worker;
use finflow_core::types::{NodeId, TeamMode};

use crate::termination::TerminationCondition;

/// A node in the workflow graph: a single worker or a team of nodes.
#[derive(Clone)]
pub enum Node {
    Worker(WorkerNode),
    Team(TeamNode),
}

impl Node {
    pub fn id(&self) -> &NodeId {
        match self {
            Self::Worker(w) => &w.id,
            Self::Team(t) => &t.id,
        }
    }

    /// Human-readable name used as the section label of its output.
    pub fn name(&self) -> &str {
        match self {
            Self::Worker(w) => &w.name,
            Self::Team(t) => &t.name,
        }
    }

    pub fn is_optional(&self) -> bool {
        match self {
            Self::Worker(w) => w.optional,
            Self::Team(t) => t.optional,
        }
    }

    /// Keys the node needs in the context before it may run.
    pub fn reads(&self) -> &[String] {
        match self {
            Self::Worker(w) => &w.reads,
            Self::Team(t) => &t.reads,
        }
    }

    pub fn writes(&self) -> &[String] {
        match self {
            Self::Worker(w) => &w.writes,
            Self::Team(t) => &t.writes,
        }
    }

    pub fn is_team(&self) -> bool {
        matches!(self, Self::Team(_))
    }

    /// Short description used by `finflow graph`.
    pub fn kind_label(&self) -> String {
        match self {
            Self::Worker(_) => "worker".to_string(),
            Self::Team(t) => format!("team:{}", t.mode),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker(w) => f.debug_tuple("Worker").field(&w.id).finish(),
            Self::Team(t) => f
                .debug_tuple("Team")
                .field(&t.id)
                .field(&t.mode)
                .finish(),
        }
    }
}

/// A leaf node wrapping one [`Worker`].
#[derive(Clone)]
pub struct WorkerNode {
    pub id: NodeId,
    pub name: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub optional: bool,
    /// Per-call bound; the engine default applies when unset.
    pub timeout: Option<Duration>,
    pub worker: Arc<dyn Worker>,
}

impl WorkerNode {
    pub fn new(id: impl Into<NodeId>, worker: Arc<dyn Worker>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            reads: vec![],
            writes: vec![],
            optional: false,
            timeout: None,
            worker,
        }
    }

    /// Build from configuration around an already-constructed worker.
    pub fn from_config(config: &WorkerConfig, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: NodeId::from(config.id.as_str()),
            name: config.display_name().to_string(),
            reads: config.reads.clone(),
            writes: config.writes.clone(),
            optional: config.optional,
            timeout: config.timeout_secs.map(Duration::from_secs),
            worker,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reads(mut self, keys: Vec<String>) -> Self {
        self.reads = keys;
        self
    }

    pub fn with_writes(mut self, keys: Vec<String>) -> Self {
        self.writes = keys;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A composite node. Its members are the targets of its membership edges.
#[derive(Debug, Clone)]
pub struct TeamNode {
    pub id: NodeId,
    pub name: String,
    pub mode: TeamMode,
    pub termination: TerminationCondition,
    pub optional: bool,
    /// Per-branch bound for parallel teams.
    pub branch_timeout: Option<Duration>,
    /// Selector loop bound; the engine default applies when unset.
    pub max_iterations: Option<usize>,
    /// Scratch key receiving a delegate team's findings.
    pub fact_key: Option<String>,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

impl TeamNode {
    pub fn new(id: impl Into<NodeId>, mode: TeamMode) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            mode,
            termination: TerminationCondition::Never,
            optional: false,
            branch_timeout: None,
            max_iterations: None,
            fact_key: None,
            reads: vec![],
            writes: vec![],
        }
    }

    pub fn from_config(config: &TeamConfig) -> Self {
        Self {
            id: NodeId::from(config.id.as_str()),
            name: config.display_name().to_string(),
            mode: config.mode,
            termination: config
                .termination
                .clone()
                .map(TerminationCondition::from)
                .unwrap_or(TerminationCondition::Never),
            optional: config.optional,
            branch_timeout: config.branch_timeout_secs.map(Duration::from_secs),
            max_iterations: config.max_iterations,
            fact_key: config.fact_key.clone(),
            reads: config.reads.clone(),
            writes: config.writes.clone(),
        }
    }

    pub fn with_termination(mut self, termination: TerminationCondition) -> Self {
        self.termination = termination;
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = Some(timeout);
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_fact_key(mut self, key: impl Into<String>) -> Self {
        self.fact_key = Some(key.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Key under which a delegate team publishes its member's output.
    pub fn findings_key(&self) -> String {
        self.fact_key
            .clone()
            .unwrap_or_else(|| format!("{}_findings", self.id))
    }
}
