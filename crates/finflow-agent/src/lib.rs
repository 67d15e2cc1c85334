pub mod aggregator;
pub mod engine;
pub mod factory;
pub mod graph;
pub mod router;
pub mod run_log;
pub mod team;
pub mod termination;
pub mod workers;

pub use aggregator::{AggregationResult, Aggregator};
pub use engine::{EngineSettings, GraphFlow, RequestOutcome, SessionContext, MERGED_CONTENT_KEY};
pub use factory::{assemble, build_graph, build_router, default_workflow, DEFAULT_WORKFLOW};
pub use graph::{
    evaluate_guard, Edge, EdgeKind, ExecutionPlan, Guard, GuardOp, Member, Node, TeamNode,
    WorkerNode, WorkflowGraph,
};
pub use router::{
    detect_sector, Intent, IntentClassifier, IntentRouter, KeywordClassifier, RouteDecision,
    RouteHint,
};
pub use run_log::RunLogger;
pub use team::TeamResult;
pub use termination::{TeamProgress, TerminationCondition};
pub use workers::{LlmWorker, StaticWorker};
