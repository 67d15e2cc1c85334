//! Assembles a [`GraphFlow`] from [`AppConfig`].
//!
//! When the configuration declares no workers and no teams the built-in
//! advisory workflow ([`DEFAULT_WORKFLOW`]) is used: five model-backed
//! specialists organised into optimization, education, learning, research
//! and general teams.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use finflow_core::config::{AppConfig, WorkerConfig, WorkerKind};
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::{LlmClient, ToolGateway, Worker};
use finflow_core::types::NodeId;

use crate::engine::{EngineSettings, GraphFlow};
use crate::graph::{Member, TeamNode, WorkerNode, WorkflowGraph};
use crate::router::{Intent, IntentRouter, KeywordClassifier};
use crate::workers::{LlmWorker, StaticWorker};

/// The built-in advisory workflow.
pub const DEFAULT_WORKFLOW: &str = r#"
[routing]
default_entry = "general_team"
broad_fanout = ["research_team"]

[routing.entries]
crisis = "research_team"
optimization = "optimization_team"
education_analysis = "education_team"
education = "learning_team"
research = "research_team"
general = "general_team"

[[workers]]
id = "market_analyst"
name = "Market Analyst"
system_prompt = """
You are a market analyst. Analyse sector and market trends, identify the key \
drivers behind them and point out investment opportunities. Ground every claim \
in the supplied facts and tool results, and say so when data is missing. \
End with ANALYST_DONE."""
tools = [
    { name = "knowledge_search", args = { query = "{query}", sector = "{sector}" } },
    { name = "knowledge_search", args = { query = "{query}", collection = "market_analysis" } },
]

[[workers]]
id = "portfolio_manager"
name = "Portfolio Manager"
system_prompt = """
You are a portfolio manager. Review the user's holdings and their performance, \
then recommend concrete allocation changes that balance risk and reward. Be \
precise and data-driven. End with PORTFOLIO_MANAGER_DONE."""
tools = [
    { name = "portfolio_query", args = { query = "user_portfolios", email = "{user_email}" } },
    { name = "portfolio_analytics", args = { portfolio_id = "{portfolio_id}" } },
    { name = "knowledge_search", args = { query = "{query}", collection = "investment_strategies" } },
]

[[workers]]
id = "risk_assessor"
name = "Risk Assessor"
system_prompt = """
You are a risk assessor. Evaluate concentration, volatility and downside risk \
for the request, and suggest mitigation and diversification steps. End with \
RISK_DONE."""
tools = [
    { name = "knowledge_search", args = { query = "{query}", collection = "risk_management" } },
    { name = "portfolio_analytics", args = { portfolio_id = "{portfolio_id}" } },
]

[[workers]]
id = "educator"
name = "Financial Educator"
system_prompt = """
You are a financial educator. Explain the concepts behind the request in plain \
language, build a short step-by-step learning path and keep the tone \
supportive. End with EDUCATOR_DONE."""
tools = [
    { name = "knowledge_search", args = { query = "{query}", collection = "general_finance" } },
]

[[workers]]
id = "researcher"
name = "Market Researcher"
system_prompt = """
You are a market researcher. Gather the latest information relevant to the \
request: recent moves, news themes and what is driving volatility. Report \
findings only, without recommendations. End with RESEARCH_DONE."""
tools = [
    { name = "knowledge_search", args = { query = "{query}", collection = "sectors" } },
    { name = "market_data", args = { ticker = "{ticker}" } },
]

[[teams]]
id = "optimization_team"
name = "Portfolio Optimization"
mode = "parallel"
members = ["market_analyst", "portfolio_manager", "risk_assessor"]

[[teams]]
id = "education_team"
name = "Education and Analysis"
mode = "sequential"
members = ["educator", "market_analyst"]

[[teams]]
id = "learning_team"
name = "Guided Learning"
mode = "selector"
max_iterations = 4
members = [
    { node = "educator", guard = "educator not_contains EDUCATOR_DONE", priority = 2 },
    { node = "market_analyst", guard = "educator contains EDUCATOR_DONE", priority = 1 },
]
termination = { type = "text_mention", text = "ANALYST_DONE" }

[[teams]]
id = "research_team"
name = "Market Research"
mode = "delegate"
members = ["researcher"]
fact_key = "volatility_drivers"

[[teams]]
id = "general_team"
name = "General Advice"
mode = "parallel"
members = ["market_analyst", "risk_assessor"]

[[edges]]
from = "research_team"
to = "optimization_team"
guard = "intent == crisis"
"#;

/// Parse [`DEFAULT_WORKFLOW`].
pub fn default_workflow() -> Result<AppConfig> {
    AppConfig::parse_with_overrides(DEFAULT_WORKFLOW, &[])
}

/// `config` with the built-in workflow filled in when it declares no
/// workers and no teams. Engine, model, tools and aggregator settings are
/// always the caller's; routing entries and the broad fan-out are taken
/// from the built-in workflow only where the caller left them empty.
pub fn with_default_workflow(config: &AppConfig) -> Result<AppConfig> {
    let mut config = config.clone();
    if !config.workers.is_empty() || !config.teams.is_empty() {
        return Ok(config);
    }
    let defaults = default_workflow()?;
    info!(
        workers = defaults.workers.len(),
        teams = defaults.teams.len(),
        "No workflow configured, using the built-in one"
    );
    config.workers = defaults.workers;
    config.teams = defaults.teams;
    config.edges = defaults.edges;
    if config.routing.entries.is_empty() {
        config.routing.entries = defaults.routing.entries;
    }
    if config.routing.broad_fanout.is_empty() {
        config.routing.broad_fanout = defaults.routing.broad_fanout;
    }
    Ok(config)
}

/// Instantiate one worker.
pub fn build_worker(
    config: &AppConfig,
    worker: &WorkerConfig,
    gateway: &Arc<dyn ToolGateway>,
    llm: Option<&Arc<dyn LlmClient>>,
) -> Result<Arc<dyn Worker>> {
    match worker.kind {
        WorkerKind::Static => {
            let template = worker.response.as_ref().ok_or_else(|| {
                FinflowError::GraphConfig(format!(
                    "static worker {} has no response template",
                    worker.id
                ))
            })?;
            Ok(Arc::new(StaticWorker::new(
                worker.display_name(),
                template.clone(),
            )))
        }
        WorkerKind::Llm => {
            let model = config.model.clone().ok_or_else(|| {
                FinflowError::GraphConfig(format!(
                    "worker {} needs a [model] section",
                    worker.id
                ))
            })?;
            let llm = llm.ok_or_else(|| {
                FinflowError::GraphConfig(format!("worker {} needs an LLM client", worker.id))
            })?;
            let prompt = worker.system_prompt.clone().unwrap_or_else(|| {
                format!(
                    "You are {}, a financial specialist. Answer the request using the facts provided.",
                    worker.display_name()
                )
            });
            Ok(Arc::new(
                LlmWorker::new(
                    worker.display_name(),
                    prompt,
                    gateway.clone(),
                    llm.clone(),
                    model,
                )
                .with_tools(worker.tools.clone()),
            ))
        }
    }
}

/// Build and validate the workflow graph.
pub fn build_graph(
    config: &AppConfig,
    gateway: &Arc<dyn ToolGateway>,
    llm: Option<&Arc<dyn LlmClient>>,
) -> Result<WorkflowGraph> {
    let mut builder = WorkflowGraph::builder();

    for wc in &config.workers {
        let worker = build_worker(config, wc, gateway, llm)?;
        builder = builder.worker(WorkerNode::from_config(wc, worker));
    }

    for tc in &config.teams {
        let members = tc
            .members
            .iter()
            .map(|m| {
                let member = Member::new(m.node()).with_priority(m.priority());
                match m.guard() {
                    Some(g) => member.with_guard(g),
                    None => member,
                }
            })
            .collect();
        builder = builder.team(TeamNode::from_config(tc), members);
    }

    for ec in &config.edges {
        builder = builder.continuation(
            ec.from.as_str(),
            ec.to.as_str(),
            ec.guard.as_deref(),
            ec.priority,
        );
    }

    let mut entries: Vec<(&String, &String)> = config.routing.entries.iter().collect();
    entries.sort();
    for (intent, node) in entries {
        let intent: Intent = intent
            .parse()
            .map_err(|e| FinflowError::GraphConfig(format!("routing.entries: {}", e)))?;
        builder = builder.entry(intent, node.as_str());
    }

    let graph = builder
        .default_entry(config.routing.default_entry.as_str())
        .broad_fanout(
            config
                .routing
                .broad_fanout
                .iter()
                .map(|id| NodeId::from(id.as_str()))
                .collect(),
        )
        .build()?;
    debug!(nodes = graph.len(), edges = graph.edges().len(), "Workflow graph built");
    Ok(graph)
}

/// Router over the graph's entry table.
pub fn build_router(config: &AppConfig, graph: &WorkflowGraph) -> Result<IntentRouter> {
    let classifier = KeywordClassifier::from_rules(&config.routing.rules)?;
    let entries: HashMap<Intent, NodeId> = graph.entries().clone();
    Ok(IntentRouter::new(
        Box::new(classifier),
        entries,
        graph.default_entry().clone(),
        config.routing.min_confidence,
    ))
}

/// Build the whole engine. `llm` may be `None` when every worker is static.
pub fn assemble(
    config: &AppConfig,
    gateway: Arc<dyn ToolGateway>,
    llm: Option<Arc<dyn LlmClient>>,
) -> Result<GraphFlow> {
    let config = with_default_workflow(config)?;
    let graph = build_graph(&config, &gateway, llm.as_ref())?;
    let router = build_router(&config, &graph)?;
    let mut flow = GraphFlow::new(
        Arc::new(graph),
        router,
        EngineSettings::from(&config.engine),
    );

    if let Some(id) = &config.aggregator.synthesizer {
        let wc = config.worker(id).ok_or_else(|| {
            FinflowError::GraphConfig(format!("unknown synthesizer worker: {}", id))
        })?;
        let worker = build_worker(&config, wc, &gateway, llm.as_ref())?;
        flow = flow.with_synthesizer(WorkerNode::from_config(wc, worker));
    }

    info!(
        nodes = flow.graph().len(),
        synthesizer = config.aggregator.synthesizer.as_deref().unwrap_or("none"),
        "Engine assembled"
    );
    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::types::TeamMode;
    use finflow_test_utils::{test_model_config, MockLlmClient, STATIC_WORKFLOW};
    use finflow_tools::ToolRegistry;

    use crate::graph::Node;

    fn gateway() -> Arc<dyn ToolGateway> {
        Arc::new(ToolRegistry::new())
    }

    #[test]
    fn test_default_workflow_parses() {
        let config = default_workflow().unwrap();
        assert_eq!(config.workers.len(), 5);
        assert_eq!(config.teams.len(), 5);
        assert_eq!(config.routing.entries.len(), 6);
        assert_eq!(config.routing.broad_fanout, vec!["research_team"]);
        let learning = config.team("learning_team").unwrap();
        assert_eq!(learning.mode, TeamMode::Selector);
        assert_eq!(learning.members[0].priority(), 2);
    }

    #[test]
    fn test_default_workflow_needs_a_model() {
        let err = assemble(&AppConfig::default(), gateway(), None).unwrap_err();
        assert!(err.to_string().contains("needs a [model] section"));
    }

    #[test]
    fn test_default_workflow_assembles_with_model() {
        let config = AppConfig {
            model: Some(test_model_config()),
            ..Default::default()
        };
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new());
        let flow = assemble(&config, gateway(), Some(llm)).unwrap();
        let graph = flow.graph();
        assert_eq!(graph.len(), 10);
        assert_eq!(graph.entry_for(Intent::Crisis).as_str(), "research_team");
        assert_eq!(graph.continuations(&NodeId::from("research_team")).len(), 1);
        assert!(matches!(
            graph.node(&NodeId::from("educator")),
            Some(Node::Worker(_))
        ));
    }

    #[test]
    fn test_static_workflow_needs_no_llm() {
        let config = AppConfig::parse_with_overrides(STATIC_WORKFLOW, &[]).unwrap();
        let flow = assemble(&config, gateway(), None).unwrap();
        assert_eq!(flow.router().default_entry().as_str(), "general_team");
        assert_eq!(flow.settings().max_selector_iterations, 4);
    }

    #[test]
    fn test_static_worker_without_template_is_rejected() {
        let text = r#"
[routing]
default_entry = "a"

[[workers]]
id = "a"
kind = "static"
"#;
        let config = AppConfig::parse_with_overrides(text, &[]).unwrap();
        let err = assemble(&config, gateway(), None).unwrap_err();
        assert!(err.to_string().contains("no response template"));
    }

    #[test]
    fn test_unknown_intent_key_is_rejected() {
        let text = r#"
[routing]
default_entry = "a"
entries = { panic = "a" }

[[workers]]
id = "a"
kind = "static"
response = "ok"
"#;
        let config = AppConfig::parse_with_overrides(text, &[]).unwrap();
        let err = assemble(&config, gateway(), None).unwrap_err();
        assert!(matches!(err, FinflowError::GraphConfig(_)));
        assert!(err.to_string().contains("routing.entries"));
    }

    #[test]
    fn test_unknown_synthesizer_is_rejected() {
        let config = AppConfig::parse_with_overrides(
            STATIC_WORKFLOW,
            &[("aggregator.synthesizer".into(), "ghost".into())],
        )
        .unwrap();
        let err = assemble(&config, gateway(), None).unwrap_err();
        assert!(err.to_string().contains("unknown synthesizer worker: ghost"));
    }

    #[test]
    fn test_invalid_graph_reports_every_problem() {
        let text = r#"
[routing]
default_entry = "missing_team"

[[workers]]
id = "a"
kind = "static"
response = "ok"

[[teams]]
id = "t"
mode = "delegate"
members = ["a", "b"]
"#;
        let config = AppConfig::parse_with_overrides(text, &[]).unwrap();
        let msg = assemble(&config, gateway(), None).unwrap_err().to_string();
        assert!(msg.contains("exactly one member"));
        assert!(msg.contains("missing_team"));
    }
}
