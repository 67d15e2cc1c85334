use std::sync::Arc;
use std::time::Duration;

use finflow_agent::{
    assemble, build_router, EngineSettings, GraphFlow, Intent, Member, RunLogger, TeamNode,
    WorkerNode, WorkflowGraph,
};
use finflow_core::config::AppConfig;
use finflow_core::types::{EngineState, FailureKind, MessageKind, NodeId, TeamMode};
use finflow_test_utils::{MockWorker, STATIC_WORKFLOW};
use finflow_tools::ToolRegistry;
use tokio_util::sync::CancellationToken;

fn static_flow() -> GraphFlow {
    let config = AppConfig::parse_with_overrides(STATIC_WORKFLOW, &[]).unwrap();
    assemble(&config, Arc::new(ToolRegistry::new()), None).unwrap()
}

fn ids(list: &[&str]) -> Vec<NodeId> {
    list.iter().map(|s| NodeId::from(*s)).collect()
}

/// One parallel team of mock workers behind the general entry.
fn parallel_flow(workers: Vec<(&str, MockWorker)>, settings: EngineSettings) -> GraphFlow {
    let members: Vec<Member> = workers.iter().map(|(id, _)| Member::from(*id)).collect();
    let mut builder = WorkflowGraph::builder();
    for (id, w) in workers {
        builder = builder.worker(WorkerNode::new(id, Arc::new(w)));
    }
    let graph = builder
        .team(TeamNode::new("general_team", TeamMode::Parallel), members)
        .entry(Intent::General, "general_team")
        .build()
        .unwrap();
    let router = build_router(&AppConfig::default(), &graph).unwrap();
    GraphFlow::new(Arc::new(graph), router, settings)
}

#[tokio::test]
async fn rebalance_request_runs_the_optimization_team() {
    let flow = static_flow();
    let outcome = flow
        .submit("Rebalance my portfolio for tech trends", None)
        .await;

    assert_eq!(outcome.intent, Intent::Optimization);
    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(
        outcome.result.contributors,
        ids(&["market_analyst", "portfolio_manager", "risk_assessor"])
    );
    assert!(outcome.result.failures.is_empty());
    assert_eq!(outcome.executed, vec![ids(&["optimization_team"])]);
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
async fn education_analysis_runs_educator_before_analyst() {
    let flow = static_flow();
    let outcome = flow
        .submit("Should I invest in healthcare AI?", None)
        .await;

    assert_eq!(outcome.intent, Intent::EducationAnalysis);
    assert_eq!(outcome.state, EngineState::Completed);

    let speakers: Vec<&str> = outcome
        .context
        .history()
        .iter()
        .filter(|m| m.kind == MessageKind::WorkerOutput)
        .map(|m| m.source.as_str())
        .collect();
    assert_eq!(speakers, vec!["educator", "market_analyst"]);
    assert!(outcome
        .context
        .output(&NodeId::from("market_analyst"))
        .is_some_and(|o| o.contains("Market view for healthcare")));
}

#[tokio::test]
async fn learning_selector_hands_over_and_terminates() {
    let flow = static_flow();
    let outcome = flow
        .submit("Can you explain what an ETF is? I want to learn.", None)
        .await;

    assert_eq!(outcome.intent, Intent::Education);
    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(outcome.result.outputs.len(), 2);
    assert_eq!(
        outcome.result.contributors,
        ids(&["educator", "market_analyst"])
    );
    assert!(outcome.response().contains("Lesson on: Can you explain what an ETF is?"));
}

#[tokio::test]
async fn crisis_research_feeds_the_optimization_team() {
    let flow = static_flow();
    let outcome = flow
        .submit(
            "Market crash! How do I protect my portfolio from this volatility?",
            None,
        )
        .await;

    assert_eq!(outcome.intent, Intent::Crisis);
    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(
        outcome.executed,
        vec![ids(&["research_team"]), ids(&["optimization_team"])]
    );
    assert!(outcome
        .context
        .fact_str("volatility_drivers")
        .is_some_and(|v| v.contains("rate expectations")));
    assert_eq!(outcome.result.contributors.len(), 4);
}

#[tokio::test]
async fn unmatched_request_fans_out_broadly() {
    let flow = static_flow();
    let outcome = flow.submit("hello there", None).await;

    assert_eq!(outcome.intent, Intent::General);
    assert!(outcome.plan.broad);
    assert!(!outcome.routing_fallback);
    assert_eq!(
        outcome.executed,
        vec![ids(&["general_team", "research_team"])]
    );
    assert!(outcome
        .result
        .contributors
        .contains(&NodeId::from("researcher")));
}

#[tokio::test]
async fn empty_request_falls_back_to_the_default_entry() {
    let flow = static_flow();
    let outcome = flow.submit("   ", None).await;

    assert!(outcome.routing_fallback);
    assert!(outcome.routing_error.is_some());
    assert_eq!(outcome.plan.entry.as_str(), "general_team");
    assert!(!outcome.plan.broad);
    assert_eq!(outcome.state, EngineState::Completed);
}

#[tokio::test]
async fn session_hints_reach_templates() {
    let flow = static_flow();
    let mut session = finflow_agent::SessionContext::new();
    session.insert("sector".into(), serde_json::json!("energy"));
    let outcome = flow.submit("hello there", Some(session)).await;
    assert!(outcome
        .context
        .output(&NodeId::from("market_analyst"))
        .is_some_and(|o| o.contains("Market view for energy")));
}

#[tokio::test(start_paused = true)]
async fn slow_branch_times_out_without_sinking_the_request() {
    let settings = EngineSettings {
        branch_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let flow = parallel_flow(
        vec![
            ("analyst", MockWorker::new("analyst")),
            ("manager", MockWorker::new("manager")),
            (
                "risk",
                MockWorker::new("risk").with_delay(Duration::from_millis(500)),
            ),
        ],
        settings,
    );

    let outcome = flow.submit("anything", None).await;
    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(outcome.result.contributors, ids(&["analyst", "manager"]));
    assert_eq!(outcome.result.failures.len(), 1);
    assert_eq!(outcome.result.failures[0].node_id.as_str(), "risk");
    assert_eq!(outcome.result.failures[0].kind, FailureKind::Timeout);
    assert_eq!(
        outcome.context.fact_str("risk_status").as_deref(),
        Some("failed")
    );
}

#[tokio::test]
async fn zero_successes_fail_the_request() {
    let flow = parallel_flow(
        vec![
            ("a", MockWorker::new("a").failing("upstream 500")),
            ("b", MockWorker::new("b").failing("upstream 503")),
        ],
        EngineSettings::default(),
    );
    let outcome = flow.submit("anything", None).await;
    assert_eq!(outcome.state, EngineState::Failed);
    assert!(outcome.result.insufficient);
    assert!(outcome
        .result
        .failures
        .iter()
        .any(|f| f.node_id.as_str() == "general_team" && f.kind == FailureKind::Insufficient));
}

#[tokio::test(start_paused = true)]
async fn merged_result_ignores_completion_order() {
    let run = |delays: [u64; 3]| async move {
        let flow = parallel_flow(
            vec![
                (
                    "a",
                    MockWorker::new("a").with_delay(Duration::from_millis(delays[0])),
                ),
                (
                    "b",
                    MockWorker::new("b").with_delay(Duration::from_millis(delays[1])),
                ),
                (
                    "c",
                    MockWorker::new("c").with_delay(Duration::from_millis(delays[2])),
                ),
            ],
            EngineSettings::default(),
        );
        flow.submit("anything", None).await.result
    };

    let first = run([10, 20, 30]).await;
    let second = run([30, 10, 20]).await;
    assert_eq!(first.content, second.content);
    assert_eq!(first.contributors, second.contributors);
}

#[tokio::test(start_paused = true)]
async fn request_deadline_cancels_outstanding_work() {
    let settings = EngineSettings {
        request_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let flow = parallel_flow(
        vec![
            ("fast", MockWorker::new("fast")),
            (
                "slow",
                MockWorker::new("slow").with_delay(Duration::from_secs(5)),
            ),
        ],
        settings,
    );
    let outcome = flow.submit("anything", None).await;
    assert_eq!(outcome.state, EngineState::Completed);
    assert_eq!(outcome.result.contributors, ids(&["fast"]));
    let slow = &outcome.result.failures[0];
    assert_eq!(slow.node_id.as_str(), "slow");
    assert_eq!(slow.kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn run_logger_records_a_request() {
    let dir = tempfile::tempdir().unwrap();
    let flow = static_flow();
    let rx = flow.event_bus().subscribe();
    let logger = tokio::spawn(
        RunLogger::new(dir.path().to_path_buf(), 3).run(rx, CancellationToken::new(), Some(1)),
    );

    let outcome = flow.submit("How should I rebalance my portfolio?", None).await;
    logger.await.unwrap();

    let request_dir = dir.path().join(outcome.request_id.to_string());
    let file = std::fs::read_dir(&request_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let text = std::fs::read_to_string(file).unwrap();
    let events: Vec<String> = text
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["event_type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(events.first().map(String::as_str), Some("request_started"));
    assert_eq!(events.last().map(String::as_str), Some("request_finished"));
    assert!(events.iter().any(|e| e == "node_completed"));
}
