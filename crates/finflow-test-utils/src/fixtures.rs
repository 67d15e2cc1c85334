use std::path::{Path, PathBuf};

/// A complete workflow built only from static workers, so it runs without a
/// model. Mirrors the built-in advisory workflow's teams and routing.
pub const STATIC_WORKFLOW: &str = r#"
[engine]
request_timeout_secs = 30
branch_timeout_secs = 10
worker_timeout_secs = 5
max_selector_iterations = 4

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
kind = "static"
response = "Market view for {sector}: momentum is mixed. ANALYST_DONE"

[[workers]]
id = "portfolio_manager"
name = "Portfolio Manager"
kind = "static"
response = "Rebalance toward a 60/40 split. PORTFOLIO_MANAGER_DONE"

[[workers]]
id = "risk_assessor"
name = "Risk Assessor"
kind = "static"
response = "Concentration risk is elevated. RISK_DONE"

[[workers]]
id = "educator"
name = "Financial Educator"
kind = "static"
response = "Lesson on: {query}. EDUCATOR_DONE"

[[workers]]
id = "researcher"
name = "Market Researcher"
kind = "static"
response = "Volatility is driven by rate expectations. RESEARCH_DONE"

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

/// Write `contents` to `finflow.toml` inside `dir` and return its path.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("finflow.toml");
    std::fs::write(&path, contents).expect("write test config");
    path
}

/// A temp directory holding [`STATIC_WORKFLOW`] as `finflow.toml`.
pub fn static_workflow_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = write_config(dir.path(), STATIC_WORKFLOW);
    (dir, path)
}
