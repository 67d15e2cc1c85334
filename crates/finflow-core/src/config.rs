use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FinflowError, Result};
use crate::types::TeamMode;

/// Top-level finflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard deadline for one request, routing to aggregation.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Default per-branch deadline inside parallel teams.
    #[serde(default = "default_branch_timeout")]
    pub branch_timeout_secs: u64,
    /// Default bound on a single worker call.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
    /// Engine-wide cap on concurrent worker calls.
    #[serde(default = "default_max_concurrent_branches")]
    pub max_concurrent_branches: usize,
    /// Cap on requests executing at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Iteration bound for selector teams that set none.
    #[serde(default = "default_max_selector_iterations")]
    pub max_selector_iterations: usize,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            branch_timeout_secs: default_branch_timeout(),
            worker_timeout_secs: default_worker_timeout(),
            max_concurrent_branches: default_max_concurrent_branches(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_selector_iterations: default_max_selector_iterations(),
            log: None,
        }
    }
}

fn default_request_timeout() -> u64 { 180 }
fn default_branch_timeout() -> u64 { 90 }
fn default_worker_timeout() -> u64 { 60 }
fn default_max_concurrent_branches() -> usize { 8 }
fn default_max_concurrent_requests() -> usize { 4 }
fn default_max_selector_iterations() -> usize { 6 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = request summary only, 2 = per node (default).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.2 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Built-in tool settings. A tool is registered only when its data source
/// is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directory of `.txt` knowledge collections.
    #[serde(default)]
    pub knowledge_dir: Option<String>,
    /// Path to the portfolio SQLite database (opened read-only).
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub market_data: Option<MarketDataConfig>,
    /// Per-tool timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Quote endpoint; `{ticker}` is substituted per call.
    pub url_template: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Header carrying the API key.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

fn default_api_key_header() -> String { "X-API-Key".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Scores below this are not candidates.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Intent name -> entry node id.
    #[serde(default)]
    pub entries: HashMap<String, String>,
    /// Entry used when routing fails or nothing matches.
    #[serde(default = "default_entry")]
    pub default_entry: String,
    /// Nodes added to stage 0 for broad (unmatched) requests.
    #[serde(default)]
    pub broad_fanout: Vec<String>,
    /// Classification rules. Empty means the built-in rule set.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            entries: HashMap::new(),
            default_entry: default_entry(),
            broad_fanout: Vec::new(),
            rules: Vec::new(),
        }
    }
}

fn default_min_confidence() -> f32 { 1.0 }
fn default_entry() -> String { "general_team".to_string() }

/// One keyword rule for an intent.
///
/// A rule matches when every `require` group has at least one keyword in
/// the request. Its score is `(matched groups + matched phrases) * weight`;
/// a single phrase hit also scores without the groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub intent: String,
    #[serde(default)]
    pub require: Vec<Vec<String>>,
    #[serde(default)]
    pub phrases: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 { 1.0 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Worker invoked once on the merged content.
    #[serde(default)]
    pub synthesizer: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    Llm,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: WorkerKind,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Template for static workers; `{query}` and `{<key>}` are filled in.
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolBinding>,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkerConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A tool a worker calls before reasoning. String args may reference
/// context values as `{query}` or `{<scratch key>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBinding {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub mode: TeamMode,
    pub members: Vec<MemberConfig>,
    #[serde(default)]
    pub termination: Option<TerminationConfig>,
    #[serde(default)]
    pub branch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Scratch key for a delegate team's findings.
    #[serde(default)]
    pub fact_key: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
}

impl TeamConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A team member: either a bare node id or a node with a guard and priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberConfig {
    Id(String),
    Detailed {
        node: String,
        #[serde(default)]
        guard: Option<String>,
        #[serde(default)]
        priority: i32,
    },
}

impl MemberConfig {
    pub fn node(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Detailed { node, .. } => node,
        }
    }

    pub fn guard(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Detailed { guard, .. } => guard.as_deref(),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Self::Id(_) => 0,
            Self::Detailed { priority, .. } => *priority,
        }
    }
}

/// Declarative form of a team's termination predicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminationConfig {
    Never,
    TextMention { text: String },
    AllReported,
    MaxMessages { count: usize },
    TopicsCovered { topics: Vec<String> },
    ContextKey { key: String },
    Any { conditions: Vec<TerminationConfig> },
    All { conditions: Vec<TerminationConfig> },
}

/// Conditional continuation between top-level plan steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, &[])
    }

    /// Load a config file and apply `key.path=value` overrides on top.
    pub fn load_with_overrides(path: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FinflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        Self::parse_with_overrides(&expanded, overrides)
    }

    pub fn parse_with_overrides(text: &str, overrides: &[(String, String)]) -> Result<Self> {
        let mut value: toml::Value =
            toml::from_str(text).map_err(|e| FinflowError::Config(e.to_string()))?;
        for (key, raw) in overrides {
            set_path(&mut value, key, parse_override_value(raw))?;
        }
        value
            .try_into()
            .map_err(|e: toml::de::Error| FinflowError::Config(e.to_string()))
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn team(&self, id: &str) -> Option<&TeamConfig> {
        self.teams.iter().find(|t| t.id == id)
    }
}

/// Parse `key=value` as given on the command line.
pub fn parse_override(arg: &str) -> Result<(String, String)> {
    let (k, v) = arg
        .split_once('=')
        .ok_or_else(|| FinflowError::Config(format!("override must be key=value: {}", arg)))?;
    let k = k.trim();
    if k.is_empty() {
        return Err(FinflowError::Config(format!("empty override key: {}", arg)));
    }
    Ok((k.to_string(), v.trim().to_string()))
}

fn parse_override_value(raw: &str) -> toml::Value {
    // Bare words become strings; numbers, booleans and arrays keep their type
    match toml::from_str::<toml::Table>(&format!("v = {}", raw)) {
        Ok(mut t) => t
            .remove("v")
            .unwrap_or_else(|| toml::Value::String(raw.to_string())),
        Err(_) => toml::Value::String(raw.to_string()),
    }
}

fn set_path(root: &mut toml::Value, key: &str, new_value: toml::Value) -> Result<()> {
    let mut parts = key.split('.').peekable();
    let mut cur = root;
    while let Some(part) = parts.next() {
        let table = cur
            .as_table_mut()
            .ok_or_else(|| FinflowError::Config(format!("cannot override into non-table: {}", key)))?;
        if parts.peek().is_none() {
            table.insert(part.to_string(), new_value);
            return Ok(());
        }
        cur = table
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }
    Ok(())
}

fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FINFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FINFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FINFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FINFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FINFLOW_VAR}\"");
    }

    #[test]
    fn test_engine_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.request_timeout_secs, 180);
        assert_eq!(config.engine.branch_timeout_secs, 90);
        assert_eq!(config.engine.max_concurrent_branches, 8);
        assert_eq!(config.engine.max_selector_iterations, 6);
        assert!(config.model.is_none());
        assert_eq!(config.routing.default_entry, "general_team");
        assert!(config.routing.rules.is_empty());
    }

    #[test]
    fn test_team_members_accept_both_forms() {
        let toml_str = r#"
[[teams]]
id = "learning_team"
mode = "selector"
members = [
    "educator",
    { node = "market_analyst", guard = "educator contains EDUCATOR_DONE", priority = 1 },
]
termination = { type = "text_mention", text = "ANALYST_DONE" }
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let team = &config.teams[0];
        assert_eq!(team.mode, TeamMode::Selector);
        assert_eq!(team.members[0].node(), "educator");
        assert!(team.members[0].guard().is_none());
        assert_eq!(team.members[1].node(), "market_analyst");
        assert_eq!(team.members[1].priority(), 1);
        assert_eq!(
            team.termination,
            Some(TerminationConfig::TextMention {
                text: "ANALYST_DONE".into()
            })
        );
    }

    #[test]
    fn test_nested_termination() {
        let toml_str = r#"
[[teams]]
id = "t"
mode = "sequential"
members = ["a"]

[teams.termination]
type = "any"
conditions = [
    { type = "max_messages", count = 6 },
    { type = "topics_covered", topics = ["risk", "allocation"] },
]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        match config.teams[0].termination.as_ref().unwrap() {
            TerminationConfig::Any { conditions } => assert_eq!(conditions.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_worker_defaults() {
        let toml_str = r#"
[[workers]]
id = "educator"
system_prompt = "Explain simply."
tools = [{ name = "knowledge_search", args = { query = "{query}" } }]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let w = config.worker("educator").unwrap();
        assert_eq!(w.kind, WorkerKind::Llm);
        assert_eq!(w.display_name(), "educator");
        assert!(!w.optional);
        assert_eq!(w.tools[0].args["query"], "{query}");
    }

    #[test]
    fn test_overrides_apply_typed_values() {
        let text = r#"
[engine]
request_timeout_secs = 30
"#;
        let overrides = vec![
            parse_override("engine.request_timeout_secs=5").unwrap(),
            parse_override("routing.default_entry=research_team").unwrap(),
            parse_override("engine.log.enabled=false").unwrap(),
        ];
        let config = AppConfig::parse_with_overrides(text, &overrides).unwrap();
        assert_eq!(config.engine.request_timeout_secs, 5);
        assert_eq!(config.routing.default_entry, "research_team");
        assert!(!config.engine.log.unwrap().enabled);
    }

    #[test]
    fn test_parse_override_rejects_missing_equals() {
        assert!(parse_override("engine.request_timeout_secs").is_err());
        assert!(parse_override("=3").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/finflow.toml")).unwrap_err();
        assert!(matches!(err, FinflowError::ConfigNotFound(_)));
    }
}
