use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use finflow_core::config::ToolsConfig;
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::{Tool, ToolGateway};
use finflow_core::types::{ToolDefinition, ToolResult};

use crate::builtin::{
    KnowledgeBase, KnowledgeSearchTool, MarketDataTool, PortfolioAnalyticsTool, PortfolioDb,
    PortfolioQueryTool,
};

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

/// Registry of available tools.
///
/// Every call is bounded by the tool's concurrency limit and timeout; time
/// spent waiting for a permit counts against the timeout.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    timeout_override: Option<u64>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout_override: None,
        }
    }

    /// Use one timeout for every tool instead of each tool's own.
    pub fn with_timeout_override(mut self, secs: Option<u64>) -> Self {
        self.timeout_override = secs;
        for entry in self.tools.values_mut() {
            entry.timeout = Duration::from_secs(secs.unwrap_or(entry.tool.timeout_secs()));
        }
        self
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let timeout = Duration::from_secs(self.timeout_override.unwrap_or(tool.timeout_secs()));
        let permits = Arc::new(Semaphore::new(tool.max_concurrency().max(1)));
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                permits,
                timeout,
            },
        );
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| e.tool.clone())
    }

    /// List all registered tools, sorted by name.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolResult> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| FinflowError::ToolNotFound(name.to_string()))?;

        let timed_out = || FinflowError::ToolTimeout {
            tool: name.to_string(),
            timeout_secs: entry.timeout.as_secs(),
        };
        let deadline = tokio::time::Instant::now() + entry.timeout;

        let _permit = tokio::time::timeout_at(deadline, entry.permits.clone().acquire_owned())
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| FinflowError::ToolExecution {
                tool: name.to_string(),
                message: "tool permits closed".into(),
            })?;

        debug!(tool = %name, "Executing tool");
        match tokio::time::timeout_at(deadline, entry.tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = %name, timeout_secs = entry.timeout.as_secs(), "Tool timed out");
                Err(timed_out())
            }
        }
    }

    /// Get tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|e| ToolDefinition {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                input_schema: e.tool.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Build a registry with the built-in tools whose data sources are
    /// configured. `portfolio_analytics` is always available; it reads
    /// holdings from the database when one is configured.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let mut registry = Self::new().with_timeout_override(config.timeout_secs);

        if let Some(dir) = &config.knowledge_dir {
            let kb = KnowledgeBase::load(Path::new(dir))?;
            info!(dir = %dir, chunks = kb.len(), "Knowledge base loaded");
            registry.register(KnowledgeSearchTool::new(Arc::new(kb)));
        }

        let db = match &config.database {
            Some(path) => {
                let db = Arc::new(PortfolioDb::open_read_only(Path::new(path))?);
                registry.register(PortfolioQueryTool::new(db.clone()));
                Some(db)
            }
            None => None,
        };
        registry.register(PortfolioAnalyticsTool::new(db));

        if let Some(market) = &config.market_data {
            registry.register(MarketDataTool::new(market.clone())?);
        }

        Ok(registry)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolGateway for ToolRegistry {
    fn invoke(&self, name: &str, args: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        let name = name.to_string();
        Box::pin(async move { self.execute(&name, args).await })
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        ToolRegistry::definitions(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_test_utils::MockTool;

    #[tokio::test]
    async fn test_execute_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("echo").with_response("pong"));

        let result = registry
            .execute("echo", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.content, "pong");
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FinflowError::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(
            MockTool::new("slow")
                .with_delay(Duration::from_secs(120))
                .with_timeout_secs(5),
        );

        let err = registry
            .execute("slow", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FinflowError::ToolTimeout { timeout_secs: 5, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_serializes_calls() {
        let mut registry = ToolRegistry::new();
        let tool = MockTool::new("single")
            .with_delay(Duration::from_secs(1))
            .with_max_concurrency(1);
        let counter = tool.call_counter();
        registry.register(tool);

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            registry.execute("single", serde_json::json!({})),
            registry.execute("single", serde_json::json!({})),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_gateway_trait_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("echo").with_response("via gateway"));
        let gateway: Arc<dyn ToolGateway> = Arc::new(registry);

        let result = gateway.invoke("echo", serde_json::json!({})).await.unwrap();
        assert_eq!(result.content, "via gateway");
        assert_eq!(gateway.definitions().len(), 1);
    }

    #[test]
    fn test_from_empty_config_has_analytics_only() {
        let registry = ToolRegistry::from_config(&ToolsConfig::default()).unwrap();
        assert_eq!(registry.list(), vec!["portfolio_analytics"]);
    }
}
