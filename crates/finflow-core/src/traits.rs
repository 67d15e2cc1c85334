use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::*;

/// One unit of reasoning inside the workflow graph.
///
/// Workers read the context but never mutate it; the engine records the
/// returned response.
pub trait Worker: Send + Sync + 'static {
    /// Display name used in labels and logs.
    fn name(&self) -> &str;

    /// Produce this worker's contribution given the current context.
    fn respond<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<WorkerResponse>>;
}

/// Chat-completion client. One completion per call.
pub trait LlmClient: Send + Sync + 'static {
    fn chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<ChatResponse>>;
}

/// A named tool callable from workers.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in worker bindings).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Maximum number of in-flight calls to this tool.
    fn max_concurrency(&self) -> usize {
        4
    }
}

/// Narrow interface through which workers reach external data.
///
/// Implementations bound each tool's concurrency and duration. The engine
/// itself never calls the gateway.
pub trait ToolGateway: Send + Sync + 'static {
    fn invoke(&self, name: &str, args: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>>;

    fn definitions(&self) -> Vec<ToolDefinition>;
}
