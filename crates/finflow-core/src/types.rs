use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a node (worker or team) in the workflow graph.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier of one submitted request.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin of a message in the execution history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    WorkerOutput,
    System,
}

/// A single entry in the append-only execution history.
///
/// Messages are immutable once created; the context only ever appends them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub source: NodeId,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            source: NodeId::new("user"),
            kind: MessageKind::User,
            content: text.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn worker_output(source: NodeId, text: impl Into<String>) -> Self {
        Self {
            source,
            kind: MessageKind::WorkerOutput,
            content: text.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(source: NodeId, text: impl Into<String>) -> Self {
        Self {
            source,
            kind: MessageKind::System,
            content: text.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Record of one tool invocation made by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
    pub succeeded: bool,
}

/// What a worker hands back to the engine.
#[derive(Debug, Clone, Default)]
pub struct WorkerResponse {
    pub content: String,
    pub used_tools: Vec<ToolCall>,
    /// Scratch hints to publish for later nodes (e.g. detected sector).
    pub facts: HashMap<String, serde_json::Value>,
}

impl WorkerResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.used_tools.push(call);
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.facts.insert(key.into(), value);
        self
    }
}

/// A successful output of one node, labeled with its producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub node_id: NodeId,
    pub label: String,
    pub content: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub elapsed_ms: u64,
}

/// Why a node contributed no output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker returned an error or an unusable output.
    Worker,
    /// The branch or call exceeded its deadline.
    Timeout,
    /// Outstanding work was cancelled at the request deadline.
    Cancelled,
    /// A selector found no eligible candidate on its first evaluation.
    NoEligibleCandidate,
    /// A required team produced zero usable outputs.
    Insufficient,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NoEligibleCandidate => "no_eligible_candidate",
            Self::Insufficient => "insufficient",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub kind: FailureKind,
    pub message: String,
}

impl NodeFailure {
    pub fn new(node_id: NodeId, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            node_id,
            kind,
            message: message.into(),
        }
    }
}

/// Role in an LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// A completed (non-streaming) LLM response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition exposed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Execution mode of a team, chosen per team by configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TeamMode {
    /// Members run one after another in declared order.
    Sequential,
    /// Members run concurrently on forks of the same snapshot.
    Parallel,
    /// A guard-driven loop picks the next member each iteration.
    #[serde(alias = "dynamic_selector")]
    Selector,
    /// Exactly one member whose output becomes a shared fact.
    #[serde(alias = "single_delegate")]
    Delegate,
}

impl std::fmt::Display for TeamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Selector => "selector",
            Self::Delegate => "delegate",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of one request inside the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Routing,
    Executing,
    Aggregating,
    Completed,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Routing => "routing",
            Self::Executing => "executing",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Events published on the [`EventBus`](crate::EventBus) while a request runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RequestStarted {
        request_id: RequestId,
        query: String,
    },
    Routed {
        request_id: RequestId,
        intent: String,
        entry: NodeId,
        broad: bool,
        fallback: bool,
    },
    StateChanged {
        request_id: RequestId,
        state: EngineState,
    },
    NodeStarted {
        request_id: RequestId,
        node_id: NodeId,
    },
    NodeCompleted {
        request_id: RequestId,
        node_id: NodeId,
        elapsed_ms: u64,
    },
    NodeFailed {
        request_id: RequestId,
        node_id: NodeId,
        kind: FailureKind,
        message: String,
    },
    RequestFinished {
        request_id: RequestId,
        state: EngineState,
        contributors: usize,
        failures: usize,
        elapsed_ms: u64,
    },
}

impl EngineEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::RequestStarted { request_id, .. }
            | Self::Routed { request_id, .. }
            | Self::StateChanged { request_id, .. }
            | Self::NodeStarted { request_id, .. }
            | Self::NodeCompleted { request_id, .. }
            | Self::NodeFailed { request_id, .. }
            | Self::RequestFinished { request_id, .. } => request_id,
        }
    }
}
