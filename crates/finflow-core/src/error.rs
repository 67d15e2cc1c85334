use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinflowError {
    // Routing errors
    #[error("Routing failed: {0}")]
    Routing(String),

    // Worker errors
    #[error("Worker failed: {node}: {message}")]
    Worker { node: String, message: String },

    #[error("Malformed context for {node}: {message}")]
    MalformedContext { node: String, message: String },

    #[error("Branch timeout after {timeout_ms}ms: {node}")]
    BranchTimeout { node: String, timeout_ms: u64 },

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Aggregation errors
    #[error("Aggregation insufficient: {0}")]
    AggregationInsufficient(String),

    // Graph errors
    #[error("Graph configuration error: {0}")]
    GraphConfig(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Request cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FinflowError>;
