use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::Tool;
use finflow_core::types::ToolResult;

/// Configurable tool that records its inputs.
pub struct MockTool {
    name: String,
    response: String,
    delay: Option<Duration>,
    failure: Option<String>,
    timeout_secs: u64,
    max_concurrency: usize,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: "ok".into(),
            delay: None,
            failure: None,
            timeout_secs: 30,
            max_concurrency: 4,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.response = text.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn recorded_inputs(&self) -> Arc<Mutex<Vec<serde_json::Value>>> {
        self.inputs.clone()
    }
}

impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Mock tool for tests"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut inputs) = self.inputs.lock() {
                inputs.push(input);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.failure {
                Some(msg) => Err(FinflowError::ToolExecution {
                    tool: self.name.clone(),
                    message: msg.clone(),
                }),
                None => Ok(ToolResult::success(self.response.clone())),
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
