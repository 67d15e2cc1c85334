use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use finflow_core::context::ExecutionContext;
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::Worker;
use finflow_core::types::{ToolCall, WorkerResponse};

type Handler = dyn Fn(&ExecutionContext) -> Result<WorkerResponse> + Send + Sync;

/// Scripted worker for deterministic engine tests.
///
/// Responses are consumed in order; once the script runs out the last
/// response repeats. A handler, when set, takes precedence over the script.
pub struct MockWorker {
    name: String,
    script: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    delay: Option<Duration>,
    failure: Option<String>,
    facts: HashMap<String, serde_json::Value>,
    tools: Vec<String>,
    handler: Option<Box<Handler>>,
    calls: Arc<AtomicUsize>,
    seen_history: Arc<Mutex<Vec<usize>>>,
}

impl MockWorker {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            last: Mutex::new(format!("{} output", name)),
            name,
            script: Mutex::new(VecDeque::new()),
            delay: None,
            failure: None,
            facts: HashMap::new(),
            tools: Vec::new(),
            handler: None,
            calls: Arc::new(AtomicUsize::new(0)),
            seen_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a response.
    pub fn with_response(self, text: impl Into<String>) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(text.into());
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every call fails with a worker error.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.facts.insert(key.into(), value);
        self
    }

    /// Report a successful call of the named tool with every response.
    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tools.push(name.into());
        self
    }

    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<WorkerResponse> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(f));
        self
    }

    /// Shared counter of `respond` invocations.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// History length observed at each call.
    pub fn history_probe(&self) -> Arc<Mutex<Vec<usize>>> {
        self.seen_history.clone()
    }

    fn next_text(&self) -> String {
        let mut last = match self.last.lock() {
            Ok(l) => l,
            Err(p) => p.into_inner(),
        };
        if let Ok(mut script) = self.script.lock() {
            if let Some(next) = script.pop_front() {
                *last = next;
            }
        }
        last.clone()
    }
}

impl Worker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn respond<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<WorkerResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen_history.lock() {
                seen.push(ctx.history().len());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(msg) = &self.failure {
                return Err(FinflowError::Worker {
                    node: self.name.clone(),
                    message: msg.clone(),
                });
            }
            let mut response = match &self.handler {
                Some(h) => h(ctx)?,
                None => WorkerResponse::text(self.next_text()),
            };
            for (k, v) in &self.facts {
                response.facts.insert(k.clone(), v.clone());
            }
            for t in &self.tools {
                response.used_tools.push(ToolCall {
                    name: t.clone(),
                    args: serde_json::Value::Null,
                    succeeded: true,
                });
            }
            Ok(response)
        })
    }
}
