use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{Message, NodeId, RequestId, WorkerResponse};

/// Per-request state threaded through the workflow graph.
///
/// The history is append-only. `outputs` holds the last output of each node
/// and `scratch` carries cross-node hints such as a detected sector, the
/// user's risk tolerance or facts published by a delegate team.
///
/// Parallel branches run on a [`fork`](Self::fork) of the context and hand
/// back a [`ContextDelta`] which the parent merges with
/// [`absorb`](Self::absorb). A fork never observes its siblings' writes.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    query: String,
    history: Vec<Message>,
    outputs: HashMap<NodeId, String>,
    scratch: HashMap<String, serde_json::Value>,
    #[serde(skip)]
    fork_point: usize,
    #[serde(skip)]
    touched_outputs: BTreeSet<NodeId>,
    #[serde(skip)]
    touched_scratch: BTreeSet<String>,
}

/// Everything a forked context produced since the fork.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextDelta {
    pub messages: Vec<Message>,
    pub outputs: Vec<(NodeId, String)>,
    pub scratch: Vec<(String, serde_json::Value)>,
}

impl ContextDelta {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.outputs.is_empty() && self.scratch.is_empty()
    }
}

impl ExecutionContext {
    /// Start a fresh context whose history begins with the user's query.
    pub fn new(request_id: RequestId, query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            request_id,
            history: vec![Message::user(query.clone())],
            query,
            outputs: HashMap::new(),
            scratch: HashMap::new(),
            fork_point: 0,
            touched_outputs: BTreeSet::new(),
            touched_scratch: BTreeSet::new(),
        }
    }

    /// Seed scratch hints supplied with the request (email, risk tolerance).
    pub fn with_session(mut self, session: HashMap<String, serde_json::Value>) -> Self {
        for (k, v) in session {
            self.set_fact(k, v);
        }
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn output(&self, node: &NodeId) -> Option<&str> {
        self.outputs.get(node).map(String::as_str)
    }

    pub fn outputs(&self) -> &HashMap<NodeId, String> {
        &self.outputs
    }

    pub fn fact(&self, key: &str) -> Option<&serde_json::Value> {
        self.scratch.get(key)
    }

    pub fn fact_str(&self, key: &str) -> Option<&str> {
        self.scratch.get(key).and_then(|v| v.as_str())
    }

    pub fn scratch(&self) -> &HashMap<String, serde_json::Value> {
        &self.scratch
    }

    /// Look a key up in scratch first, then among node outputs.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(v) = self.scratch.get(key) {
            return Some(match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        self.outputs.get(&NodeId::from(key)).cloned()
    }

    pub fn set_fact(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.touched_scratch.insert(key.clone());
        self.scratch.insert(key, value);
    }

    pub fn push_message(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Record a worker's successful output.
    ///
    /// Appends the output to the history, stores it as the node's last
    /// output, publishes the worker's facts and fills the node's declared
    /// `writes` keys. When the output is a JSON object, each write key is
    /// taken from the matching field; otherwise the whole text is stored.
    pub fn record_output(&mut self, node: &NodeId, response: &WorkerResponse, writes: &[String]) {
        let tools: Vec<&str> = response.used_tools.iter().map(|t| t.name.as_str()).collect();
        let mut message = Message::worker_output(node.clone(), response.content.clone());
        if !tools.is_empty() {
            message = message.with_metadata("tools", serde_json::json!(tools));
        }
        self.history.push(message);

        self.outputs.insert(node.clone(), response.content.clone());
        self.touched_outputs.insert(node.clone());

        self.ingest_writes(writes, &response.content);
        for (k, v) in &response.facts {
            self.set_fact(k.clone(), v.clone());
        }
        self.set_fact(
            format!("{}_status", node),
            serde_json::Value::String("completed".into()),
        );
    }

    /// Mark a node as failed in scratch so guards can branch on it.
    pub fn record_failure(&mut self, node: &NodeId, reason: &str) {
        self.history.push(
            Message::system(node.clone(), reason.to_string())
                .with_metadata("failed", serde_json::json!(true)),
        );
        self.set_fact(
            format!("{}_status", node),
            serde_json::Value::String("failed".into()),
        );
    }

    fn ingest_writes(&mut self, writes: &[String], text: &str) {
        if writes.is_empty() {
            return;
        }
        if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(text) {
            for key in writes {
                if let Some(val) = obj.get(key) {
                    self.set_fact(key.clone(), val.clone());
                }
            }
            return;
        }
        for key in writes {
            self.set_fact(key.clone(), serde_json::Value::String(text.to_string()));
        }
    }

    /// Keys from `reads` that are neither in scratch nor a node output.
    pub fn missing_inputs<'a>(&self, reads: &'a [String]) -> Vec<&'a str> {
        reads
            .iter()
            .filter(|k| self.lookup(k).is_none())
            .map(String::as_str)
            .collect()
    }

    /// Isolated snapshot for a parallel branch.
    pub fn fork(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            query: self.query.clone(),
            history: self.history.clone(),
            outputs: self.outputs.clone(),
            scratch: self.scratch.clone(),
            fork_point: self.history.len(),
            touched_outputs: BTreeSet::new(),
            touched_scratch: BTreeSet::new(),
        }
    }

    /// Consume a fork and return what it wrote since forking.
    pub fn into_delta(mut self) -> ContextDelta {
        let messages = self.history.split_off(self.fork_point.min(self.history.len()));
        let outputs = self
            .touched_outputs
            .iter()
            .filter_map(|id| self.outputs.get(id).map(|v| (id.clone(), v.clone())))
            .collect();
        let scratch = self
            .touched_scratch
            .iter()
            .filter_map(|k| self.scratch.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        ContextDelta {
            messages,
            outputs,
            scratch,
        }
    }

    /// Merge a branch delta. Later absorbs overwrite earlier ones on key
    /// conflict, so callers absorb in declared member order.
    pub fn absorb(&mut self, delta: ContextDelta) {
        self.history.extend(delta.messages);
        for (id, text) in delta.outputs {
            self.touched_outputs.insert(id.clone());
            self.outputs.insert(id, text);
        }
        for (k, v) in delta.scratch {
            self.set_fact(k, v);
        }
    }
}
