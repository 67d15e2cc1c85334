//! Concrete workers built from `[[workers]]` configuration.
//!
//! - [`LlmWorker`] calls its bound tools through the gateway, folds their
//!   results and the request context into one prompt, and asks the model.
//! - [`StaticWorker`] renders a fixed response template. Useful offline and
//!   in tests.
//!
//! Templates use `{key}` placeholders: `{query}` is the request text, any
//! other key resolves through [`ExecutionContext::lookup`].

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use finflow_core::config::{ModelConfig, ToolBinding};
use finflow_core::context::ExecutionContext;
use finflow_core::error::{FinflowError, Result};
use finflow_core::text::truncate;
use finflow_core::traits::{LlmClient, ToolGateway, Worker};
use finflow_core::types::{ChatMessage, MessageKind, ToolCall, WorkerResponse};

/// Tool output longer than this is cut before it reaches the prompt.
const MAX_TOOL_CHARS: usize = 4000;

/// Render `{key}` placeholders. Returns the text and the keys that did not
/// resolve; unresolved placeholders are left in place.
pub fn render(template: &str, ctx: &ExecutionContext) -> (String, Vec<String>) {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return (out, missing);
        };
        let key = &after[..close];
        let is_key = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        let value = if !is_key {
            None
        } else if key == "query" {
            Some(ctx.query().to_string())
        } else {
            ctx.lookup(key)
        };
        match value {
            Some(v) => out.push_str(&v),
            None => {
                if is_key {
                    missing.push(key.to_string());
                }
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    (out, missing)
}

/// Render tool arguments against the context.
///
/// A string that is exactly one placeholder takes the fact's JSON value, so
/// `"{portfolio_id}"` stays a number. Object fields that do not resolve are
/// dropped; an unresolved value anywhere else makes the binding unusable.
pub fn render_args(args: &serde_json::Value, ctx: &ExecutionContext) -> Option<serde_json::Value> {
    use serde_json::Value;

    match args {
        Value::String(s) => {
            if let Some(key) = s.strip_prefix('{').and_then(|k| k.strip_suffix('}')) {
                if key != "query" {
                    if let Some(v) = ctx.fact(key) {
                        return Some(v.clone());
                    }
                }
            }
            let (text, missing) = render(s, ctx);
            missing.is_empty().then_some(Value::String(text))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                match render_args(v, ctx) {
                    Some(rendered) => {
                        out.insert(k.clone(), rendered);
                    }
                    None => debug!(field = %k, "Dropping unresolved tool argument"),
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| render_args(v, ctx))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Value::Null => Some(Value::Object(serde_json::Map::new())),
        other => Some(other.clone()),
    }
}

/// A model-backed specialist.
pub struct LlmWorker {
    name: String,
    system_prompt: String,
    bindings: Vec<ToolBinding>,
    gateway: Arc<dyn ToolGateway>,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl LlmWorker {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        gateway: Arc<dyn ToolGateway>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            bindings: vec![],
            gateway,
            llm,
            model,
        }
    }

    pub fn with_tools(mut self, bindings: Vec<ToolBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    async fn gather(&self, ctx: &ExecutionContext) -> (Vec<ToolCall>, Vec<String>) {
        let mut calls = Vec::new();
        let mut sections = Vec::new();
        for binding in &self.bindings {
            let Some(args) = render_args(&binding.args, ctx) else {
                debug!(worker = %self.name, tool = %binding.name, "Skipping tool, arguments unresolved");
                continue;
            };
            match self.gateway.invoke(&binding.name, args.clone()).await {
                Ok(result) => {
                    calls.push(ToolCall {
                        name: binding.name.clone(),
                        args,
                        succeeded: !result.is_error,
                    });
                    sections.push(format!(
                        "### {}\n{}",
                        binding.name,
                        truncate(&result.content, MAX_TOOL_CHARS)
                    ));
                }
                Err(e) => {
                    warn!(worker = %self.name, tool = %binding.name, error = %e, "Tool call failed");
                    calls.push(ToolCall {
                        name: binding.name.clone(),
                        args,
                        succeeded: false,
                    });
                    sections.push(format!("### {}\n(unavailable: {})", binding.name, e));
                }
            }
        }
        (calls, sections)
    }
}

impl Worker for LlmWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn respond<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<WorkerResponse>> {
        Box::pin(async move {
            let (calls, sections) = self.gather(ctx).await;
            let messages = vec![
                ChatMessage::system(self.system_prompt.clone()),
                ChatMessage::user(build_prompt(ctx, &sections)),
            ];
            let response = self.llm.chat(&self.model, messages).await?;
            debug!(
                worker = %self.name,
                input_tokens = response.input_tokens,
                output_tokens = response.output_tokens,
                "Completion received"
            );
            if response.text.trim().is_empty() {
                return Err(FinflowError::Worker {
                    node: self.name.clone(),
                    message: "model returned an empty completion".into(),
                });
            }
            Ok(WorkerResponse {
                content: response.text,
                used_tools: calls,
                facts: Default::default(),
            })
        })
    }
}

/// The user turn sent to the model: the request, shared facts, what other
/// workers have said so far and fresh tool results.
fn build_prompt(ctx: &ExecutionContext, tool_sections: &[String]) -> String {
    let mut prompt = format!("Request: {}\n", ctx.query());

    let mut facts: Vec<(&String, &serde_json::Value)> = ctx
        .scratch()
        .iter()
        .filter(|(k, _)| !k.ends_with("_status"))
        .collect();
    facts.sort_by(|a, b| a.0.cmp(b.0));
    if !facts.is_empty() {
        prompt.push_str("\nKnown facts:\n");
        for (k, v) in facts {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            prompt.push_str(&format!("- {}: {}\n", k, v));
        }
    }

    let findings: Vec<String> = ctx
        .history()
        .iter()
        .filter(|m| m.kind == MessageKind::WorkerOutput)
        .map(|m| format!("### {}\n{}", m.source, m.content))
        .collect();
    if !findings.is_empty() {
        prompt.push_str("\nFindings from other specialists:\n");
        prompt.push_str(&findings.join("\n\n"));
        prompt.push('\n');
    }

    if !tool_sections.is_empty() {
        prompt.push_str("\nTool results:\n");
        prompt.push_str(&tool_sections.join("\n\n"));
        prompt.push('\n');
    }
    prompt
}

/// A worker that answers with a rendered template.
pub struct StaticWorker {
    name: String,
    template: String,
}

impl StaticWorker {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }
}

impl Worker for StaticWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn respond<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<WorkerResponse>> {
        Box::pin(async move {
            let (text, _) = render(&self.template, ctx);
            Ok(WorkerResponse::text(text))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::types::{NodeId, RequestId};
    use finflow_test_utils::{test_model_config, MockLlmClient, MockTool};
    use finflow_tools::ToolRegistry;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(RequestId::new(), "rebalance my tech holdings");
        ctx.set_fact("sector", serde_json::json!("tech"));
        ctx.set_fact("portfolio_id", serde_json::json!(10));
        ctx
    }

    #[test]
    fn test_render_placeholders() {
        let (text, missing) = render("Q: {query} / {sector} / {nope} / {not a key}", &ctx());
        assert_eq!(
            text,
            "Q: rebalance my tech holdings / tech / {nope} / {not a key}"
        );
        assert_eq!(missing, vec!["nope"]);
        let (text, _) = render("unclosed {brace", &ctx());
        assert_eq!(text, "unclosed {brace");
    }

    #[test]
    fn test_render_args_keeps_types_and_drops_unresolved() {
        let args = serde_json::json!({
            "query": "{query}",
            "portfolio_id": "{portfolio_id}",
            "sector": "{sector}",
            "email": "{email}",
            "limit": 3
        });
        let rendered = render_args(&args, &ctx()).unwrap();
        assert_eq!(rendered["query"], "rebalance my tech holdings");
        assert_eq!(rendered["portfolio_id"], 10);
        assert_eq!(rendered["sector"], "tech");
        assert_eq!(rendered["limit"], 3);
        assert!(rendered.get("email").is_none());
        assert!(render_args(&serde_json::json!("{email}"), &ctx()).is_none());
    }

    #[tokio::test]
    async fn test_static_worker_renders() {
        let w = StaticWorker::new("Educator", "Lesson on: {query}. EDUCATOR_DONE");
        let r = w.respond(&ctx()).await.unwrap();
        assert_eq!(r.content, "Lesson on: rebalance my tech holdings. EDUCATOR_DONE");
    }

    #[tokio::test]
    async fn test_llm_worker_folds_tools_into_prompt() {
        let tool = MockTool::new("knowledge_search").with_response("tech is volatile");
        let inputs = tool.recorded_inputs();
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        let llm = Arc::new(MockLlmClient::new().with_text("Trim NVDA."));
        let worker = LlmWorker::new(
            "Market Analyst",
            "You analyse markets.",
            Arc::new(registry),
            llm.clone(),
            test_model_config(),
        )
        .with_tools(vec![ToolBinding {
            name: "knowledge_search".into(),
            args: serde_json::json!({"query": "{query}", "sector": "{sector}"}),
        }]);

        let mut ctx = ctx();
        ctx.record_output(
            &NodeId::from("researcher"),
            &WorkerResponse::text("rates are rising"),
            &[],
        );
        let r = worker.respond(&ctx).await.unwrap();
        assert_eq!(r.content, "Trim NVDA.");
        assert_eq!(r.used_tools.len(), 1);
        assert!(r.used_tools[0].succeeded);
        assert_eq!(inputs.lock().unwrap()[0]["sector"], "tech");

        let sent = llm.requests();
        let sent = sent.lock().unwrap();
        let user = &sent[0][1].content;
        assert!(user.contains("Request: rebalance my tech holdings"));
        assert!(user.contains("- sector: tech"));
        assert!(!user.contains("researcher_status"));
        assert!(user.contains("### researcher\nrates are rising"));
        assert!(user.contains("### knowledge_search\ntech is volatile"));
    }

    #[tokio::test]
    async fn test_llm_worker_survives_missing_tool() {
        let llm = Arc::new(MockLlmClient::new());
        let worker = LlmWorker::new(
            "Analyst",
            "sys",
            Arc::new(ToolRegistry::new()),
            llm.clone(),
            test_model_config(),
        )
        .with_tools(vec![ToolBinding {
            name: "market_data".into(),
            args: serde_json::json!({"ticker": "AAPL"}),
        }]);
        let r = worker.respond(&ctx()).await.unwrap();
        assert!(!r.used_tools[0].succeeded);
        let sent = llm.requests();
        let sent = sent.lock().unwrap();
        assert!(sent[0][1].content.contains("(unavailable: Tool not found: market_data)"));
    }

    #[tokio::test]
    async fn test_llm_error_propagates() {
        let llm = Arc::new(MockLlmClient::new().with_error("HTTP 500"));
        let worker = LlmWorker::new(
            "Analyst",
            "sys",
            Arc::new(ToolRegistry::new()),
            llm,
            test_model_config(),
        );
        assert!(worker.respond(&ctx()).await.is_err());
    }
}
