use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use finflow_core::config::ModelConfig;
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::LlmClient;
use finflow_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Chat-completions endpoints for the providers known by name.
fn provider_endpoint(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some(OPENAI_API_URL),
        "ollama" => Some("http://localhost:11434/v1/chat/completions"),
        "groq" => Some("https://api.groq.com/openai/v1/chat/completions"),
        "openrouter" => Some("https://openrouter.ai/api/v1/chat/completions"),
        _ => None,
    }
}

/// Whether requests to `provider` must carry an API key. Ollama runs locally
/// without one.
pub fn requires_api_key(provider: &str) -> bool {
    provider != "ollama"
}

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|m| OaiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content,
        })
        .collect()
}

/// Endpoint for a config: explicit base_url, then the named provider,
/// then OpenAI.
pub fn resolve_endpoint(config: &ModelConfig) -> String {
    if let Some(url) = &config.base_url {
        return url.clone();
    }
    provider_endpoint(&config.provider)
        .unwrap_or(OPENAI_API_URL)
        .to_string()
}

fn parse_completion(body: &str) -> Result<ChatResponse> {
    let completion: ChatCompletion =
        serde_json::from_str(body).map_err(|e| FinflowError::LlmParse(e.to_string()))?;
    let text = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| FinflowError::LlmParse("completion has no content".into()))?;
    let (input_tokens, output_tokens) = completion
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();
    Ok(ChatResponse {
        text,
        input_tokens,
        output_tokens,
    })
}

impl LlmClient for OpenAiClient {
    fn chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        let config = config.clone();

        Box::pin(async move {
            let url = resolve_endpoint(&config);

            // o-series models reject temperature
            let is_o_series = config.model_id.starts_with("o1")
                || config.model_id.starts_with("o3")
                || config.model_id.starts_with("o4");

            let body = ChatRequest {
                model: &config.model_id,
                messages: convert_messages(messages),
                max_tokens: config.max_tokens,
                temperature: if is_o_series || config.temperature <= 0.0 {
                    None
                } else {
                    Some(config.temperature)
                },
                stream: false,
            };

            let mut req = self.http.post(&url).json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            if config.provider == "openrouter" {
                req = req.header("X-Title", "finflow");
            }

            let response = req
                .send()
                .await
                .map_err(|e| FinflowError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| FinflowError::LlmRequest(e.to_string()))?;
            if !status.is_success() {
                return Err(FinflowError::LlmRequest(format!("HTTP {}: {}", status, text)));
            }

            let parsed = parse_completion(&text)?;
            debug!(
                model = %config.model_id,
                input_tokens = parsed.input_tokens,
                output_tokens = parsed.output_tokens,
                "LLM completion"
            );
            Ok(parsed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, base_url: Option<&str>) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            model_id: "gpt-4o-mini".into(),
            api_key: None,
            base_url: base_url.map(String::from),
            max_tokens: 512,
            temperature: 0.2,
            retry: None,
        }
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(resolve_endpoint(&config("openai", None)), OPENAI_API_URL);
        assert_eq!(
            resolve_endpoint(&config("ollama", None)),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint(&config("ollama", Some("http://gpu-box:8000/v1/chat/completions"))),
            "http://gpu-box:8000/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint(&config("groq", None)),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(resolve_endpoint(&config("unknown", None)), OPENAI_API_URL);
    }

    #[test]
    fn test_only_local_providers_skip_the_key() {
        assert!(!requires_api_key("ollama"));
        assert!(requires_api_key("openai"));
        assert!(requires_api_key("openrouter"));
    }

    #[test]
    fn test_parse_completion() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Diversify."}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let r = parse_completion(body).unwrap();
        assert_eq!(r.text, "Diversify.");
        assert_eq!(r.input_tokens, 12);
        assert_eq!(r.output_tokens, 3);
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let err = parse_completion(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, FinflowError::LlmParse(_)));
        assert!(parse_completion("not json").is_err());
    }

    #[test]
    fn test_message_roles() {
        let msgs = convert_messages(vec![
            ChatMessage::system("s"),
            ChatMessage::user("u"),
            ChatMessage::assistant("a"),
        ]);
        let roles: Vec<&str> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }
}
