use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use finflow_core::config::ModelConfig;
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::LlmClient;
use finflow_core::types::{ChatMessage, ChatResponse};

/// LLM client returning queued completions and recording every prompt.
#[derive(Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String>>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push_back(Ok(text.into()));
        }
        self
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push_back(Err(FinflowError::LlmRequest(message.into())));
        }
        self
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        self.requests.clone()
    }
}

impl LlmClient for MockLlmClient {
    fn chat(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        Box::pin(async move {
            if let Ok(mut reqs) = self.requests.lock() {
                reqs.push(messages);
            }
            let next = self
                .responses
                .lock()
                .ok()
                .and_then(|mut r| r.pop_front())
                .unwrap_or_else(|| Ok("mock completion".to_string()));
            next.map(|text| ChatResponse {
                text,
                input_tokens: 0,
                output_tokens: 0,
            })
        })
    }
}

pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "openai".into(),
        model_id: "test-model".into(),
        api_key: Some("sk-test".into()),
        base_url: None,
        max_tokens: 256,
        temperature: 0.0,
        retry: None,
    }
}
