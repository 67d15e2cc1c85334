pub mod providers;
pub mod retry;

use std::sync::Arc;

use finflow_core::config::ModelConfig;
use finflow_core::traits::LlmClient;

pub use providers::{requires_api_key, OpenAiClient};
pub use retry::RetryingClient;

/// Create an LLM client for the configured provider. Every supported
/// provider speaks the OpenAI chat-completions protocol; a `[model.retry]`
/// section wraps the client in [`RetryingClient`].
pub fn create_client(config: &ModelConfig) -> Arc<dyn LlmClient> {
    let base: Box<dyn LlmClient> = Box::new(OpenAiClient::new());
    match &config.retry {
        Some(retry) => Arc::new(RetryingClient::new(base, retry.clone())),
        None => Arc::from(base),
    }
}
