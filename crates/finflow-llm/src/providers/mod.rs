pub mod openai;

pub use openai::{requires_api_key, OpenAiClient};
