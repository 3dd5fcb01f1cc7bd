pub mod openai;
pub mod streaming;

use agentgraph_core::config::ModelConfig;
use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::LlmClient;

pub use openai::OpenAiClient;

/// Providers that speak the OpenAI chat completions protocol.
const OPENAI_COMPATIBLE: &[&str] = &[
    "openai", "ollama", "vllm", "groq", "together", "openrouter", "lmstudio", "deepseek",
];

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    let provider = config.provider.to_ascii_lowercase();
    if OPENAI_COMPATIBLE.contains(&provider.as_str()) || config.base_url.is_some() {
        Ok(Box::new(OpenAiClient::new()))
    } else {
        Err(AgentGraphError::Config(format!(
            "unsupported model provider '{}' (set base_url for OpenAI-compatible endpoints)",
            config.provider
        )))
    }
}
