//! LLM integration for auto-reply.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!(model = %config.model, "Using Anthropic completion backend");
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!(model = %config.model, "Using OpenAI completion backend");
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}
