//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{Chat, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Adapter wrapping any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split a request into (preamble, history, final prompt).
///
/// System messages are joined into the preamble; the last user message is
/// the prompt and everything between becomes chat history.
pub(crate) fn split_request(
    messages: &[ChatMessage],
) -> Result<(String, Vec<ChatMessage>, String), String> {
    let preamble = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut turns: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    match turns.pop() {
        Some(last) if last.role == Role::User => Ok((preamble, turns, last.content)),
        Some(_) => Err("last message must come from the user".into()),
        None => Err("request has no user message".into()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) =
            split_request(&request.messages).map_err(|reason| LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason,
            })?;

        let mut builder = AgentBuilder::new(self.model.clone()).preamble(&preamble);
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        let agent = builder.build();

        let history: Vec<Message> = history
            .into_iter()
            .map(|m| match m.role {
                Role::Assistant => Message::assistant(m.content),
                _ => Message::user(m.content),
            })
            .collect();

        let content = agent
            .chat(prompt, history)
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        Ok(CompletionResponse {
            content,
            finish_reason: FinishReason::Stop,
        })
    }
}
