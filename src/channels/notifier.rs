//! Operator notification channel.
//!
//! Used for review escalations and delivery/credential failures. Callers
//! log notifier errors and move on; a notification is never retried.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::error::TransportError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Sends plain-text notifications to a human operator.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), TransportError>;
}

/// Fallback notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransportError> {
        info!(notification = %text, "Operator notification (no channel configured)");
        Ok(())
    }
}

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    bot_token: SecretString,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_api_base(config, TELEGRAM_API_BASE)
    }

    /// Use a different API host (tests).
    pub fn with_api_base(config: &TelegramConfig, api_base: &str) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    async fn send_chunk(&self, text: &str) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                platform: "telegram".into(),
                // reqwest errors embed the URL, which carries the bot token.
                reason: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = %status, "Telegram sendMessage failed");
            return Err(TransportError::Api {
                platform: "telegram".into(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OperatorNotifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransportError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(&chunk).await?;
        }
        Ok(())
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring
/// newline then space boundaries.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset just past the first `max_chars` characters.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}
