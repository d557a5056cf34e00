//! Graph-style page messaging API client.
//!
//! Covers what the service needs from a page inbox: list conversations,
//! read recent messages, send a reply with `messaging_type=RESPONSE`, and
//! reply under a comment. No retries here; the sweep counts failures and
//! the next sweep tries again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::channels::{PlatformTransport, RemoteConversation, RemoteMessage};
use crate::error::TransportError;

pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_API_VERSION: &str = "v19.0";

/// Messages fetched per conversation during a sweep.
const RECENT_MESSAGE_LIMIT: usize = 5;

/// Graph error codes that mean "slow down".
const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613];

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ConversationEntry {
    id: String,
    updated_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageEntry {
    id: String,
    #[serde(default)]
    message: String,
    from: Option<Sender>,
    created_time: String,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    code: Option<i64>,
}

/// Parse a Graph timestamp (`2024-05-01T12:00:00+0000`, or RFC 3339).
pub fn parse_graph_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// `PlatformTransport` over the Graph API.
pub struct GraphTransport {
    platform: String,
    base_url: String,
    api_version: String,
    client: reqwest::Client,
}

impl GraphTransport {
    pub fn new(platform: &str) -> Self {
        Self::with_base_url(platform, DEFAULT_BASE_URL)
    }

    /// Point the client at another host (tests, proxies).
    pub fn with_base_url(platform: &str, base_url: &str) -> Self {
        Self {
            platform: platform.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.api_version)
    }

    fn request_error(&self, e: reqwest::Error) -> TransportError {
        TransportError::Request {
            platform: self.platform.clone(),
            // The URL carries the access token.
            reason: e.without_url().to_string(),
        }
    }

    /// Map a non-success response to a transport error.
    async fn error_from(&self, response: reqwest::Response) -> TransportError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let graph = serde_json::from_str::<ErrorEnvelope>(&body).ok().map(|e| e.error);

        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || graph
                .as_ref()
                .and_then(|g| g.code)
                .is_some_and(|code| RATE_LIMIT_CODES.contains(&code));
        if rate_limited {
            return TransportError::RateLimited {
                platform: self.platform.clone(),
                retry_after,
            };
        }

        let message = match graph {
            Some(g) if !g.message.is_empty() => g.message,
            _ => body.chars().take(200).collect(),
        };
        TransportError::Api {
            platform: self.platform.clone(),
            status: status.as_u16(),
            message,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        credential: &SecretString,
        query: &[(&str, String)],
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("access_token", credential.expose_secret())])
            .query(query)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Malformed {
                platform: self.platform.clone(),
                reason: e.to_string(),
            })
    }

    async fn post_json(
        &self,
        path: &str,
        credential: &SecretString,
        body: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url(path))
            .query(&[("access_token", credential.expose_secret())])
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformTransport for GraphTransport {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn list_conversations(
        &self,
        account_id: &str,
        credential: &SecretString,
        limit: usize,
    ) -> Result<Vec<RemoteConversation>, TransportError> {
        let mut query = vec![
            ("fields", "id,updated_time".to_string()),
            ("limit", limit.to_string()),
        ];
        if self.platform == "instagram" {
            query.push(("platform", "instagram".to_string()));
        }
        let page: Page<ConversationEntry> = self
            .get_json(&format!("{account_id}/conversations"), credential, &query)
            .await?;

        debug!(
            platform = %self.platform,
            account = account_id,
            count = page.data.len(),
            "Listed conversations"
        );
        Ok(page
            .data
            .into_iter()
            .map(|c| RemoteConversation {
                updated_at: c.updated_time.as_deref().and_then(parse_graph_time),
                id: c.id,
            })
            .collect())
    }

    async fn fetch_recent_messages(
        &self,
        credential: &SecretString,
        conversation_id: &str,
    ) -> Result<Vec<RemoteMessage>, TransportError> {
        let query = [
            ("fields", "id,message,from,created_time".to_string()),
            ("limit", RECENT_MESSAGE_LIMIT.to_string()),
        ];
        let page: Page<MessageEntry> = self
            .get_json(&format!("{conversation_id}/messages"), credential, &query)
            .await?;

        page.data
            .into_iter()
            .map(|m| {
                let created_at = parse_graph_time(&m.created_time).ok_or_else(|| {
                    TransportError::Malformed {
                        platform: self.platform.clone(),
                        reason: format!("bad created_time '{}'", m.created_time),
                    }
                })?;
                let sender = m.from.ok_or_else(|| TransportError::Malformed {
                    platform: self.platform.clone(),
                    reason: format!("message {} has no sender", m.id),
                })?;
                Ok(RemoteMessage {
                    id: m.id,
                    sender_id: sender.id,
                    sender_name: sender.name,
                    text: m.message,
                    created_at,
                })
            })
            .collect()
    }

    async fn send_reply(
        &self,
        credential: &SecretString,
        recipient_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "recipient": { "id": recipient_id },
            "message": { "text": text },
            "messaging_type": "RESPONSE",
        });
        self.post_json("me/messages", credential, &body).await?;
        debug!(platform = %self.platform, recipient = recipient_id, "Reply sent");
        Ok(())
    }

    async fn post_comment(
        &self,
        credential: &SecretString,
        object_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        let edge = if self.platform == "instagram" {
            "replies"
        } else {
            "comments"
        };
        let body = serde_json::json!({ "message": text });
        self.post_json(&format!("{object_id}/{edge}"), credential, &body)
            .await?;
        debug!(platform = %self.platform, object = object_id, "Comment reply posted");
        Ok(())
    }
}
