//! Push ingress: the platform webhook.
//!
//! `GET /webhook` answers the subscription handshake, `POST /webhook`
//! accepts page events, `GET /health` is a liveness probe and `GET /stats`
//! returns today's counters with the most asked questions. Each normalized
//! event runs through the reply pipeline in its own task; the HTTP response
//! never waits for a reply.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::AccountDirectory;
use crate::pipeline::{InboundMessage, MessageKind, Pipeline, PipelineReport, Trigger};
use crate::stats::StatsRecorder;

/// Questions listed by `GET /stats`.
const TOP_QUESTIONS: usize = 10;

/// Shared state for webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub pipeline: Arc<Pipeline>,
    pub accounts: Arc<AccountDirectory>,
    pub verify_token: Option<String>,
}

impl WebhookState {
    /// Drop events the push path must not handle, then start one pipeline
    /// run per remaining event.
    pub fn dispatch(&self, events: Vec<InboundMessage>) -> Vec<JoinHandle<PipelineReport>> {
        events
            .into_iter()
            .filter(|event| {
                let enabled = self.accounts.push_enabled(&event.account_id);
                if !enabled {
                    debug!(account = %event.account_id, mid = %event.platform_message_id, "Push disabled for account, dropping event");
                }
                enabled
            })
            .map(|event| {
                let pipeline = Arc::clone(&self.pipeline);
                tokio::spawn(async move { pipeline.run(Trigger::Push, event).await })
            })
            .collect()
    }
}

/// Platform name for a webhook `object` value.
fn platform_for_object(object: &str) -> &str {
    match object {
        "page" => "facebook",
        other => other,
    }
}

fn str_at<'v>(value: &'v Value, pointer: &str) -> Option<&'v str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Normalize a webhook body into inbound messages.
///
/// Understands inbox messaging entries (plain and ad referrals), page feed
/// comments and Instagram comments. Echoes of the account's own messages
/// and everything else are dropped.
pub fn parse_events(payload: &Value) -> Vec<InboundMessage> {
    let platform = platform_for_object(str_at(payload, "/object").unwrap_or_default()).to_string();
    let mut events = Vec::new();

    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for entry in entries {
        let Some(account_id) = str_at(entry, "/id") else {
            continue;
        };

        for event in entry
            .get("messaging")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(msg) = parse_messaging(&platform, account_id, event) {
                events.push(msg);
            }
        }

        for change in entry
            .get("changes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(msg) = parse_change(&platform, account_id, change) {
                events.push(msg);
            }
        }
    }
    events
}

fn parse_messaging(platform: &str, account_id: &str, event: &Value) -> Option<InboundMessage> {
    let message = event.get("message")?;
    if message.get("is_echo").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let sender_id = str_at(event, "/sender/id")?;
    let kind = if message.get("referral").is_some() || event.get("referral").is_some() {
        MessageKind::Ad
    } else {
        MessageKind::Message
    };

    Some(InboundMessage {
        platform: platform.to_string(),
        platform_message_id: str_at(message, "/mid")?.to_string(),
        sender_id: sender_id.to_string(),
        sender_name: None,
        account_id: str_at(event, "/recipient/id").unwrap_or(account_id).to_string(),
        content: str_at(message, "/text").unwrap_or_default().to_string(),
        kind,
        thread_ref: None,
        timestamp_ms: event
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| Utc::now().timestamp_millis()),
        raw_payload: event.clone(),
    })
}

fn parse_change(platform: &str, account_id: &str, change: &Value) -> Option<InboundMessage> {
    let value = change.get("value")?;
    match str_at(change, "/field")? {
        // Facebook page feed: only newly added comments.
        "feed" => {
            if str_at(value, "/item") != Some("comment") || str_at(value, "/verb") != Some("add") {
                return None;
            }
            let comment_id = str_at(value, "/comment_id")?;
            Some(InboundMessage {
                platform: platform.to_string(),
                platform_message_id: comment_id.to_string(),
                sender_id: str_at(value, "/from/id")?.to_string(),
                sender_name: str_at(value, "/from/name").map(str::to_string),
                account_id: account_id.to_string(),
                content: str_at(value, "/message").unwrap_or_default().to_string(),
                kind: MessageKind::Comment,
                thread_ref: Some(comment_id.to_string()),
                timestamp_ms: value
                    .get("created_time")
                    .and_then(Value::as_i64)
                    .map(|secs| secs * 1000)
                    .unwrap_or_else(|| Utc::now().timestamp_millis()),
                raw_payload: value.clone(),
            })
        }
        "comments" => {
            let comment_id = str_at(value, "/id")?;
            Some(InboundMessage {
                platform: platform.to_string(),
                platform_message_id: comment_id.to_string(),
                sender_id: str_at(value, "/from/id")?.to_string(),
                sender_name: str_at(value, "/from/username").map(str::to_string),
                account_id: account_id.to_string(),
                content: str_at(value, "/text").unwrap_or_default().to_string(),
                kind: MessageKind::Comment,
                thread_ref: Some(comment_id.to_string()),
                timestamp_ms: Utc::now().timestamp_millis(),
                raw_payload: value.clone(),
            })
        }
        _ => None,
    }
}

/// GET /webhook
///
/// Subscription handshake: echo `hub.challenge` when the verify token
/// matches.
async fn verify(
    State(state): State<WebhookState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge");

    match (mode, token, challenge, state.verify_token.as_ref()) {
        (Some("subscribe"), Some(token), Some(challenge), Some(expected)) if token == expected => {
            info!("Webhook subscription verified");
            (StatusCode::OK, challenge.clone()).into_response()
        }
        _ => {
            warn!("Webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// POST /webhook
async fn receive(State(state): State<WebhookState>, Json(payload): Json<Value>) -> impl IntoResponse {
    let events = parse_events(&payload);
    debug!(events = events.len(), "Webhook received");
    state.dispatch(events);
    (StatusCode::OK, "EVENT_RECEIVED")
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// GET /stats
async fn stats(State(recorder): State<StatsRecorder>) -> impl IntoResponse {
    match recorder.snapshot(TOP_QUESTIONS).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read statistics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Build the statistics route.
pub fn stats_routes(recorder: StatsRecorder) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .with_state(recorder)
}

/// Build the webhook routes.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(verify).post(receive))
        .route("/health", get(health))
        .with_state(state)
}
