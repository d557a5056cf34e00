//! Shared types for the reply pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Priority;

// ── Inbound message ─────────────────────────────────────────────────

/// What kind of platform item a message is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Direct message in an inbox thread.
    #[default]
    Message,
    /// Public comment on a post. Replies go back as a comment.
    Comment,
    /// Click-to-message from an ad.
    Ad,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Comment => "comment",
            Self::Ad => "ad",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "comment" => Ok(Self::Comment),
            "ad" => Ok(Self::Ad),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// Which path observed the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Webhook event.
    Push,
    /// Reconciliation sweep.
    Sweep,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Sweep => "sweep",
        }
    }
}

/// Normalized inbound record produced by platform adapters.
///
/// Webhook parsing and the sweep's message listing both produce this, so
/// the pipeline never sees platform-native payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform name, e.g. "facebook" or "instagram".
    pub platform: String,
    /// Platform-assigned message id. The dedup anchor.
    pub platform_message_id: String,
    /// Platform-scoped id of the customer.
    pub sender_id: String,
    pub sender_name: Option<String>,
    /// The business account (page) that received the message.
    pub account_id: String,
    pub content: String,
    pub kind: MessageKind,
    /// For comments, the id replies are posted under.
    pub thread_ref: Option<String>,
    pub timestamp_ms: i64,
    pub raw_payload: serde_json::Value,
}

impl InboundMessage {
    /// Message timestamp, or now if the platform gave a bogus value.
    pub fn received_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_else(Utc::now)
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Classifier verdict for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub is_spam: bool,
    /// Business intent found; the message must be answered.
    pub must_answer: bool,
    pub priority: Priority,
    /// Short machine reason, stored as the conversation's filter reason.
    pub reason: Option<String>,
    /// Ambiguous verdict worth a human look.
    pub needs_review: bool,
}

// ── Composed reply ──────────────────────────────────────────────────

/// Where reply text came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ReplySource {
    Canned { category: String },
    Generated,
}

/// Final, post-processed reply ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedReply {
    pub text: String,
    pub source: ReplySource,
    /// The promotional link was appended to this reply.
    pub includes_link: bool,
}

// ── Report flags ────────────────────────────────────────────────────

/// Report flags raised by stages.
pub mod flags {
    pub const SPAM: &str = "spam";
    pub const REVIEW: &str = "review";
    pub const DUPLICATE: &str = "duplicate";
    pub const AUTO_REPLY_DISABLED: &str = "auto_reply_disabled";
    pub const COMPLETION_FAILED: &str = "completion_failed";
    pub const DELIVERY_FAILED: &str = "delivery_failed";
    pub const REPLIED: &str = "replied";
}
