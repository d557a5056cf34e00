//! Persistence interface shared by the pipeline, gateway and statistics.
//!
//! The two cross-path coordination primitives live here and must be
//! implemented atomically by the backend (unique constraint + conditional
//! update, never read-then-write):
//! - `insert_conversation_if_absent` keyed by (platform, platform_message_id)
//! - `mark_replied`, the one-way not-replied → replied transition

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::MessageKind;

/// A customer, unique per (platform, platform_user_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Customer {
    pub id: String,
    pub platform: String,
    pub platform_user_id: String,
    /// Backfilled on first non-empty sighting, never overwritten.
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handling priority assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Low,
            1 => Self::Normal,
            _ => Self::High,
        }
    }
}

/// One inbound item plus its optional reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub customer_id: String,
    pub platform: String,
    pub platform_message_id: String,
    pub account_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub raw_payload: Option<String>,
    pub replied: bool,
    pub reply_content: Option<String>,
    pub reply_at: Option<DateTime<Utc>>,
    /// The claimed reply never reached the customer.
    pub delivery_failed: bool,
    pub filtered: bool,
    pub filter_reason: Option<String>,
    pub priority: Priority,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for `insert_conversation_if_absent`.
#[derive(Debug, Clone)]
pub struct NewConversation<'a> {
    pub customer_id: &'a str,
    pub platform: &'a str,
    pub platform_message_id: &'a str,
    pub account_id: &'a str,
    pub kind: MessageKind,
    pub content: &'a str,
    pub raw_payload: Option<&'a str>,
    pub received_at: DateTime<Utc>,
}

/// Result of the terminal reply transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call moved the conversation from not-replied to replied.
    Transitioned,
    /// Already replied; state left unchanged.
    AlreadyReplied,
}

/// Increments applied to a day's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub messages_received: i64,
    pub replies_sent: i64,
    pub canned_replies: i64,
    pub spam_filtered: i64,
    pub errors: i64,
}

/// Per-day counters with derived rate strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub messages_received: i64,
    pub replies_sent: i64,
    pub canned_replies: i64,
    pub spam_filtered: i64,
    pub errors: i64,
    /// e.g. "85.0%"
    pub reply_rate: String,
    pub spam_rate: String,
    pub updated_at: DateTime<Utc>,
}

/// Normalized-question frequency entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrequentQuestion {
    pub question_text: String,
    pub category: Option<String>,
    pub count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample_replies: Vec<String>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Customers ───────────────────────────────────────────────────

    /// Find-or-create on (platform, platform_user_id). Returns the row and
    /// whether this call created it.
    async fn upsert_customer(
        &self,
        platform: &str,
        platform_user_id: &str,
        name: Option<&str>,
    ) -> Result<(Customer, bool), DatabaseError>;

    /// Set the display name only if it is currently empty. Returns true if
    /// the name was written.
    async fn backfill_customer_name(&self, id: &str, name: &str) -> Result<bool, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Insert-or-return-existing keyed by (platform, platform_message_id).
    /// Returns the row and whether this call inserted it.
    async fn insert_conversation_if_absent(
        &self,
        new: &NewConversation<'_>,
    ) -> Result<(Conversation, bool), DatabaseError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError>;

    async fn get_conversation_by_platform_id(
        &self,
        platform: &str,
        platform_message_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Store the classifier verdict on a conversation.
    async fn set_classification(
        &self,
        id: &str,
        filtered: bool,
        reason: Option<&str>,
        priority: Priority,
    ) -> Result<(), DatabaseError>;

    /// Conditional not-replied → replied transition.
    async fn mark_replied(
        &self,
        id: &str,
        reply_content: &str,
        replied_at: DateTime<Utc>,
    ) -> Result<MarkOutcome, DatabaseError>;

    /// Record that the claimed reply was not delivered. The conversation
    /// stays replied, but its reply no longer counts as successful.
    async fn mark_delivery_failed(&self, id: &str) -> Result<(), DatabaseError>;

    /// A customer's most recent conversations, oldest first.
    async fn recent_conversations(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    /// Texts of a customer's delivered replies, oldest first.
    async fn successful_replies(&self, customer_id: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Statistics ──────────────────────────────────────────────────

    /// Add `delta` to the counters for `date`, creating the row if needed.
    async fn increment_daily_stats(
        &self,
        date: NaiveDate,
        delta: StatsDelta,
    ) -> Result<(), DatabaseError>;

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<Option<DailyStats>, DatabaseError>;

    /// Bump the count for a normalized question and keep a few sample replies.
    async fn record_question(
        &self,
        question_text: &str,
        category: Option<&str>,
        sample_reply: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Most frequently asked questions, highest count first.
    async fn top_questions(&self, limit: usize) -> Result<Vec<FrequentQuestion>, DatabaseError>;
}
