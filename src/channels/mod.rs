//! Platform I/O: transports, the adapter registry, account bindings and
//! the operator notification channel.
//!
//! Transports are pure I/O with no business logic. Deciding whether and
//! what to reply lives in the pipeline.

pub mod accounts;
pub mod graph;
pub mod notifier;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::error::TransportError;

pub use accounts::{AccountBinding, AccountDirectory, CredentialStore, StaticCredentialStore};
pub use graph::GraphTransport;
pub use notifier::{LogNotifier, OperatorNotifier, TelegramNotifier};
pub use registry::{AdapterRegistry, Outbound};

/// A conversation thread as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteConversation {
    pub id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One message inside a remote conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// I/O against one messaging platform.
#[async_trait]
pub trait PlatformTransport: Send + Sync {
    /// Platform name this transport serves, e.g. "facebook".
    fn platform(&self) -> &str;

    /// Most recently active conversations of an account.
    async fn list_conversations(
        &self,
        account_id: &str,
        credential: &SecretString,
        limit: usize,
    ) -> Result<Vec<RemoteConversation>, TransportError>;

    /// Recent messages of a conversation, newest first.
    async fn fetch_recent_messages(
        &self,
        credential: &SecretString,
        conversation_id: &str,
    ) -> Result<Vec<RemoteMessage>, TransportError>;

    /// Send a direct reply to `recipient_id`.
    async fn send_reply(
        &self,
        credential: &SecretString,
        recipient_id: &str,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Reply under a post or comment.
    async fn post_comment(
        &self,
        credential: &SecretString,
        object_id: &str,
        text: &str,
    ) -> Result<(), TransportError>;
}
