//! Conversation gateway: the idempotency boundary shared by push and sweep.
//!
//! Both paths resolve customers, record inbound items and claim the reply
//! transition through this type, so they cannot disagree on what has been
//! answered. Concurrent writers that lose a race get the winner's row back.
//!
//! Replies to one customer are serialized with a per-customer lock held
//! from composition until the delivery outcome is stored, so two messages
//! from the same customer cannot both decide the promotional link is unsent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::{DatabaseError, PipelineError, ValidationError};
use crate::pipeline::types::InboundMessage;
use crate::store::{Conversation, Customer, Database, MarkOutcome, NewConversation};

type ReplyLockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Held while a reply to one customer is composed and delivered.
pub type ReplyGuard = OwnedMutexGuard<()>;

/// Single source of truth for customer and conversation identity.
#[derive(Clone)]
pub struct ConversationGateway {
    db: Arc<dyn Database>,
    reply_locks: ReplyLockMap,
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

impl ConversationGateway {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            reply_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Find-or-create the customer; backfill the name only if it is empty.
    pub async fn resolve_customer(
        &self,
        platform: &str,
        platform_user_id: &str,
        name: Option<&str>,
    ) -> Result<Customer, PipelineError> {
        require("platform", platform)?;
        require("sender_id", platform_user_id)?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        let (mut customer, created) =
            match self.db.upsert_customer(platform, platform_user_id, name).await {
                Err(DatabaseError::Conflict { .. }) => {
                    // Lost a race to a concurrent writer; its row is there now.
                    self.db.upsert_customer(platform, platform_user_id, name).await?
                }
                other => other?,
            };

        if created {
            info!(customer = %customer.id, platform, user = platform_user_id, "New customer");
        } else if customer.name.is_none()
            && let Some(name) = name
            && self.db.backfill_customer_name(&customer.id, name).await?
        {
            debug!(customer = %customer.id, name, "Customer name backfilled");
            customer.name = Some(name.to_string());
        }
        Ok(customer)
    }

    /// Insert-or-return-existing keyed by (platform, platform_message_id).
    ///
    /// Returns the conversation and whether this call created it. A caller
    /// that did not create it must not treat the message as new.
    pub async fn record_inbound(
        &self,
        message: &InboundMessage,
        customer_id: &str,
    ) -> Result<(Conversation, bool), PipelineError> {
        require("platform", &message.platform)?;
        require("platform_message_id", &message.platform_message_id)?;
        require("customer_id", customer_id)?;

        let raw = if message.raw_payload.is_null() {
            None
        } else {
            Some(message.raw_payload.to_string())
        };
        let new = NewConversation {
            customer_id,
            platform: &message.platform,
            platform_message_id: &message.platform_message_id,
            account_id: &message.account_id,
            kind: message.kind,
            content: &message.content,
            raw_payload: raw.as_deref(),
            received_at: message.received_at(),
        };

        let (conversation, created) = match self.db.insert_conversation_if_absent(&new).await {
            Err(DatabaseError::Conflict { .. }) => self.db.insert_conversation_if_absent(&new).await?,
            other => other?,
        };
        debug!(
            conversation = %conversation.id,
            mid = %message.platform_message_id,
            created,
            replied = conversation.replied,
            "Inbound recorded"
        );
        Ok((conversation, created))
    }

    /// Claim the one-way not-replied → replied transition.
    ///
    /// A conversation that is already replied is a no-op success
    /// (`MarkOutcome::AlreadyReplied`), not an error.
    pub async fn mark_replied(
        &self,
        conversation_id: &str,
        reply_content: &str,
    ) -> Result<MarkOutcome, PipelineError> {
        require("conversation_id", conversation_id)?;
        let outcome = self
            .db
            .mark_replied(conversation_id, reply_content, Utc::now())
            .await?;
        debug!(conversation = conversation_id, ?outcome, "Reply transition");
        Ok(outcome)
    }

    /// Record that a claimed reply was not delivered. It stops counting
    /// toward the customer's successful replies.
    pub async fn mark_delivery_failed(&self, conversation_id: &str) -> Result<(), PipelineError> {
        require("conversation_id", conversation_id)?;
        self.db.mark_delivery_failed(conversation_id).await?;
        Ok(())
    }

    /// Wait for exclusive reply rights for `customer_id`.
    pub async fn lock_customer(&self, customer_id: &str) -> ReplyGuard {
        let lock = {
            let mut locks = self.reply_locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(customer_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::types::MessageKind;
    use crate::store::LibSqlBackend;

    async fn gateway() -> ConversationGateway {
        ConversationGateway::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()))
    }

    fn message(mid: &str) -> InboundMessage {
        InboundMessage {
            platform: "facebook".into(),
            platform_message_id: mid.into(),
            sender_id: "u1".into(),
            sender_name: None,
            account_id: "page".into(),
            content: "how much for an iPhone 12?".into(),
            kind: MessageKind::Message,
            thread_ref: None,
            timestamp_ms: 1_700_000_000_000,
            raw_payload: serde_json::json!({"mid": mid}),
        }
    }

    #[tokio::test]
    async fn resolve_customer_backfills_missing_name_once() {
        let gw = gateway().await;
        let first = gw.resolve_customer("facebook", "u1", None).await.unwrap();
        assert!(first.name.is_none());

        let second = gw.resolve_customer("facebook", "u1", Some("Chen")).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.name.as_deref(), Some("Chen"));

        let third = gw.resolve_customer("facebook", "u1", Some("Other")).await.unwrap();
        assert_eq!(third.name.as_deref(), Some("Chen"));
    }

    #[tokio::test]
    async fn resolve_customer_rejects_blank_ids() {
        let gw = gateway().await;
        let err = gw.resolve_customer("facebook", " ", None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation(ValidationError::MissingField("sender_id"))
        ));
    }

    #[tokio::test]
    async fn both_paths_see_the_same_conversation() {
        let gw = gateway().await;
        let customer = gw.resolve_customer("facebook", "u1", None).await.unwrap();

        let (push, push_created) = gw.record_inbound(&message("abc123"), &customer.id).await.unwrap();
        let (sweep, sweep_created) = gw.record_inbound(&message("abc123"), &customer.id).await.unwrap();
        assert!(push_created);
        assert!(!sweep_created);
        assert_eq!(push.id, sweep.id);
        assert_eq!(push.raw_payload.as_deref(), Some(r#"{"mid":"abc123"}"#));

        let first = gw.mark_replied(&push.id, "reply").await.unwrap();
        let second = gw.mark_replied(&sweep.id, "reply").await.unwrap();
        assert_eq!(first, MarkOutcome::Transitioned);
        assert_eq!(second, MarkOutcome::AlreadyReplied);
    }

    #[tokio::test]
    async fn record_inbound_requires_message_id() {
        let gw = gateway().await;
        let customer = gw.resolve_customer("facebook", "u1", None).await.unwrap();
        let err = gw.record_inbound(&message(""), &customer.id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation(ValidationError::MissingField("platform_message_id"))
        ));
    }

    #[tokio::test]
    async fn customer_lock_serializes_same_customer_only() {
        let gw = gateway().await;
        let held = gw.lock_customer("c1").await;

        let other = tokio::time::timeout(Duration::from_millis(100), gw.lock_customer("c2")).await;
        assert!(other.is_ok());

        let waiting = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.lock_customer("c1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }
}
