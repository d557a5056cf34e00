//! Human-review escalation over the operator notification channel.

use std::sync::Arc;

use tracing::{info, warn};

use crate::channels::OperatorNotifier;
use crate::error::TransportError;
use crate::pipeline::types::InboundMessage;
use crate::store::{Conversation, Customer};

/// Characters of customer content quoted in a notification.
const EXCERPT_CHARS: usize = 200;

/// Why an operator is being pulled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationReason {
    /// Classifier flagged the message as ambiguous.
    Review { detail: String },
    /// Reply generation failed; the message is still unanswered.
    CompletionFailed { error: String },
    /// A reply was claimed but could not be delivered.
    DeliveryFailed { error: String },
}

impl EscalationReason {
    fn headline(&self) -> &'static str {
        match self {
            Self::Review { .. } => "Needs review",
            Self::CompletionFailed { .. } => "Reply generation failed",
            Self::DeliveryFailed { .. } => "Reply delivery failed",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::Review { detail } => detail,
            Self::CompletionFailed { error } | Self::DeliveryFailed { error } => error,
        }
    }
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(EXCERPT_CHARS).collect();
    if text.chars().count() > EXCERPT_CHARS {
        out.push('…');
    }
    out
}

/// Build the operator-facing notification text.
pub fn format_escalation(
    reason: &EscalationReason,
    message: &InboundMessage,
    customer: Option<&Customer>,
    conversation: Option<&Conversation>,
) -> String {
    let name = customer
        .and_then(|c| c.name.as_deref())
        .or(message.sender_name.as_deref())
        .unwrap_or("(unknown)");

    let mut lines = vec![
        format!("[{}] {}", message.platform, reason.headline()),
        format!("Customer: {name} ({})", message.sender_id),
        format!("Account: {}", message.account_id),
        format!("Kind: {}", message.kind),
    ];
    if let Some(customer) = customer {
        lines.push(format!("Customer id: {}", customer.id));
    }
    if let Some(conversation) = conversation {
        lines.push(format!("Conversation id: {}", conversation.id));
    }
    lines.push(format!("Reason: {}", reason.detail()));
    lines.push(String::new());
    lines.push(format!("\"{}\"", excerpt(&message.content)));
    lines.push(String::new());
    lines.push(format!(
        "Actions: reply manually in the {} inbox for account {}; the message stays {} until then.",
        message.platform,
        message.account_id,
        match reason {
            EscalationReason::DeliveryFailed { .. } => "marked replied but undelivered",
            _ => "unanswered",
        }
    ));
    lines.join("\n")
}

/// Build the notification for an account the sweep could not scan.
pub fn format_account_failure(platform: &str, account_id: &str, error: &TransportError) -> String {
    [
        format!("[{platform}] Account credential failure"),
        format!("Account: {account_id}"),
        format!("Reason: {error}"),
        String::new(),
        format!(
            "Actions: renew the access token for account {account_id}; its unanswered messages are not swept until then."
        ),
    ]
    .join("\n")
}

/// Sends escalations; failures are logged only.
#[derive(Clone)]
pub struct Escalator {
    notifier: Arc<dyn OperatorNotifier>,
}

impl Escalator {
    pub fn new(notifier: Arc<dyn OperatorNotifier>) -> Self {
        Self { notifier }
    }

    pub async fn escalate(
        &self,
        reason: EscalationReason,
        message: &InboundMessage,
        customer: Option<&Customer>,
        conversation: Option<&Conversation>,
    ) {
        let text = format_escalation(&reason, message, customer, conversation);
        match self.notifier.notify(&text).await {
            Ok(()) => info!(
                mid = %message.platform_message_id,
                reason = reason.headline(),
                "Escalated to operator"
            ),
            Err(e) => warn!(
                mid = %message.platform_message_id,
                error = %e,
                "Failed to send escalation"
            ),
        }
    }

    /// Tell the operator an account could not be scanned.
    pub async fn account_failure(&self, platform: &str, account_id: &str, error: &TransportError) {
        let text = format_account_failure(platform, account_id, error);
        match self.notifier.notify(&text).await {
            Ok(()) => info!(account = account_id, "Account failure reported to operator"),
            Err(e) => warn!(account = account_id, error = %e, "Failed to report account failure"),
        }
    }
}
