//! Reply composition: canned replies, LLM generation and link gating.
//!
//! The promotional link goes out in at most one reply per customer. Whether
//! it was already sent is decided by scanning the customer's stored
//! successful replies, never by a separate counter. Callers hold the
//! customer's reply lock from `compose` until the outcome is stored.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ReplyConfig;
use crate::error::{LlmError, PipelineError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::classifier::KeywordSet;
use crate::pipeline::types::{ComposedReply, MessageKind, ReplySource};
use crate::store::{Conversation, Database};

/// Sampling temperature for generated replies.
const TEMPERATURE: f32 = 0.7;
/// Marker appended to truncated replies.
const ELLIPSIS: char = '…';

/// Canned reply with its compiled matcher.
struct CannedMatcher {
    category: String,
    keywords: KeywordSet,
    reply: String,
}

/// Builds the reply text for one conversation.
pub struct ReplyComposer {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    config: ReplyConfig,
    canned: Vec<CannedMatcher>,
}

impl ReplyComposer {
    pub fn new(db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>, config: ReplyConfig) -> Self {
        let canned = config
            .rules
            .canned_replies
            .iter()
            .map(|c| CannedMatcher {
                category: c.category.clone(),
                keywords: KeywordSet::new(&c.keywords),
                reply: c.reply.clone(),
            })
            .collect();
        Self {
            db,
            llm,
            config,
            canned,
        }
    }

    /// Compose a reply for `conversation`.
    ///
    /// Completion-backend failures surface as `PipelineError::Completion`;
    /// nothing is written, so the conversation stays not-replied.
    pub async fn compose(&self, conversation: &Conversation) -> Result<ComposedReply, PipelineError> {
        let customer_id = &conversation.customer_id;
        let prior_replies = self.db.successful_replies(customer_id).await?;
        let link_already_sent = self
            .config
            .promo_link
            .as_deref()
            .is_some_and(|link| prior_replies.iter().any(|r| r.contains(link)));

        let (body, source) = match self.canned_for(prior_replies.len(), &conversation.content) {
            Some(canned) => {
                debug!(
                    conversation = %conversation.id,
                    category = %canned.category,
                    "Using canned reply"
                );
                (
                    canned.reply.clone(),
                    ReplySource::Canned {
                        category: canned.category.clone(),
                    },
                )
            }
            None => (self.generate(conversation).await?, ReplySource::Generated),
        };

        let limit = match conversation.kind {
            MessageKind::Comment => self.config.comment_max_chars,
            MessageKind::Message | MessageKind::Ad => self.config.max_chars,
        };
        let link = self.config.promo_link.as_deref();
        let (text, includes_link) = finalize(&body, link, link_already_sent, limit);
        if text.trim().is_empty() {
            return Err(PipelineError::Completion(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "reply is empty after post-processing".into(),
            }));
        }

        info!(
            conversation = %conversation.id,
            customer = %customer_id,
            canned = matches!(source, ReplySource::Canned { .. }),
            includes_link,
            chars = text.chars().count(),
            "Reply composed"
        );
        Ok(ComposedReply {
            text,
            source,
            includes_link,
        })
    }

    /// First matching canned reply, while the customer is still within the
    /// canned-reply window.
    fn canned_for(&self, prior_reply_count: usize, text: &str) -> Option<&CannedMatcher> {
        if prior_reply_count >= self.config.rules.canned_reply_limit {
            return None;
        }
        self.canned.iter().find(|c| c.keywords.is_match(text))
    }

    async fn generate(&self, conversation: &Conversation) -> Result<String, PipelineError> {
        let history = self
            .db
            .recent_conversations(
                &conversation.customer_id,
                self.config.max_history_turns.saturating_add(1),
            )
            .await?;

        let mut messages = vec![ChatMessage::system(&self.config.system_prompt)];
        let prior: Vec<&Conversation> = history
            .iter()
            .filter(|c| c.id != conversation.id)
            .collect();
        let skip = prior.len().saturating_sub(self.config.max_history_turns);
        for turn in prior.into_iter().skip(skip) {
            messages.push(ChatMessage::user(&turn.content));
            if let Some(reply) = turn
                .reply_content
                .as_deref()
                .filter(|_| turn.replied && !turn.delivery_failed)
            {
                messages.push(ChatMessage::assistant(reply));
            }
        }
        messages.push(ChatMessage::user(&conversation.content));

        let request = CompletionRequest::new(messages)
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(TEMPERATURE);
        let response = self.llm.complete(request).await?;

        let content = response.content.trim().to_string();
        if content.is_empty() {
            return Err(PipelineError::Completion(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty completion".into(),
            }));
        }
        Ok(content)
    }
}

/// Apply link gating and the channel length limit.
///
/// Any copy of the link already in `body` is removed. The link is then
/// appended once, as `"\n\n" + link`, only if it has not been sent to this
/// customer before. The body is truncated so the result fits `limit`
/// characters including the link. Returns the text and whether the link
/// was appended.
pub fn finalize(body: &str, link: Option<&str>, already_sent: bool, limit: usize) -> (String, bool) {
    let Some(link) = link.filter(|l| !l.is_empty()) else {
        return (truncate_chars(body.trim(), limit), false);
    };

    let stripped = body.replace(link, "");
    let stripped = stripped.trim();
    let suffix = format!("\n\n{link}");
    let suffix_len = suffix.chars().count();

    if already_sent || suffix_len >= limit {
        return (truncate_chars(stripped, limit), false);
    }

    let mut text = truncate_chars(stripped, limit - suffix_len);
    text.push_str(&suffix);
    (text, true)
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out.push(ELLIPSIS);
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::llm::{CompletionResponse, FinishReason, Role};
    use crate::store::{LibSqlBackend, NewConversation};

    const LINK: &str = "https://example.com/apply";

    struct MockLlm {
        reply: Result<String, ()>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl MockLlm {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    content: text.clone(),
                    finish_reason: FinishReason::Stop,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "boom".into(),
                }),
            }
        }
    }

    fn config() -> ReplyConfig {
        ReplyConfig {
            promo_link: Some(LINK.to_string()),
            ..ReplyConfig::default()
        }
    }

    async fn setup() -> (Arc<LibSqlBackend>, String) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (customer, _) = db.upsert_customer("facebook", "u1", None).await.unwrap();
        (db, customer.id)
    }

    async fn inbound(db: &LibSqlBackend, customer_id: &str, mid: &str, content: &str) -> Conversation {
        db.insert_conversation_if_absent(&NewConversation {
            customer_id,
            platform: "facebook",
            platform_message_id: mid,
            account_id: "page",
            kind: MessageKind::Message,
            content,
            raw_payload: None,
            received_at: Utc::now(),
        })
        .await
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn first_reply_carries_link_exactly_once() {
        let (db, cid) = setup().await;
        let llm = Arc::new(MockLlm::replying("Sure, bring your phone in."));
        let composer = ReplyComposer::new(db.clone(), llm.clone(), config());

        let conv = inbound(&db, &cid, "m1", "iPhone 12, want to borrow 8000").await;
        let reply = composer.compose(&conv).await.unwrap();
        assert!(reply.includes_link);
        assert_eq!(reply.text.matches(LINK).count(), 1);
        assert!(reply.text.ends_with(&format!("\n\n{LINK}")));
        assert_eq!(reply.source, ReplySource::Generated);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn link_omitted_once_a_prior_reply_contains_it() {
        let (db, cid) = setup().await;
        let llm = Arc::new(MockLlm::replying(&format!("Apply here {LINK} today")));
        let composer = ReplyComposer::new(db.clone(), llm, config());

        let first = inbound(&db, &cid, "m1", "want to borrow 8000").await;
        let reply = composer.compose(&first).await.unwrap();
        db.mark_replied(&first.id, &reply.text, Utc::now()).await.unwrap();

        let second = inbound(&db, &cid, "m2", "and for an iPhone 13?").await;
        let reply = composer.compose(&second).await.unwrap();
        assert!(!reply.includes_link);
        assert!(!reply.text.contains(LINK));
    }

    #[tokio::test]
    async fn undelivered_reply_neither_spends_link_nor_enters_history() {
        let (db, cid) = setup().await;
        let llm = Arc::new(MockLlm::replying("Bring the phone by."));
        let mut cfg = config();
        cfg.rules.canned_replies.clear();
        let composer = ReplyComposer::new(db.clone(), llm.clone(), cfg);

        let first = inbound(&db, &cid, "m1", "want to borrow 8000").await;
        let reply = composer.compose(&first).await.unwrap();
        assert!(reply.includes_link);
        db.mark_replied(&first.id, &reply.text, Utc::now()).await.unwrap();
        db.mark_delivery_failed(&first.id).await.unwrap();

        let second = inbound(&db, &cid, "m2", "hello?").await;
        let reply = composer.compose(&second).await.unwrap();
        assert!(reply.includes_link);

        let requests = llm.requests.lock().unwrap();
        assert!(requests[1].messages.iter().all(|m| m.role != Role::Assistant));
    }

    #[tokio::test]
    async fn canned_reply_for_early_exchanges_only() {
        let (db, cid) = setup().await;
        let llm = Arc::new(MockLlm::replying("generated"));
        let composer = ReplyComposer::new(db.clone(), llm.clone(), config());

        for i in 0..3 {
            let conv = inbound(&db, &cid, &format!("m{i}"), "你好").await;
            let reply = composer.compose(&conv).await.unwrap();
            assert!(matches!(reply.source, ReplySource::Canned { ref category } if category == "greeting"));
            db.mark_replied(&conv.id, &reply.text, Utc::now()).await.unwrap();
        }
        assert_eq!(llm.calls(), 0);

        let conv = inbound(&db, &cid, "m3", "你好").await;
        let reply = composer.compose(&conv).await.unwrap();
        assert_eq!(reply.source, ReplySource::Generated);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn canned_reply_is_link_gated_too() {
        let (db, cid) = setup().await;
        let composer = ReplyComposer::new(db.clone(), Arc::new(MockLlm::replying("x")), config());

        let conv = inbound(&db, &cid, "m1", "hello").await;
        let reply = composer.compose(&conv).await.unwrap();
        assert!(reply.includes_link);
        db.mark_replied(&conv.id, &reply.text, Utc::now()).await.unwrap();

        let conv = inbound(&db, &cid, "m2", "hi again").await;
        let reply = composer.compose(&conv).await.unwrap();
        assert!(!reply.includes_link);
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_excludes_current() {
        let (db, cid) = setup().await;
        let llm = Arc::new(MockLlm::replying("ok"));
        let mut cfg = config();
        cfg.rules.canned_replies.clear();
        let composer = ReplyComposer::new(db.clone(), llm.clone(), cfg);

        let first = inbound(&db, &cid, "m1", "first question").await;
        db.mark_replied(&first.id, "first answer", Utc::now()).await.unwrap();
        let current = inbound(&db, &cid, "m2", "second question").await;
        composer.compose(&current).await.unwrap();

        let requests = llm.requests.lock().unwrap();
        let request = &requests[0];
        let turns: Vec<(Role, &str)> = request
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(turns[0].0, Role::System);
        assert_eq!(
            &turns[1..],
            &[
                (Role::User, "first question"),
                (Role::Assistant, "first answer"),
                (Role::User, "second question"),
            ]
        );
        assert_eq!(request.temperature, Some(TEMPERATURE));
        assert_eq!(request.max_tokens, Some(300));
    }

    #[tokio::test]
    async fn completion_failure_is_distinct_and_writes_nothing() {
        let (db, cid) = setup().await;
        let composer = ReplyComposer::new(db.clone(), Arc::new(MockLlm::failing()), config());

        let conv = inbound(&db, &cid, "m1", "iPhone 12, want to borrow 8000").await;
        let err = composer.compose(&conv).await.unwrap_err();
        assert!(err.is_completion_failure());

        let stored = db.get_conversation(&conv.id).await.unwrap().unwrap();
        assert!(!stored.replied);
    }

    #[test]
    fn finalize_truncates_body_but_keeps_link() {
        let body = "x".repeat(50);
        let (text, linked) = finalize(&body, Some("L"), false, 20);
        assert!(linked);
        assert_eq!(text.chars().count(), 20);
        assert!(text.ends_with("…\n\nL"));
    }

    #[test]
    fn finalize_strips_echoed_link_when_already_sent() {
        let (text, linked) = finalize("see https://a.b now", Some("https://a.b"), true, 100);
        assert!(!linked);
        assert_eq!(text, "see  now");
    }

    #[test]
    fn finalize_without_link_only_truncates() {
        let (text, linked) = finalize("hello world", None, false, 6);
        assert!(!linked);
        assert_eq!(text, "hello…");
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("您好您好您好", 4), "您好您…");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
