//! End-to-end tests for the reply pipeline across the push and sweep paths.
//!
//! Everything runs against an in-memory store with a scripted transport,
//! a canned LLM and a recording operator channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};

use auto_reply::channels::{
    AccountBinding, AccountDirectory, AdapterRegistry, OperatorNotifier, Outbound,
    PlatformTransport, RemoteConversation, RemoteMessage,
};
use auto_reply::config::{ReplyConfig, SweepConfig};
use auto_reply::error::{LlmError, TransportError};
use auto_reply::escalation::Escalator;
use auto_reply::gateway::ConversationGateway;
use auto_reply::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use auto_reply::pipeline::classifier::IntentClassifier;
use auto_reply::pipeline::composer::ReplyComposer;
use auto_reply::pipeline::types::flags;
use auto_reply::pipeline::{
    InboundMessage, MessageKind, Pipeline, Reconciler, ReplyServices, Trigger,
    build_reply_pipeline,
};
use auto_reply::stats::StatsRecorder;
use auto_reply::store::{Database, LibSqlBackend};
use auto_reply::webhook::{WebhookState, parse_events};

const LINK: &str = "https://example.com/apply";
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Fakes ───────────────────────────────────────────────────────────

/// LLM that always answers with the same text, or always fails.
struct StubLlm {
    fail: bool,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if self.fail {
            return Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "backend down".into(),
            });
        }
        Ok(CompletionResponse {
            content: "Bring your phone to the shop and we will quote you on the spot.".into(),
            finish_reason: FinishReason::Stop,
        })
    }
}

#[derive(Debug, Clone)]
struct Sent {
    recipient: String,
    text: String,
}

/// Scripted platform: fixed inbox per account, records every send.
#[derive(Default)]
struct FakeTransport {
    /// account id → conversation id → messages (newest first)
    inbox: Mutex<HashMap<String, Vec<(String, Vec<RemoteMessage>)>>>,
    sent: Mutex<Vec<Sent>>,
    comments: Mutex<Vec<Sent>>,
    fail_sends: AtomicBool,
}

impl FakeTransport {
    fn add_message(&self, account: &str, conversation: &str, message: RemoteMessage) {
        let mut inbox = self.inbox.lock().unwrap();
        let conversations = inbox.entry(account.to_string()).or_default();
        match conversations.iter_mut().find(|(id, _)| id == conversation) {
            Some((_, messages)) => messages.insert(0, message),
            None => conversations.push((conversation.to_string(), vec![message])),
        }
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

fn expired(credential: &SecretString) -> bool {
    credential.expose_secret() == "expired"
}

fn auth_error() -> TransportError {
    TransportError::Api {
        platform: "facebook".into(),
        status: 401,
        message: "Error validating access token".into(),
    }
}

#[async_trait]
impl PlatformTransport for FakeTransport {
    fn platform(&self) -> &str {
        "facebook"
    }

    async fn list_conversations(
        &self,
        account_id: &str,
        credential: &SecretString,
        limit: usize,
    ) -> Result<Vec<RemoteConversation>, TransportError> {
        if expired(credential) {
            return Err(auth_error());
        }
        let inbox = self.inbox.lock().unwrap();
        Ok(inbox
            .get(account_id)
            .map(|convs| {
                convs
                    .iter()
                    .take(limit)
                    .map(|(id, _)| RemoteConversation {
                        id: id.clone(),
                        updated_at: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_recent_messages(
        &self,
        credential: &SecretString,
        conversation_id: &str,
    ) -> Result<Vec<RemoteMessage>, TransportError> {
        if expired(credential) {
            return Err(auth_error());
        }
        let inbox = self.inbox.lock().unwrap();
        Ok(inbox
            .values()
            .flatten()
            .find(|(id, _)| id == conversation_id)
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default())
    }

    async fn send_reply(
        &self,
        credential: &SecretString,
        recipient_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        if expired(credential) {
            return Err(auth_error());
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Api {
                platform: "facebook".into(),
                status: 500,
                message: "internal".into(),
            });
        }
        self.sent.lock().unwrap().push(Sent {
            recipient: recipient_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn post_comment(
        &self,
        _credential: &SecretString,
        object_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        self.comments.lock().unwrap().push(Sent {
            recipient: object_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl OperatorNotifier for RecordingNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    db: Arc<LibSqlBackend>,
    transport: Arc<FakeTransport>,
    notifier: Arc<RecordingNotifier>,
    accounts: Arc<AccountDirectory>,
    outbound: Outbound,
    pipeline: Arc<Pipeline>,
}

struct Options {
    llm_fails: bool,
    sends_fail: bool,
    auto_reply_enabled: bool,
    accounts: Vec<AccountBinding>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            llm_fails: false,
            sends_fail: false,
            auto_reply_enabled: true,
            accounts: vec![account("page_1", "token-1")],
        }
    }
}

fn account(id: &str, token: &str) -> AccountBinding {
    AccountBinding {
        account_id: id.into(),
        platform: "facebook".into(),
        name: None,
        access_token: SecretString::from(token),
        push_enabled: true,
        sweep_enabled: true,
    }
}

async fn harness(options: Options) -> Harness {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(FakeTransport {
        fail_sends: AtomicBool::new(options.sends_fail),
        ..Default::default()
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let accounts = Arc::new(AccountDirectory::new(options.accounts));

    let mut registry = AdapterRegistry::new();
    registry.register(transport.clone());
    let outbound = Outbound::new(Arc::new(registry), Arc::new(accounts.credential_store()));

    let reply = ReplyConfig {
        promo_link: Some(LINK.to_string()),
        ..ReplyConfig::default()
    };
    let store: Arc<dyn Database> = db.clone();
    let services = ReplyServices {
        gateway: ConversationGateway::new(store.clone()),
        classifier: Arc::new(IntentClassifier::new(&reply.rules)),
        composer: Arc::new(ReplyComposer::new(
            store.clone(),
            Arc::new(StubLlm {
                fail: options.llm_fails,
            }),
            reply,
        )),
        outbound: outbound.clone(),
        escalator: Escalator::new(notifier.clone()),
        stats: StatsRecorder::new(store),
        accounts: accounts.clone(),
        auto_reply_enabled: options.auto_reply_enabled,
    };
    let pipeline = Arc::new(build_reply_pipeline(services).unwrap());

    Harness {
        db,
        transport,
        notifier,
        accounts,
        outbound,
        pipeline,
    }
}

impl Harness {
    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.accounts.clone(),
            self.outbound.clone(),
            self.pipeline.clone(),
            Escalator::new(self.notifier.clone()),
            SweepConfig::unpaced(Duration::from_secs(300)),
        )
    }
}

fn push(mid: &str, sender: &str, text: &str) -> InboundMessage {
    InboundMessage {
        platform: "facebook".into(),
        platform_message_id: mid.into(),
        sender_id: sender.into(),
        sender_name: Some("Lin".into()),
        account_id: "page_1".into(),
        content: text.into(),
        kind: MessageKind::Message,
        thread_ref: None,
        timestamp_ms: Utc::now().timestamp_millis(),
        raw_payload: serde_json::json!({"source": "test"}),
    }
}

fn remote(id: &str, sender: &str, text: &str, at: DateTime<Utc>) -> RemoteMessage {
    RemoteMessage {
        id: id.into(),
        sender_id: sender.into(),
        sender_name: None,
        text: text.into(),
        created_at: at,
    }
}

fn link_count(text: &str) -> usize {
    text.matches(LINK).count()
}

// ── Classification and link gating ──────────────────────────────────

#[tokio::test]
async fn buy_intent_is_spam_and_gets_no_reply() {
    let h = harness(Options::default()).await;
    let report = h.pipeline.run(Trigger::Push, push("m1", "u1", "买手机")).await;

    assert!(report.has_flag(flags::SPAM));
    assert!(!report.replied());
    assert!(h.transport.sent().is_empty());

    let conv = h
        .db
        .get_conversation_by_platform_id("facebook", "m1")
        .await
        .unwrap()
        .unwrap();
    assert!(conv.filtered);
    assert!(!conv.replied);
}

#[tokio::test]
async fn promo_link_goes_out_once_per_customer() {
    let h = harness(Options::default()).await;

    let first = h
        .pipeline
        .run(Trigger::Push, push("m1", "u1", "iPhone 12, want to borrow 8000"))
        .await;
    assert!(first.replied());
    assert!(!first.has_flag(flags::SPAM));

    let second = h
        .pipeline
        .run(Trigger::Push, push("m2", "u1", "Can I borrow more with an iPhone 13?"))
        .await;
    assert!(second.replied());

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(link_count(&sent[0].text), 1);
    assert_eq!(link_count(&sent[1].text), 0);
    assert!(sent.iter().all(|s| s.recipient == "u1"));

    // A different customer still gets the link.
    h.pipeline
        .run(Trigger::Push, push("m3", "u2", "how do I apply?"))
        .await;
    assert_eq!(link_count(&h.transport.sent()[2].text), 1);
}

#[tokio::test]
async fn mixed_trade_and_business_is_spam_and_escalated_for_review() {
    let h = harness(Options::default()).await;
    let report = h
        .pipeline
        .run(Trigger::Push, push("m1", "u1", "卖手机多少钱？"))
        .await;

    assert!(report.has_flag(flags::SPAM));
    assert!(report.has_flag(flags::REVIEW));
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn global_switch_off_records_but_does_not_reply() {
    let h = harness(Options {
        auto_reply_enabled: false,
        ..Options::default()
    })
    .await;
    let report = h
        .pipeline
        .run(Trigger::Push, push("m1", "u1", "how much interest?"))
        .await;

    assert!(report.has_flag(flags::AUTO_REPLY_DISABLED));
    assert!(report.success);
    assert!(h.transport.sent().is_empty());
    assert!(
        h.db.get_conversation_by_platform_id("facebook", "m1")
            .await
            .unwrap()
            .is_some()
    );
}

// ── Failure handling ────────────────────────────────────────────────

#[tokio::test]
async fn completion_failure_leaves_message_unanswered_and_escalates() {
    let h = harness(Options {
        llm_fails: true,
        ..Options::default()
    })
    .await;
    let report = h
        .pipeline
        .run(Trigger::Push, push("m1", "u1", "iPhone 12, want to borrow 8000"))
        .await;

    assert!(!report.success);
    assert!(report.has_flag(flags::COMPLETION_FAILED));
    let conv = h
        .db
        .get_conversation_by_platform_id("facebook", "m1")
        .await
        .unwrap()
        .unwrap();
    assert!(!conv.replied);
    let notes = h.notifier.sent.lock().unwrap();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("Reply generation failed"));
}

#[tokio::test]
async fn delivery_failure_is_not_retried() {
    let h = harness(Options {
        sends_fail: true,
        ..Options::default()
    })
    .await;
    let msg = push("m1", "u1", "iPhone 12, want to borrow 8000");
    let first = h.pipeline.run(Trigger::Push, msg.clone()).await;
    assert!(first.has_flag(flags::DELIVERY_FAILED));
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);

    let again = h.pipeline.run(Trigger::Push, msg).await;
    assert!(again.has_flag(flags::DUPLICATE));
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn undelivered_reply_does_not_spend_the_link() {
    let h = harness(Options {
        sends_fail: true,
        ..Options::default()
    })
    .await;
    let failed = h
        .pipeline
        .run(Trigger::Push, push("m1", "u1", "iPhone 12, want to borrow 8000"))
        .await;
    assert!(failed.has_flag(flags::DELIVERY_FAILED));
    let customer_id = failed.customer_id.clone().unwrap();

    let conv = h
        .db
        .get_conversation_by_platform_id("facebook", "m1")
        .await
        .unwrap()
        .unwrap();
    assert!(conv.replied);
    assert!(conv.delivery_failed);
    assert!(h.db.successful_replies(&customer_id).await.unwrap().is_empty());

    h.transport.fail_sends.store(false, Ordering::SeqCst);
    let next = h
        .pipeline
        .run(Trigger::Push, push("m2", "u1", "iPhone 12, still want to borrow"))
        .await;
    assert!(next.replied());
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(link_count(&sent[0].text), 1);
}

#[tokio::test]
async fn comments_are_answered_under_the_comment() {
    let h = harness(Options::default()).await;
    let mut msg = push("c_1", "u1", "how much for iPhone 12?");
    msg.kind = MessageKind::Comment;
    msg.thread_ref = Some("c_1".into());

    let report = h.pipeline.run(Trigger::Push, msg).await;
    assert!(report.replied());
    assert!(h.transport.sent().is_empty());
    let comments = h.transport.comments.lock().unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].recipient, "c_1");
}

// ── Push and sweep together ─────────────────────────────────────────

#[tokio::test]
async fn push_then_sweep_replies_once() {
    let h = harness(Options::default()).await;
    let now = Utc::now();
    let text = "iPhone 12, want to borrow 8000";
    h.transport
        .add_message("page_1", "t_1", remote("abc123", "u1", text, now - TimeDelta::minutes(10)));

    let pushed = h.pipeline.run(Trigger::Push, push("abc123", "u1", text)).await;
    assert!(pushed.replied());

    let summary = h.reconciler().run_sweep_at(now).await;
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.replies_sent, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn sweep_then_push_replies_once() {
    let h = harness(Options::default()).await;
    let now = Utc::now();
    let text = "iPhone 12, want to borrow 8000";
    h.transport
        .add_message("page_1", "t_1", remote("abc123", "u1", text, now - TimeDelta::minutes(10)));

    let summary = h.reconciler().run_sweep_at(now).await;
    assert_eq!(summary.replies_sent, 1);

    let pushed = h.pipeline.run(Trigger::Push, push("abc123", "u1", text)).await;
    assert!(pushed.has_flag(flags::DUPLICATE));
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn concurrent_push_and_sweep_share_one_conversation() {
    let h = harness(Options::default()).await;
    let now = Utc::now();
    let text = "iPhone 12, want to borrow 8000";
    h.transport
        .add_message("page_1", "t_1", remote("abc123", "u1", text, now - TimeDelta::minutes(10)));
    let reconciler = h.reconciler();

    let (pushed, summary) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            h.pipeline.run(Trigger::Push, push("abc123", "u1", text)),
            reconciler.run_sweep_at(now),
        )
    })
    .await
    .unwrap();

    assert_eq!(h.transport.sent().len(), 1);
    let replies = usize::from(pushed.replied()) + summary.replies_sent;
    assert_eq!(replies, 1);

    let conv = h
        .db
        .get_conversation_by_platform_id("facebook", "abc123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.conversation_id.as_deref(), Some(conv.id.as_str()));
    assert!(conv.replied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_messages_from_one_customer_carry_link_once() {
    let h = harness(Options::default()).await;
    for round in 0..20 {
        let sender = format!("u{round}");
        let first = {
            let pipeline = h.pipeline.clone();
            let msg = push(&format!("a{round}"), &sender, "iPhone 12, want to borrow 8000");
            tokio::spawn(async move { pipeline.run(Trigger::Push, msg).await })
        };
        let second = {
            let pipeline = h.pipeline.clone();
            let msg = push(&format!("b{round}"), &sender, "iPhone 13, how much can I borrow?");
            tokio::spawn(async move { pipeline.run(Trigger::Push, msg).await })
        };
        let (first, second) = tokio::time::timeout(TEST_TIMEOUT, async {
            (first.await.unwrap(), second.await.unwrap())
        })
        .await
        .unwrap();
        assert!(first.replied() && second.replied());

        let with_link = h
            .transport
            .sent()
            .iter()
            .filter(|s| s.recipient == sender && link_count(&s.text) > 0)
            .count();
        assert_eq!(with_link, 1, "round {round}");
    }
}

#[tokio::test]
async fn webhook_event_and_sweep_agree() {
    let h = harness(Options::default()).await;
    let now = Utc::now();
    h.transport.add_message(
        "page_1",
        "t_1",
        remote("m_web", "u1", "how much interest?", now - TimeDelta::minutes(10)),
    );

    let state = WebhookState {
        pipeline: h.pipeline.clone(),
        accounts: h.accounts.clone(),
        verify_token: None,
    };
    let payload = serde_json::json!({
        "object": "page",
        "entry": [{"id": "page_1", "messaging": [{
            "sender": {"id": "u1"}, "recipient": {"id": "page_1"},
            "timestamp": now.timestamp_millis(),
            "message": {"mid": "m_web", "text": "how much interest?"}
        }]}]
    });
    for handle in state.dispatch(parse_events(&payload)) {
        assert!(handle.await.unwrap().replied());
    }

    h.reconciler().run_sweep_at(now).await;
    assert_eq!(h.transport.sent().len(), 1);
}

// ── Sweep behavior ──────────────────────────────────────────────────

#[tokio::test]
async fn young_message_waits_for_a_later_sweep() {
    let h = harness(Options::default()).await;
    let now = Utc::now();
    h.transport.add_message(
        "page_1",
        "t_1",
        remote("m1", "u1", "how do I apply?", now - TimeDelta::minutes(3)),
    );
    let reconciler = h.reconciler();

    let first = reconciler.run_sweep_at(now).await;
    assert_eq!(first.candidates, 0);
    assert!(h.transport.sent().is_empty());

    let later = reconciler.run_sweep_at(now + TimeDelta::minutes(3)).await;
    assert_eq!(later.candidates, 1);
    assert_eq!(later.replies_sent, 1);
}

#[tokio::test]
async fn expired_credential_fails_one_account_only() {
    let h = harness(Options {
        accounts: vec![account("page_bad", "expired"), account("page_1", "token-1")],
        ..Options::default()
    })
    .await;
    let old = Utc::now() - TimeDelta::minutes(10);
    h.transport
        .add_message("page_bad", "t_bad", remote("m_bad", "u9", "how do I apply?", old));
    h.transport
        .add_message("page_1", "t_1", remote("m_ok", "u1", "how do I apply?", old));

    let summary = h.reconciler().run_sweep().await;
    assert_eq!(summary.accounts_scanned, 2);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.replies_sent, 1);
    assert_eq!(h.transport.sent()[0].recipient, "u1");

    let notes = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("Account credential failure"));
    assert!(notes[0].contains("Account: page_bad"));

    h.reconciler().run_sweep().await;
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn sweep_skips_threads_the_page_answered_last() {
    let h = harness(Options::default()).await;
    let old = Utc::now() - TimeDelta::minutes(30);
    h.transport
        .add_message("page_1", "t_1", remote("m1", "u1", "how do I apply?", old));
    h.transport.add_message(
        "page_1",
        "t_1",
        remote("m2", "page_1", "Visit us any time.", old + TimeDelta::minutes(1)),
    );

    let summary = h.reconciler().run_sweep().await;
    assert_eq!(summary.candidates, 0);
    assert!(h.transport.sent().is_empty());
}
