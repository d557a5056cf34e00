//! The reply pipeline's stages, in execution order.
//!
//! validate → resolve_customer → record_inbound → classify → escalate →
//! gate → compose → deliver → record_stats
//!
//! `deliver` claims the reply transition before sending, so when push and
//! sweep race on the same message only the claimant talks to the platform.
//! `compose` takes the customer's reply lock and `deliver` releases it after
//! the delivery outcome is stored.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::channels::{AccountDirectory, Outbound};
use crate::error::{PipelineError, ValidationError};
use crate::escalation::{EscalationReason, Escalator};
use crate::gateway::ConversationGateway;
use crate::pipeline::classifier::IntentClassifier;
use crate::pipeline::composer::ReplyComposer;
use crate::pipeline::orchestrator::Pipeline;
use crate::pipeline::stage::{Stage, StageContext, StageResult};
use crate::pipeline::types::{MessageKind, ReplySource, Trigger, flags};
use crate::stats::{StatsEvent, StatsRecorder};
use crate::store::MarkOutcome;

// ── validate ────────────────────────────────────────────────────────

/// Rejects records with missing identifiers; drops empty messages.
pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let msg = &ctx.message;
        for (field, value) in [
            ("platform", &msg.platform),
            ("platform_message_id", &msg.platform_message_id),
            ("sender_id", &msg.sender_id),
            ("account_id", &msg.account_id),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(field).into());
            }
        }
        if msg.kind == MessageKind::Comment && msg.thread_ref.is_none() {
            return Err(ValidationError::MissingField("thread_ref").into());
        }
        if msg.content.trim().is_empty() {
            return Ok(StageResult::skip("empty content"));
        }
        // Page echoes of our own replies.
        if msg.sender_id == msg.account_id {
            return Ok(StageResult::skip("sent by the account itself"));
        }
        Ok(StageResult::success())
    }
}

// ── resolve_customer ────────────────────────────────────────────────

pub struct ResolveCustomerStage {
    gateway: ConversationGateway,
}

impl ResolveCustomerStage {
    pub fn new(gateway: ConversationGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for ResolveCustomerStage {
    fn name(&self) -> &'static str {
        "resolve_customer"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["validate"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let msg = &ctx.message;
        let customer = self
            .gateway
            .resolve_customer(&msg.platform, &msg.sender_id, msg.sender_name.as_deref())
            .await?;
        ctx.customer = Some(customer);
        Ok(StageResult::success())
    }
}

// ── record_inbound ──────────────────────────────────────────────────

pub struct RecordInboundStage {
    gateway: ConversationGateway,
    stats: StatsRecorder,
}

impl RecordInboundStage {
    pub fn new(gateway: ConversationGateway, stats: StatsRecorder) -> Self {
        Self { gateway, stats }
    }
}

#[async_trait]
impl Stage for RecordInboundStage {
    fn name(&self) -> &'static str {
        "record_inbound"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["resolve_customer"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let customer_id = ctx.customer()?.id.clone();
        let (conversation, created) = self.gateway.record_inbound(&ctx.message, &customer_id).await?;
        if created {
            self.stats.record(StatsEvent::Received);
        }

        let replied = conversation.replied;
        ctx.conversation = Some(conversation);
        ctx.inbound_created = created;
        if replied {
            ctx.flag(flags::DUPLICATE);
            return Ok(StageResult::skip("already replied"));
        }
        Ok(StageResult::success())
    }
}

// ── classify ────────────────────────────────────────────────────────

pub struct ClassifyStage {
    gateway: ConversationGateway,
    classifier: Arc<IntentClassifier>,
    stats: StatsRecorder,
}

impl ClassifyStage {
    pub fn new(
        gateway: ConversationGateway,
        classifier: Arc<IntentClassifier>,
        stats: StatsRecorder,
    ) -> Self {
        Self {
            gateway,
            classifier,
            stats,
        }
    }
}

#[async_trait]
impl Stage for ClassifyStage {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["record_inbound"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let conversation_id = ctx.conversation()?.id.clone();
        let verdict = self.classifier.classify(&ctx.message.content);
        self.gateway
            .db()
            .set_classification(
                &conversation_id,
                verdict.is_spam,
                verdict.reason.as_deref(),
                verdict.priority,
            )
            .await?;

        if verdict.is_spam {
            ctx.flag(flags::SPAM);
            if ctx.inbound_created {
                self.stats.record(StatsEvent::Spam);
            }
        }
        if verdict.needs_review {
            ctx.flag(flags::REVIEW);
        }
        debug!(
            conversation = %conversation_id,
            spam = verdict.is_spam,
            must_answer = verdict.must_answer,
            reason = verdict.reason.as_deref().unwrap_or(""),
            "Classified"
        );
        ctx.classification = Some(verdict);
        Ok(StageResult::success())
    }
}

// ── escalate ────────────────────────────────────────────────────────

/// Sends review-flagged messages to the operator, once per message.
pub struct EscalateStage {
    escalator: Escalator,
}

impl EscalateStage {
    pub fn new(escalator: Escalator) -> Self {
        Self { escalator }
    }
}

#[async_trait]
impl Stage for EscalateStage {
    fn name(&self) -> &'static str {
        "escalate"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["classify"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        // The second path to observe a message does not re-notify.
        if ctx.has_flag(flags::REVIEW) && ctx.inbound_created {
            let detail = ctx
                .classification
                .as_ref()
                .and_then(|c| c.reason.clone())
                .unwrap_or_else(|| "flagged by classifier".into());
            self.escalator
                .escalate(
                    EscalationReason::Review { detail },
                    &ctx.message,
                    ctx.customer.as_ref(),
                    ctx.conversation.as_ref(),
                )
                .await;
        }
        Ok(StageResult::success())
    }
}

// ── gate ────────────────────────────────────────────────────────────

/// Stops spam and messages for which auto-reply is switched off.
pub struct GateStage {
    auto_reply_enabled: bool,
    accounts: Arc<AccountDirectory>,
}

impl GateStage {
    pub fn new(auto_reply_enabled: bool, accounts: Arc<AccountDirectory>) -> Self {
        Self {
            auto_reply_enabled,
            accounts,
        }
    }
}

#[async_trait]
impl Stage for GateStage {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["classify"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        if ctx.has_flag(flags::SPAM) {
            return Ok(StageResult::skip("spam"));
        }

        let account = &ctx.message.account_id;
        let account_enabled = match ctx.trigger {
            Trigger::Push => self.accounts.push_enabled(account),
            Trigger::Sweep => self.accounts.sweep_enabled(account),
        };
        if !self.auto_reply_enabled || !account_enabled {
            ctx.flag(flags::AUTO_REPLY_DISABLED);
            return Ok(StageResult::skip("auto-reply disabled"));
        }
        Ok(StageResult::success())
    }
}

// ── compose ─────────────────────────────────────────────────────────

/// Composes the reply while holding the customer's reply lock; `deliver`
/// releases it.
pub struct ComposeStage {
    gateway: ConversationGateway,
    composer: Arc<ReplyComposer>,
    escalator: Escalator,
    stats: StatsRecorder,
}

impl ComposeStage {
    pub fn new(
        gateway: ConversationGateway,
        composer: Arc<ReplyComposer>,
        escalator: Escalator,
        stats: StatsRecorder,
    ) -> Self {
        Self {
            gateway,
            composer,
            escalator,
            stats,
        }
    }
}

#[async_trait]
impl Stage for ComposeStage {
    fn name(&self) -> &'static str {
        "compose"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["gate"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let conversation = ctx.conversation()?.clone();
        ctx.reply_guard = Some(self.gateway.lock_customer(&conversation.customer_id).await);
        match self.composer.compose(&conversation).await {
            Ok(reply) => {
                ctx.reply = Some(reply);
                Ok(StageResult::success())
            }
            Err(e) if e.is_completion_failure() => {
                warn!(conversation = %conversation.id, error = %e, "Reply generation failed");
                ctx.flag(flags::COMPLETION_FAILED);
                self.stats.record(StatsEvent::Error);
                self.escalator
                    .escalate(
                        EscalationReason::CompletionFailed {
                            error: e.to_string(),
                        },
                        &ctx.message,
                        ctx.customer.as_ref(),
                        Some(&conversation),
                    )
                    .await;
                Ok(StageResult::error(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

// ── deliver ─────────────────────────────────────────────────────────

pub struct DeliverStage {
    gateway: ConversationGateway,
    outbound: Outbound,
    escalator: Escalator,
    stats: StatsRecorder,
}

impl DeliverStage {
    pub fn new(
        gateway: ConversationGateway,
        outbound: Outbound,
        escalator: Escalator,
        stats: StatsRecorder,
    ) -> Self {
        Self {
            gateway,
            outbound,
            escalator,
            stats,
        }
    }
}

#[async_trait]
impl Stage for DeliverStage {
    fn name(&self) -> &'static str {
        "deliver"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["compose"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let conversation = ctx.conversation()?.clone();
        let Some(reply) = ctx.reply.clone() else {
            return Ok(StageResult::error("no reply composed"));
        };

        // Claim first. Losing the claim means the other path already answered.
        match self.gateway.mark_replied(&conversation.id, &reply.text).await? {
            MarkOutcome::Transitioned => {}
            MarkOutcome::AlreadyReplied => {
                ctx.flag(flags::DUPLICATE);
                return Ok(StageResult::skip("already replied"));
            }
        }

        let msg = &ctx.message;
        let sent = match msg.kind {
            MessageKind::Comment => {
                let target = msg.thread_ref.as_deref().unwrap_or(&msg.platform_message_id);
                self.outbound
                    .post_comment(&msg.platform, &msg.account_id, target, &reply.text)
                    .await
            }
            MessageKind::Message | MessageKind::Ad => {
                self.outbound
                    .send_reply(&msg.platform, &msg.account_id, &msg.sender_id, &reply.text)
                    .await
            }
        };

        let outcome = match sent {
            Ok(()) => {
                info!(
                    conversation = %conversation.id,
                    account = %msg.account_id,
                    trigger = ctx.trigger.as_str(),
                    link = reply.includes_link,
                    "Reply delivered"
                );
                ctx.flag(flags::REPLIED);
                Ok(StageResult::success())
            }
            Err(e) => {
                warn!(conversation = %conversation.id, error = %e, "Reply delivery failed");
                ctx.flag(flags::DELIVERY_FAILED);
                if let Err(store_err) = self.gateway.mark_delivery_failed(&conversation.id).await {
                    warn!(
                        conversation = %conversation.id,
                        error = %store_err,
                        "Failed to record undelivered reply"
                    );
                }
                self.stats.record(StatsEvent::Error);
                self.escalator
                    .escalate(
                        EscalationReason::DeliveryFailed {
                            error: e.to_string(),
                        },
                        &ctx.message,
                        ctx.customer.as_ref(),
                        Some(&conversation),
                    )
                    .await;
                Ok(StageResult::error(PipelineError::Delivery(e).to_string()))
            }
        };
        ctx.reply_guard = None;
        outcome
    }
}

// ── record_stats ────────────────────────────────────────────────────

pub struct RecordStatsStage {
    stats: StatsRecorder,
}

impl RecordStatsStage {
    pub fn new(stats: StatsRecorder) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Stage for RecordStatsStage {
    fn name(&self) -> &'static str {
        "record_stats"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["deliver"]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError> {
        let Some(reply) = ctx.reply.as_ref() else {
            return Ok(StageResult::skip("nothing delivered"));
        };
        let (category, canned) = match &reply.source {
            ReplySource::Canned { category } => (Some(category.clone()), true),
            ReplySource::Generated => (None, false),
        };
        self.stats.record(StatsEvent::Reply {
            question: ctx.message.content.clone(),
            category,
            reply: reply.text.clone(),
            canned,
        });
        Ok(StageResult::success())
    }
}

// ── assembly ────────────────────────────────────────────────────────

/// Collaborators shared by the push handler and the sweep.
#[derive(Clone)]
pub struct ReplyServices {
    pub gateway: ConversationGateway,
    pub classifier: Arc<IntentClassifier>,
    pub composer: Arc<ReplyComposer>,
    pub outbound: Outbound,
    pub escalator: Escalator,
    pub stats: StatsRecorder,
    pub accounts: Arc<AccountDirectory>,
    pub auto_reply_enabled: bool,
}

/// The reply pipeline both paths run every message through.
pub fn build_reply_pipeline(services: ReplyServices) -> Result<Pipeline, PipelineError> {
    let ReplyServices {
        gateway,
        classifier,
        composer,
        outbound,
        escalator,
        stats,
        accounts,
        auto_reply_enabled,
    } = services;

    Pipeline::new(vec![
        Arc::new(ValidateStage),
        Arc::new(ResolveCustomerStage::new(gateway.clone())),
        Arc::new(RecordInboundStage::new(gateway.clone(), stats.clone())),
        Arc::new(ClassifyStage::new(gateway.clone(), classifier, stats.clone())),
        Arc::new(EscalateStage::new(escalator.clone())),
        Arc::new(GateStage::new(auto_reply_enabled, accounts)),
        Arc::new(ComposeStage::new(
            gateway.clone(),
            composer,
            escalator.clone(),
            stats.clone(),
        )),
        Arc::new(DeliverStage::new(gateway, outbound, escalator, stats.clone())),
        Arc::new(RecordStatsStage::new(stats)),
    ])
}
