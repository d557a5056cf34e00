//! Stage contract for the per-message pipeline.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::PipelineError;
use crate::gateway::ReplyGuard;
use crate::pipeline::types::{Classification, ComposedReply, InboundMessage, Trigger};
use crate::store::{Conversation, Customer};

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Skip(String),
    Error(String),
}

impl StageStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skip(_) => "skip",
            Self::Error(_) => "error",
        }
    }
}

/// Status plus whether the pipeline should stop after this stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub status: StageStatus,
    pub halt: bool,
}

impl StageResult {
    /// Continue with the next stage.
    pub fn success() -> Self {
        Self {
            status: StageStatus::Success,
            halt: false,
        }
    }

    /// Nothing more to do for this message.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skip(reason.into()),
            halt: true,
        }
    }

    /// Stop with an error.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Error(reason.into()),
            halt: true,
        }
    }
}

/// Per-message state handed from stage to stage.
#[derive(Debug)]
pub struct StageContext {
    pub trigger: Trigger,
    pub message: InboundMessage,
    pub customer: Option<Customer>,
    pub conversation: Option<Conversation>,
    /// This run inserted the conversation (first observation).
    pub inbound_created: bool,
    pub classification: Option<Classification>,
    pub reply: Option<ComposedReply>,
    /// Customer reply lock, taken at compose and released once the
    /// delivery outcome is stored.
    pub reply_guard: Option<ReplyGuard>,
    pub flags: Vec<String>,
}

impl StageContext {
    pub fn new(trigger: Trigger, message: InboundMessage) -> Self {
        Self {
            trigger,
            message,
            customer: None,
            conversation: None,
            inbound_created: false,
            classification: None,
            reply: None,
            reply_guard: None,
            flags: Vec::new(),
        }
    }

    /// Raise a report flag (idempotent).
    pub fn flag(&mut self, flag: &str) {
        if !self.has_flag(flag) {
            self.flags.push(flag.to_string());
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn customer(&self) -> Result<&Customer, PipelineError> {
        self.customer
            .as_ref()
            .ok_or_else(|| missing("customer"))
    }

    pub fn conversation(&self) -> Result<&Conversation, PipelineError> {
        self.conversation
            .as_ref()
            .ok_or_else(|| missing("conversation"))
    }
}

fn missing(what: &'static str) -> PipelineError {
    PipelineError::MissingContext(what)
}

/// A named unit of per-message work.
///
/// `depends_on` names stages that must run earlier in the same pipeline.
/// Returning `Err` is equivalent to `StageResult::error` with the error's
/// message; the orchestrator catches it.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<StageResult, PipelineError>;
}
