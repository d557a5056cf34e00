//! Per-message reply pipeline.
//!
//! Every inbound message, whether pushed by a webhook or found by the
//! reconciliation sweep, runs through the same ordered stages:
//! 1. `validate`, `resolve_customer`, `record_inbound`: identity and dedup
//! 2. `classify`, `escalate`, `gate`: decide whether a reply is warranted
//! 3. `compose`, `deliver`, `record_stats`: reply at most once
//!
//! The reply transition is claimed in the store before anything is sent.

pub mod classifier;
pub mod composer;
pub mod orchestrator;
pub mod reconcile;
pub mod stage;
pub mod stages;
pub mod types;

pub use orchestrator::{Pipeline, PipelineReport, StageReport};
pub use reconcile::{Reconciler, SweepSummary, spawn_reconciler};
pub use stage::{Stage, StageContext, StageResult, StageStatus};
pub use stages::{ReplyServices, build_reply_pipeline};
pub use types::{InboundMessage, MessageKind, Trigger};
