//! Pipeline orchestrator: ordered stage execution with per-message reports.
//!
//! Stage order is fixed once, at construction. `Pipeline::new` takes an
//! explicit order and checks it against every stage's declared
//! dependencies; `Pipeline::from_dependencies` derives an order
//! (topological, ties broken by declaration order). Either way a bad order
//! or a dependency cycle is a startup error, never a silent fallback.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::stage::{Stage, StageContext, StageResult, StageStatus};
use crate::pipeline::types::{InboundMessage, Trigger, flags};

/// Timing and outcome of one stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: &'static str,
    #[serde(flatten)]
    pub status: StageStatus,
    pub duration_ms: u64,
}

/// Observability summary for one message. Never drives control flow.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// No stage reported an error.
    pub success: bool,
    pub trigger: Trigger,
    pub platform_message_id: String,
    pub stages: Vec<StageReport>,
    pub customer_id: Option<String>,
    pub conversation_id: Option<String>,
    pub flags: Vec<String>,
}

impl PipelineReport {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// This run delivered a reply.
    pub fn replied(&self) -> bool {
        self.has_flag(flags::REPLIED)
    }
}

/// Ordered, validated list of stages.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Pipeline {
    /// Use `stages` in the given order, validating declared dependencies.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self, PipelineError> {
        let known = unique_names(&stages)?;
        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &stages {
            for dep in stage.depends_on() {
                if !known.contains(dep) {
                    return Err(PipelineError::InvalidOrder(format!(
                        "stage '{}' depends on unknown stage '{dep}'",
                        stage.name()
                    )));
                }
                if !seen.contains(dep) {
                    return Err(PipelineError::InvalidOrder(format!(
                        "stage '{}' runs before its dependency '{dep}'",
                        stage.name()
                    )));
                }
            }
            seen.insert(stage.name());
        }
        Ok(Self { stages })
    }

    /// Derive the order from declared dependencies.
    ///
    /// Among stages whose dependencies are satisfied, the one declared
    /// first runs first. A cycle is an error.
    pub fn from_dependencies(stages: Vec<Arc<dyn Stage>>) -> Result<Self, PipelineError> {
        let known = unique_names(&stages)?;
        for stage in &stages {
            if let Some(dep) = stage.depends_on().iter().find(|d| !known.contains(*d)) {
                return Err(PipelineError::InvalidOrder(format!(
                    "stage '{}' depends on unknown stage '{dep}'",
                    stage.name()
                )));
            }
        }

        let mut pending = stages;
        let mut ordered: Vec<Arc<dyn Stage>> = Vec::with_capacity(pending.len());
        let mut placed: HashSet<&'static str> = HashSet::new();
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|s| s.depends_on().iter().all(|d| placed.contains(d)));
            match ready {
                Some(index) => {
                    let stage = pending.remove(index);
                    placed.insert(stage.name());
                    ordered.push(stage);
                }
                None => {
                    let stuck: Vec<_> = pending.iter().map(|s| s.name()).collect();
                    return Err(PipelineError::InvalidOrder(format!(
                        "dependency cycle among stages {stuck:?}"
                    )));
                }
            }
        }
        Ok(Self { stages: ordered })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one message through every stage until a stage halts.
    ///
    /// Stage errors and panics are caught here and recorded in the report;
    /// this never fails.
    pub async fn run(&self, trigger: Trigger, message: InboundMessage) -> PipelineReport {
        let mid = message.platform_message_id.clone();
        let mut ctx = StageContext::new(trigger, message);
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut success = true;

        for stage in &self.stages {
            let name = stage.name();
            debug!(stage = name, mid = %mid, trigger = trigger.as_str(), "Stage start");
            let started = Instant::now();

            let result = match AssertUnwindSafe(stage.run(&mut ctx)).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(stage = name, mid = %mid, error = %e, "Stage failed");
                    StageResult::error(e.to_string())
                }
                Err(_) => {
                    error!(stage = name, mid = %mid, "Stage panicked");
                    StageResult::error("stage panicked")
                }
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            debug!(
                stage = name,
                mid = %mid,
                status = result.status.label(),
                halt = result.halt,
                duration_ms,
                "Stage finish"
            );
            if matches!(result.status, StageStatus::Error(_)) {
                success = false;
            }
            reports.push(StageReport {
                name,
                status: result.status,
                duration_ms,
            });
            if result.halt {
                break;
            }
        }

        let report = PipelineReport {
            success,
            trigger,
            platform_message_id: mid,
            stages: reports,
            customer_id: ctx.customer.map(|c| c.id),
            conversation_id: ctx.conversation.map(|c| c.id),
            flags: ctx.flags,
        };
        info!(
            mid = %report.platform_message_id,
            trigger = trigger.as_str(),
            success = report.success,
            last_stage = report.stages.last().map(|s| s.name).unwrap_or("none"),
            flags = ?report.flags,
            "Message processed"
        );
        report
    }
}

fn unique_names(stages: &[Arc<dyn Stage>]) -> Result<HashSet<&'static str>, PipelineError> {
    let mut names = HashSet::new();
    for stage in stages {
        if !names.insert(stage.name()) {
            return Err(PipelineError::InvalidOrder(format!(
                "duplicate stage '{}'",
                stage.name()
            )));
        }
    }
    Ok(names)
}
