//! Reconciliation sweep: catches messages the push path missed.
//!
//! Per sweep-enabled account: list conversations, fetch each one's recent
//! messages, age-gate the latest message, and run candidates through the
//! same pipeline the webhook uses. Accounts are scanned one at a time with
//! fixed pacing between fetches. A failing account is logged and counted;
//! the remaining accounts are still scanned. Credential failures are also
//! reported to the operator, once per account per sweep.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::{AccountBinding, AccountDirectory, Outbound, RemoteMessage};
use crate::config::SweepConfig;
use crate::error::TransportError;
use crate::escalation::Escalator;
use crate::pipeline::orchestrator::Pipeline;
use crate::pipeline::types::{InboundMessage, MessageKind, Trigger};

/// Aggregate outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub accounts_scanned: usize,
    pub candidates: usize,
    pub replies_sent: usize,
    pub errors: usize,
    /// Candidates that ended without a reply and without an error
    /// (spam, duplicates, auto-reply disabled).
    pub skipped: usize,
}

/// Pick the sweep candidate from a conversation's recent messages.
///
/// Only the latest message is considered. It qualifies when it has text,
/// was not written by the account, and is no newer than `cutoff`.
pub fn select_candidate<'a>(
    messages: &'a [RemoteMessage],
    account_id: &str,
    cutoff: DateTime<Utc>,
) -> Option<&'a RemoteMessage> {
    let latest = messages.iter().max_by_key(|m| m.created_at)?;
    if latest.text.trim().is_empty() || latest.sender_id == account_id {
        return None;
    }
    (latest.created_at <= cutoff).then_some(latest)
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Runs sweeps over every sweep-enabled account.
pub struct Reconciler {
    accounts: Arc<AccountDirectory>,
    outbound: Outbound,
    pipeline: Arc<Pipeline>,
    escalator: Escalator,
    config: SweepConfig,
}

impl Reconciler {
    pub fn new(
        accounts: Arc<AccountDirectory>,
        outbound: Outbound,
        pipeline: Arc<Pipeline>,
        escalator: Escalator,
        config: SweepConfig,
    ) -> Self {
        Self {
            accounts,
            outbound,
            pipeline,
            escalator,
            config,
        }
    }

    pub async fn run_sweep(&self) -> SweepSummary {
        self.run_sweep_at(Utc::now()).await
    }

    /// One full pass, age-gating against `now`. Never fails; problems are
    /// counted in the summary.
    pub async fn run_sweep_at(&self, now: DateTime<Utc>) -> SweepSummary {
        let cutoff = cutoff(now, self.config.unanswered_age);
        let mut summary = SweepSummary::default();
        let mut fetches = 0usize;

        for account in self.accounts.sweep_accounts() {
            summary.accounts_scanned += 1;
            let scan = self.scan_account(account, cutoff, &mut summary, &mut fetches);
            match AssertUnwindSafe(scan).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(account = %account.account_id, error = %e, "Account scan failed");
                    summary.errors += 1;
                    if e.is_credential_failure() {
                        self.escalator
                            .account_failure(&account.platform, &account.account_id, &e)
                            .await;
                    }
                }
                Err(_) => {
                    error!(account = %account.account_id, "Account scan panicked");
                    summary.errors += 1;
                }
            }
        }

        info!(
            accounts = summary.accounts_scanned,
            candidates = summary.candidates,
            replies = summary.replies_sent,
            errors = summary.errors,
            skipped = summary.skipped,
            "Sweep complete"
        );
        summary
    }

    async fn scan_account(
        &self,
        account: &AccountBinding,
        cutoff: DateTime<Utc>,
        summary: &mut SweepSummary,
        fetches: &mut usize,
    ) -> Result<(), TransportError> {
        let transport = self.outbound.registry().get(&account.platform)?;
        let credential = self.outbound.credential(&account.account_id).await?;
        let conversations = transport
            .list_conversations(&account.account_id, &credential, self.config.conversation_limit)
            .await?;
        debug!(
            account = %account.account_id,
            conversations = conversations.len(),
            "Listed conversations"
        );

        for remote in conversations {
            let fetched = transport.fetch_recent_messages(&credential, &remote.id).await;
            *fetches += 1;
            self.pace(*fetches).await;

            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(
                        account = %account.account_id,
                        conversation = %remote.id,
                        error = %e,
                        "Failed to fetch conversation messages"
                    );
                    summary.errors += 1;
                    continue;
                }
            };

            let Some(latest) = select_candidate(&messages, &account.account_id, cutoff) else {
                continue;
            };
            summary.candidates += 1;

            let message = InboundMessage {
                platform: account.platform.clone(),
                platform_message_id: latest.id.clone(),
                sender_id: latest.sender_id.clone(),
                sender_name: latest.sender_name.clone(),
                account_id: account.account_id.clone(),
                content: latest.text.clone(),
                kind: MessageKind::Message,
                thread_ref: None,
                timestamp_ms: latest.created_at.timestamp_millis(),
                raw_payload: serde_json::json!({
                    "source": "sweep",
                    "conversation_id": remote.id,
                }),
            };
            let report = self.pipeline.run(Trigger::Sweep, message).await;
            if report.replied() {
                summary.replies_sent += 1;
            } else if !report.success {
                summary.errors += 1;
            } else {
                summary.skipped += 1;
            }
        }
        Ok(())
    }

    async fn pace(&self, fetches: usize) {
        if !self.config.fetch_delay.is_zero() {
            tokio::time::sleep(self.config.fetch_delay).await;
        }
        if self.config.batch_size > 0
            && fetches % self.config.batch_size == 0
            && !self.config.batch_delay.is_zero()
        {
            tokio::time::sleep(self.config.batch_delay).await;
        }
    }
}

/// Run sweeps until cancelled, `interval` apart.
///
/// The first sweep starts immediately. Cancelling interrupts only the wait
/// between sweeps; a sweep in progress runs to completion.
pub fn spawn_reconciler(
    reconciler: Arc<Reconciler>,
    interval: Duration,
) -> (JoinHandle<()>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Reconciliation sweep started");
        loop {
            if token.is_cancelled() {
                break;
            }
            if AssertUnwindSafe(reconciler.run_sweep())
                .catch_unwind()
                .await
                .is_err()
            {
                error!("Sweep panicked");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Reconciliation sweep stopped");
    });

    (handle, shutdown)
}
