//! Best-effort statistics: per-day counters and frequent questions.
//!
//! Recording is fire-and-forget relative to the reply path. Failures are
//! logged at `warn` and dropped, never retried.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::{DailyStats, Database, FrequentQuestion, StatsDelta};

/// Longest normalized question kept, in characters.
const MAX_QUESTION_CHARS: usize = 100;

/// Something worth counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsEvent {
    /// A new inbound message was recorded.
    Received,
    /// A message was classified as spam.
    Spam,
    /// A message failed somewhere in the pipeline.
    Error,
    /// A reply was delivered.
    Reply {
        question: String,
        category: Option<String>,
        reply: String,
        canned: bool,
    },
}

/// Normalize a customer question for frequency counting: lowercase,
/// collapse whitespace, drop trailing punctuation, cap the length.
pub fn normalize_question(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let trimmed = collapsed.trim_end_matches(|c: char| {
        c.is_ascii_punctuation() || matches!(c, '？' | '。' | '！' | '，' | '…' | '~' | '～')
    });
    trimmed.chars().take(MAX_QUESTION_CHARS).collect()
}

/// Today's counters plus the most frequent questions.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub today: Option<DailyStats>,
    pub top_questions: Vec<FrequentQuestion>,
}

/// Records statistics without blocking callers.
#[derive(Clone)]
pub struct StatsRecorder {
    db: Arc<dyn Database>,
}

impl StatsRecorder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Record in a background task. Must be called inside a tokio runtime.
    pub fn record(&self, event: StatsEvent) {
        let recorder = self.clone();
        tokio::spawn(async move {
            if let Err(e) = recorder.apply(&event).await {
                warn!(error = %e, event = ?event, "Failed to record statistics");
            }
        });
    }

    /// Record and wait for the write.
    pub async fn apply(&self, event: &StatsEvent) -> Result<(), DatabaseError> {
        let today = Utc::now().date_naive();
        let delta = match event {
            StatsEvent::Received => StatsDelta {
                messages_received: 1,
                ..Default::default()
            },
            StatsEvent::Spam => StatsDelta {
                spam_filtered: 1,
                ..Default::default()
            },
            StatsEvent::Error => StatsDelta {
                errors: 1,
                ..Default::default()
            },
            StatsEvent::Reply { canned, .. } => StatsDelta {
                replies_sent: 1,
                canned_replies: i64::from(*canned),
                ..Default::default()
            },
        };
        self.db.increment_daily_stats(today, delta).await?;

        if let StatsEvent::Reply {
            question,
            category,
            reply,
            ..
        } = event
        {
            let normalized = normalize_question(question);
            if !normalized.is_empty() {
                self.db
                    .record_question(&normalized, category.as_deref(), Some(reply), Utc::now())
                    .await?;
                debug!(question = %normalized, "Question recorded");
            }
        }
        Ok(())
    }

    /// Read today's counters and the `limit` most frequent questions.
    pub async fn snapshot(&self, limit: usize) -> Result<StatsSnapshot, DatabaseError> {
        let today = self.db.get_daily_stats(Utc::now().date_naive()).await?;
        let top_questions = self.db.top_questions(limit).await?;
        Ok(StatsSnapshot {
            today,
            top_questions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn normalize_collapses_and_strips() {
        assert_eq!(normalize_question("  How MUCH   interest?? "), "how much interest");
        assert_eq!(normalize_question("利息多少？"), "利息多少");
        assert_eq!(normalize_question("?!"), "");
        assert_eq!(normalize_question(&"x".repeat(300)).chars().count(), 100);
    }

    #[tokio::test]
    async fn reply_event_updates_counters_and_questions() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let recorder = StatsRecorder::new(db.clone());

        recorder.apply(&StatsEvent::Received).await.unwrap();
        recorder.apply(&StatsEvent::Received).await.unwrap();
        recorder
            .apply(&StatsEvent::Reply {
                question: "How much interest?".into(),
                category: Some("interest".into()),
                reply: "It depends on the model.".into(),
                canned: true,
            })
            .await
            .unwrap();

        let snapshot = recorder.snapshot(5).await.unwrap();
        let stats = snapshot.today.unwrap();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.replies_sent, 1);
        assert_eq!(stats.canned_replies, 1);
        assert_eq!(stats.reply_rate, "50.0%");

        let top = &snapshot.top_questions;
        assert_eq!(top[0].question_text, "how much interest");
        assert_eq!(top[0].sample_replies, vec!["It depends on the model."]);
    }

    #[tokio::test]
    async fn background_record_eventually_lands() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let recorder = StatsRecorder::new(db.clone());
        recorder.record(StatsEvent::Spam);

        let today = Utc::now().date_naive();
        let mut spam = 0;
        for _ in 0..50 {
            if let Some(stats) = db.get_daily_stats(today).await.unwrap() {
                spam = stats.spam_filtered;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(spam, 1);
    }
}
