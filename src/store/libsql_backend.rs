//! libSQL backend for the `Database` trait.
//!
//! Supports local file and in-memory databases. Both coordination
//! primitives are single statements: `INSERT … ON CONFLICT DO NOTHING`
//! for find-or-create, and `UPDATE … WHERE replied = 0` for the reply
//! transition. Rows-affected decides who won.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::MessageKind;
use crate::store::migrations;
use crate::store::traits::{
    Conversation, Customer, DailyStats, Database, FrequentQuestion, MarkOutcome, NewConversation,
    Priority, StatsDelta,
};

/// Sample replies kept per frequent question.
const MAX_SAMPLE_REPLIES: i64 = 3;

/// libSQL database backend.
///
/// A single connection is reused for all operations; `libsql::Connection`
/// is safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_one<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, libsql::Error>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => map(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn query_all<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, libsql::Error>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(
                    map(&row).map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const CUSTOMER_COLUMNS: &str =
    "id, platform, platform_user_id, name, phone, email, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, customer_id, platform, platform_message_id, account_id, \
     kind, content, raw_payload, replied, reply_content, reply_at, filtered, filter_reason, \
     priority, received_at, created_at, delivery_failed";

const STATS_COLUMNS: &str = "date, messages_received, replies_sent, canned_replies, \
     spam_filtered, errors, reply_rate, spam_rate, updated_at";

const QUESTION_COLUMNS: &str =
    "question_text, category, count, first_seen, last_seen, sample_replies";

fn row_to_customer(row: &libsql::Row) -> Result<Customer, libsql::Error> {
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;
    Ok(Customer {
        id: row.get(0)?,
        platform: row.get(1)?,
        platform_user_id: row.get(2)?,
        name: row.get::<String>(3).ok().filter(|n| !n.is_empty()),
        phone: row.get(4).ok(),
        email: row.get(5).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let kind_str: String = row.get(5)?;
    let received_str: String = row.get(14)?;
    let created_str: String = row.get(15)?;
    Ok(Conversation {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        platform: row.get(2)?,
        platform_message_id: row.get(3)?,
        account_id: row.get(4)?,
        kind: kind_str.parse().unwrap_or(MessageKind::Message),
        content: row.get(6)?,
        raw_payload: row.get(7).ok(),
        replied: row.get::<i64>(8)? != 0,
        reply_content: row.get(9).ok(),
        reply_at: parse_optional_datetime(row.get(10).ok()),
        filtered: row.get::<i64>(11)? != 0,
        filter_reason: row.get(12).ok(),
        priority: Priority::from_i64(row.get(13)?),
        received_at: parse_datetime(&received_str),
        created_at: parse_datetime(&created_str),
        delivery_failed: row.get::<i64>(16)? != 0,
    })
}

fn row_to_stats(row: &libsql::Row) -> Result<DailyStats, libsql::Error> {
    let date_str: String = row.get(0)?;
    let updated_str: String = row.get(8)?;
    Ok(DailyStats {
        date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").unwrap_or_default(),
        messages_received: row.get(1)?,
        replies_sent: row.get(2)?,
        canned_replies: row.get(3)?,
        spam_filtered: row.get(4)?,
        errors: row.get(5)?,
        reply_rate: row.get(6)?,
        spam_rate: row.get(7)?,
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_question(row: &libsql::Row) -> Result<FrequentQuestion, libsql::Error> {
    let first_str: String = row.get(3)?;
    let last_str: String = row.get(4)?;
    let samples_str: String = row.get(5)?;
    Ok(FrequentQuestion {
        question_text: row.get(0)?,
        category: row.get(1).ok(),
        count: row.get(2)?,
        first_seen: parse_datetime(&first_str),
        last_seen: parse_datetime(&last_str),
        sample_replies: serde_json::from_str(&samples_str).unwrap_or_default(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Customers ───────────────────────────────────────────────────

    async fn upsert_customer(
        &self,
        platform: &str,
        platform_user_id: &str,
        name: Option<&str>,
    ) -> Result<(Customer, bool), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let name = name.filter(|n| !n.trim().is_empty());
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO customers (id, platform, platform_user_id, name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (platform, platform_user_id) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    platform,
                    platform_user_id,
                    opt_text(name),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_customer: {e}")))?;

        let customer = self
            .query_one(
                "upsert_customer",
                &format!(
                    "SELECT {CUSTOMER_COLUMNS} FROM customers
                     WHERE platform = ?1 AND platform_user_id = ?2"
                ),
                params![platform, platform_user_id],
                row_to_customer,
            )
            .await?
            .ok_or_else(|| DatabaseError::Conflict {
                entity: "customer".into(),
                key: format!("{platform}/{platform_user_id}"),
            })?;

        if inserted == 1 {
            debug!(id = %customer.id, platform, user = platform_user_id, "Customer created");
        }
        Ok((customer, inserted == 1))
    }

    async fn backfill_customer_name(&self, id: &str, name: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE customers SET name = ?2, updated_at = ?3
                 WHERE id = ?1 AND (name IS NULL OR name = '')",
                params![id, name, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("backfill_customer_name: {e}")))?;
        Ok(updated == 1)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn insert_conversation_if_absent(
        &self,
        new: &NewConversation<'_>,
    ) -> Result<(Conversation, bool), DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO conversations (id, customer_id, platform, platform_message_id,
                    account_id, kind, content, raw_payload, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (platform, platform_message_id) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    new.customer_id,
                    new.platform,
                    new.platform_message_id,
                    new.account_id,
                    new.kind.as_str(),
                    new.content,
                    opt_text(new.raw_payload),
                    new.received_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_conversation_if_absent: {e}")))?;

        let conversation = self
            .get_conversation_by_platform_id(new.platform, new.platform_message_id)
            .await?
            .ok_or_else(|| DatabaseError::Conflict {
                entity: "conversation".into(),
                key: format!("{}/{}", new.platform, new.platform_message_id),
            })?;
        Ok((conversation, inserted == 1))
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one(
            "get_conversation",
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            row_to_conversation,
        )
        .await
    }

    async fn get_conversation_by_platform_id(
        &self,
        platform: &str,
        platform_message_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one(
            "get_conversation_by_platform_id",
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE platform = ?1 AND platform_message_id = ?2"
            ),
            params![platform, platform_message_id],
            row_to_conversation,
        )
        .await
    }

    async fn set_classification(
        &self,
        id: &str,
        filtered: bool,
        reason: Option<&str>,
        priority: Priority,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE conversations SET filtered = ?2, filter_reason = ?3, priority = ?4
                 WHERE id = ?1",
                params![id, i64::from(filtered), opt_text(reason), priority.as_i64()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_classification: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_replied(
        &self,
        id: &str,
        reply_content: &str,
        replied_at: DateTime<Utc>,
    ) -> Result<MarkOutcome, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE conversations SET replied = 1, reply_content = ?2, reply_at = ?3
                 WHERE id = ?1 AND replied = 0",
                params![id, reply_content, replied_at.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_replied: {e}")))?;

        if updated == 1 {
            debug!(id, "Conversation marked replied");
            return Ok(MarkOutcome::Transitioned);
        }
        match self.get_conversation(id).await? {
            Some(_) => Ok(MarkOutcome::AlreadyReplied),
            None => Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            }),
        }
    }

    async fn mark_delivery_failed(&self, id: &str) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE conversations SET delivery_failed = 1 WHERE id = ?1 AND replied = 1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_delivery_failed: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "replied conversation".into(),
                id: id.to_string(),
            });
        }
        debug!(id, "Conversation reply marked undelivered");
        Ok(())
    }

    async fn recent_conversations(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut conversations = self
            .query_all(
                "recent_conversations",
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE customer_id = ?1
                     ORDER BY received_at DESC, created_at DESC
                     LIMIT ?2"
                ),
                params![customer_id, limit as i64],
                row_to_conversation,
            )
            .await?;
        conversations.reverse();
        Ok(conversations)
    }

    async fn successful_replies(&self, customer_id: &str) -> Result<Vec<String>, DatabaseError> {
        self.query_all(
            "successful_replies",
            "SELECT reply_content FROM conversations
             WHERE customer_id = ?1 AND replied = 1 AND delivery_failed = 0
                AND reply_content IS NOT NULL
             ORDER BY reply_at ASC",
            params![customer_id],
            |row| row.get::<String>(0),
        )
        .await
    }

    // ── Statistics ──────────────────────────────────────────────────

    async fn increment_daily_stats(
        &self,
        date: NaiveDate,
        delta: StatsDelta,
    ) -> Result<(), DatabaseError> {
        let key = date_key(date);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO daily_stats (date, messages_received, replies_sent, canned_replies,
                spam_filtered, errors, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (date) DO UPDATE SET
                messages_received = messages_received + excluded.messages_received,
                replies_sent = replies_sent + excluded.replies_sent,
                canned_replies = canned_replies + excluded.canned_replies,
                spam_filtered = spam_filtered + excluded.spam_filtered,
                errors = errors + excluded.errors,
                updated_at = excluded.updated_at",
            params![
                key.clone(),
                delta.messages_received,
                delta.replies_sent,
                delta.canned_replies,
                delta.spam_filtered,
                delta.errors,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("increment_daily_stats: {e}")))?;

        // Rates are derived from whatever the counters hold at this point.
        conn.execute(
            "UPDATE daily_stats SET
                reply_rate = printf('%.1f%%', CASE WHEN messages_received > 0
                    THEN replies_sent * 100.0 / messages_received ELSE 0.0 END),
                spam_rate = printf('%.1f%%', CASE WHEN messages_received > 0
                    THEN spam_filtered * 100.0 / messages_received ELSE 0.0 END)
             WHERE date = ?1",
            params![key],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("increment_daily_stats rates: {e}")))?;
        Ok(())
    }

    async fn get_daily_stats(&self, date: NaiveDate) -> Result<Option<DailyStats>, DatabaseError> {
        self.query_one(
            "get_daily_stats",
            &format!("SELECT {STATS_COLUMNS} FROM daily_stats WHERE date = ?1"),
            params![date_key(date)],
            row_to_stats,
        )
        .await
    }

    async fn record_question(
        &self,
        question_text: &str,
        category: Option<&str>,
        sample_reply: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO frequent_questions (question_text, category, count, first_seen, last_seen)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT (question_text) DO UPDATE SET
                count = count + 1,
                last_seen = excluded.last_seen,
                category = COALESCE(frequent_questions.category, excluded.category)",
            params![question_text, opt_text(category), seen_at.to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_question: {e}")))?;

        if let Some(reply) = sample_reply {
            conn.execute(
                "UPDATE frequent_questions
                 SET sample_replies = json_insert(sample_replies, '$[#]', ?2)
                 WHERE question_text = ?1 AND json_array_length(sample_replies) < ?3",
                params![question_text, reply, MAX_SAMPLE_REPLIES],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_question sample: {e}")))?;
        }
        Ok(())
    }

    async fn top_questions(&self, limit: usize) -> Result<Vec<FrequentQuestion>, DatabaseError> {
        self.query_all(
            "top_questions",
            &format!(
                "SELECT {QUESTION_COLUMNS} FROM frequent_questions
                 ORDER BY count DESC, last_seen DESC
                 LIMIT ?1"
            ),
            params![limit as i64],
            row_to_question,
        )
        .await
    }
}
