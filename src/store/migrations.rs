//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                platform_user_id TEXT NOT NULL,
                name TEXT,
                phone TEXT,
                email TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (platform, platform_user_id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL REFERENCES customers(id),
                platform TEXT NOT NULL,
                platform_message_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'message',
                content TEXT NOT NULL,
                raw_payload TEXT,
                replied INTEGER NOT NULL DEFAULT 0,
                reply_content TEXT,
                reply_at TEXT,
                filtered INTEGER NOT NULL DEFAULT 0,
                filter_reason TEXT,
                priority INTEGER NOT NULL DEFAULT 1,
                received_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (platform, platform_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_customer ON conversations(customer_id);
            CREATE INDEX IF NOT EXISTS idx_conversations_replied ON conversations(replied);
        "#,
    },
    Migration {
        version: 2,
        name: "statistics",
        sql: r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                messages_received INTEGER NOT NULL DEFAULT 0,
                replies_sent INTEGER NOT NULL DEFAULT 0,
                canned_replies INTEGER NOT NULL DEFAULT 0,
                spam_filtered INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                reply_rate TEXT NOT NULL DEFAULT '0.0%',
                spam_rate TEXT NOT NULL DEFAULT '0.0%',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS frequent_questions (
                question_text TEXT PRIMARY KEY,
                category TEXT,
                count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                sample_replies TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_frequent_questions_count ON frequent_questions(count);
        "#,
    },
    Migration {
        version: 3,
        name: "delivery_failures",
        sql: r#"
            ALTER TABLE conversations ADD COLUMN delivery_failed INTEGER NOT NULL DEFAULT 0;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                libsql::params![name],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn creates_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        for table in ["customers", "conversations", "daily_stats", "frequent_questions"] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "statistics");
    }

    #[tokio::test]
    async fn message_id_is_unique_per_platform() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO customers (id, platform, platform_user_id, created_at, updated_at)
             VALUES ('c1', 'facebook', 'u1', 'now', 'now')",
            (),
        )
        .await
        .unwrap();

        let insert = "INSERT INTO conversations (id, customer_id, platform, platform_message_id,
            account_id, content, received_at, created_at)
            VALUES (?1, 'c1', ?2, 'm1', 'page', 'hi', 'now', 'now')";
        conn.execute(insert, libsql::params!["a", "facebook"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["b", "facebook"]).await.is_err());
        // Same message id on another platform is a different item
        conn.execute(insert, libsql::params!["c", "instagram"]).await.unwrap();
    }
}
