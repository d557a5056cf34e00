//! Persistence layer: customers, conversations and statistics on libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Conversation, Customer, DailyStats, Database, FrequentQuestion, MarkOutcome, NewConversation,
    Priority, StatsDelta,
};
