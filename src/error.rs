//! Error types for auto-reply.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A concurrent writer already resolved the same entity.
    #[error("Conflicting write on {entity} {key}")]
    Conflict { entity: String, key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Bad or missing identifiers on an inbound unit. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// External call failures (platform API, operator channel).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{platform} request failed: {reason}")]
    Request { platform: String, reason: String },

    #[error("{platform} API error (status {status}): {message}")]
    Api {
        platform: String,
        status: u16,
        message: String,
    },

    #[error("{platform} rate limited, retry after {retry_after:?}")]
    RateLimited {
        platform: String,
        retry_after: Option<Duration>,
    },

    #[error("Malformed response from {platform}: {reason}")]
    Malformed { platform: String, reason: String },

    #[error("No credential for account {account_id}")]
    CredentialMissing { account_id: String },

    #[error("No transport registered for platform {0}")]
    UnknownPlatform(String),
}

impl TransportError {
    /// The account's credential is missing, expired or rejected.
    pub fn is_credential_failure(&self) -> bool {
        match self {
            Self::CredentialMissing { .. } => true,
            Self::Api { status, message, .. } => {
                matches!(status, 401 | 403) || message.to_lowercase().contains("access token")
            }
            _ => false,
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Stage list failed startup validation (unknown, duplicate or late dependency).
    #[error("Invalid stage order: {0}")]
    InvalidOrder(String),

    /// A stage read state that no earlier stage produced.
    #[error("{0} not resolved by an earlier stage")]
    MissingContext(&'static str),

    /// Reply generation failed; the conversation stays not-replied.
    #[error("Completion backend failed: {0}")]
    Completion(#[from] LlmError),

    #[error("Reply delivery failed: {0}")]
    Delivery(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl PipelineError {
    /// Completion failures are surfaced separately so callers may escalate.
    pub fn is_completion_failure(&self) -> bool {
        matches!(self, Self::Completion(_))
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
