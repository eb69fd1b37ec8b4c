//! Error types for the auto-reply service.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("AI provider error: {0}")]
    Ai(#[from] AiError),

    #[error("Messaging provider error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown {kind} provider: {name}")]
    UnknownProvider { kind: String, name: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence failures. Fatal for the inbound write path, logged elsewhere.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from an AI provider.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} quota or rate limit exceeded: {reason}")]
    Quota { provider: String, reason: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned an empty reply")]
    EmptyResponse { provider: String },
}

impl AiError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::InvalidRequest { .. })
    }
}

/// Errors from a messaging provider, classified for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} transient failure: {reason}")]
    Transient { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} rejected address {address}: {reason}")]
    InvalidAddress {
        provider: String,
        address: String,
        reason: String,
    },

    #[error("Recipient {address} is blocked on {provider}: {reason}")]
    Blocked {
        provider: String,
        address: String,
        reason: String,
    },

    #[error("Provider {provider} rejected the message: {reason}")]
    Rejected { provider: String, reason: String },
}

impl MessagingError {
    /// Network and rate-limit class errors are worth retrying; everything else is final.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transient { .. } | Self::RateLimited { .. }
        )
    }

    /// Server-provided hint for the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A webhook payload that cannot be turned into an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Payload has no sender address")]
    MissingSender,

    #[error("Payload has no message body")]
    MissingBody,

    #[error("Sender address is not valid: {0}")]
    InvalidSender(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Machine-readable reason code returned to the webhook caller.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSender => "missing_sender",
            Self::MissingBody => "missing_body",
            Self::InvalidSender(_) => "invalid_sender",
            Self::Malformed(_) => "malformed_payload",
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
