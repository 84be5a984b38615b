//! Error types for the booking agent.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
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

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel (transport + inbound) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while routing an inbound message.
///
/// Collaborator failures never show up here: they degrade to defaults.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Conversation {conversation_id} is busy (waited {waited:?}), try again")]
    Busy {
        conversation_id: String,
        waited: Duration,
    },

    #[error("Invalid inbound message: {0}")]
    InvalidMessage(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl RoutingError {
    /// Whether the caller should retry the same message later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Errors raised while delivering an action plan.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Transport failed: {0}")]
    Transport(#[from] ChannelError),

    #[error("Band member {0} is not on the roster")]
    UnknownMember(String),

    #[error("No reply address for conversation {0}")]
    MissingReplyAddress(String),

    #[error("Dispatch for message {0} is already in flight")]
    InFlight(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the booking agent.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_retryable() {
        let err = RoutingError::Busy {
            conversation_id: "email:venue@example.com".into(),
            waited: Duration::from_secs(10),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("try again"));
    }

    #[test]
    fn database_routing_error_is_not_retryable() {
        let err = RoutingError::Database(DatabaseError::Query("boom".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn dispatch_error_wraps_channel_error() {
        let err: Error = DispatchError::from(ChannelError::SendFailed {
            name: "email".into(),
            reason: "smtp down".into(),
        })
        .into();
        assert!(err.to_string().contains("smtp down"));
    }
}
