use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The identifier could not be parsed by the key codec of its provider.
    #[error("malformed cache key '{key}': {reason}")]
    KeyFormat { key: String, reason: String },

    /// The storage backend could not be reached or failed to apply a batch.
    #[error("cache backend '{backend}' unavailable: {message}")]
    Unavailable { backend: String, message: String },

    #[error("agent '{agent}' failed to load data: {message}")]
    AgentExecution { agent: String, message: String },

    /// Two agents claim authority over the same type in overlapping scopes.
    #[error("type '{data_type}' has conflicting authoritative sources: '{first}' and '{second}'")]
    AuthorityConflict {
        data_type: String,
        first:     String,
        second:    String,
    },

    #[error("agent '{agent}' timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("agent '{agent}' execution was cancelled")]
    Cancelled { agent: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no agent registered as '{0}'")]
    UnknownAgent(String),
}

impl CacheError {
    pub fn key_format<K: ToString, R: ToString>(key: K, reason: R) -> Self {
        Self::KeyFormat {
            key:    key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable<B: ToString, M: ToString>(backend: B, message: M) -> Self {
        Self::Unavailable {
            backend: backend.to_string(),
            message: message.to_string(),
        }
    }

    pub fn agent_execution<A: ToString, M: ToString>(agent: A, message: M) -> Self {
        Self::AgentExecution {
            agent:   agent.to_string(),
            message: message.to_string(),
        }
    }

    pub fn config<M: ToString>(message: M) -> Self {
        Self::Config(message.to_string())
    }

    /// Errors that abandon an agent cycle and are retried on the next interval.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::AgentExecution { .. } | Self::Timeout { .. } | Self::Cancelled { .. }
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::unavailable("task", err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::unavailable("redis", err)
    }
}
