//! Error types

use redis::RedisError;

/// Failures reported by the backing store.
///
/// Cloneable so one failure can be handed to every caller that was waiting
/// on the same fetch or batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("query on {resource} failed: {message}")]
    Query { resource: String, message: String },

    #[error("mutation on {resource} failed: {message}")]
    Mutation { resource: String, message: String },

    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn query(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn mutation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mutation {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Cache-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Backend error: {0}")]
    Backend(#[from] StoreError),

    #[error("In-flight fetch was cancelled")]
    Cancelled,

    #[error("Batch dispatcher dropped the request")]
    BatchDropped,
}

impl CacheError {
    /// True for failures of the caching machinery itself rather than of the
    /// backing store. Callers may retry these with a direct fetch.
    pub fn is_cache_layer(&self) -> bool {
        matches!(self, Self::Cancelled | Self::BatchDropped)
    }
}

/// Durable tier errors. These never reach callers of the cache; they are
/// logged and the cache carries on memory-only.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Durable store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_layer_classification() {
        assert!(CacheError::Cancelled.is_cache_layer());
        assert!(CacheError::BatchDropped.is_cache_layer());
        assert!(!CacheError::from(StoreError::query("classes", "timeout")).is_cache_layer());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::mutation("fees", "duplicate key");
        assert_eq!(err.to_string(), "mutation on fees failed: duplicate key");
    }
}
