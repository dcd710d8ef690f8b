//! querycache - Caching and request-batching data access
//!
//! This library sits between application code and a remote query backend:
//! - Memory tier: bounded LRU Moka cache with per-entry TTL and tags
//! - Durable tier: Redis (or any [`DurableStore`]) surviving restarts
//! - Backend: pluggable [`BackingStore`] executing filtered reads and writes
//!
//! On top of the cache it provides:
//! - Deduplication of concurrent fetches for the same key
//! - Batching of similar concurrent reads into one combined query
//! - Tag-based invalidation after mutations
//! - A tenant-pinned view for multi-tenant applications

pub mod api_service;
pub mod backend;
pub mod batch_policy;
pub mod batcher;
pub mod cache_manager;
mod config;
pub mod durable;
mod error;
pub mod query;
pub mod tenant_scope;

#[cfg(test)]
mod test_support;

pub use api_service::{
    BulkInsertOptions, MutationResponse, OptimizedApiService, Page, QueryOptions, QueryResponse,
    Relation, ServiceBuilder, UpdateOptions,
};
pub use backend::BackingStore;
pub use batch_policy::{BatchPolicy, HeuristicBatchPolicy, NeverBatch};
pub use batcher::{BatchStats, Priority, RequestBatcher};
pub use cache_manager::{
    CacheManager, CacheStats, Cacheable, CleanupTask, GetOptions, Invalidation, SetOptions,
};
pub use config::{BatchConfig, CacheConfig, ServiceConfig};
pub use durable::{DurableStore, MemoryStore, RedisStore};
pub use error::{CacheError, DurableError, StoreError};
pub use query::{FilterValue, Filters, OrderBy, Pagination, QueryRows, Row, SelectQuery, Selector};
pub use tenant_scope::TenantScope;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
