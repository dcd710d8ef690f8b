//! Backing store seam
//!
//! The system of record is reached only through [`BackingStore`]. The
//! engine never assumes anything about the store beyond filter/select/
//! order/paginate reads and create/update/delete mutations.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::query::{QueryRows, Row, SelectQuery};

/// Trait for reaching the backing store.
///
/// Implementations can wrap an HTTP data API, a SQL pool or an in-process
/// table for tests.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Run a filtered, ordered, optionally paginated read.
    async fn select(&self, query: &SelectQuery) -> Result<QueryRows, StoreError>;

    /// Insert records, returning the stored rows.
    async fn insert(&self, resource: &str, records: &[Row]) -> Result<Vec<Row>, StoreError>;

    /// Apply `changes` to the row whose `id` equals `id`, returning the updated rows.
    async fn update(&self, resource: &str, id: &Value, changes: &Row)
    -> Result<Vec<Row>, StoreError>;

    /// Delete the row whose `id` equals `id`.
    async fn delete(&self, resource: &str, id: &Value) -> Result<(), StoreError>;
}
