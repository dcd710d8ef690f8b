//! Data-access façade used by application code
//!
//! [`OptimizedApiService`] composes the cache, the request batcher and the
//! backing store. Every read goes through the cache; reads the batch policy
//! accepts are merged with concurrent reads of the same shape; mutations
//! invalidate the cache tags they affect.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::backend::BackingStore;
use crate::batch_policy::{BatchPolicy, HeuristicBatchPolicy};
use crate::batcher::{BatchStats, Priority, RequestBatcher};
use crate::cache_manager::{CacheManager, CacheStats, CleanupTask, GetOptions, Invalidation};
use crate::durable::DurableStore;
use crate::query::{
    FilterValue, Filters, OrderBy, Pagination, QueryShape, Row, Selector, sort_rows,
};
use crate::{CacheError, ServiceConfig};

/// Upper bound on rows fetched per relation by [`OptimizedApiService::get_related_data`].
const RELATED_ROWS_LIMIT: usize = 1000;

/// Cached result of one query: the page of rows and the total match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub data: Vec<Row>,
    pub count: u64,
}

/// Options for [`OptimizedApiService::query`]
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub select: Selector,
    pub filters: Filters,
    pub order_by: Vec<OrderBy>,
    /// Page 1 of the configured default size when `None`
    pub pagination: Option<Pagination>,
    /// Read through the cache
    pub cache: bool,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub force_refresh: bool,
    pub priority: Priority,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            select: Selector::All,
            filters: Filters::new(),
            order_by: Vec::new(),
            pagination: None,
            cache: true,
            ttl: None,
            tags: Vec::new(),
            force_refresh: false,
            priority: Priority::Normal,
        }
    }
}

impl QueryOptions {
    pub fn select(mut self, select: Selector) -> Self {
        self.select = select;
        self
    }

    pub fn filter(mut self, column: impl Into<String>, filter: FilterValue) -> Self {
        self.filters.insert(column.into(), filter);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.pagination = Some(Pagination::page(page, page_size));
        self
    }

    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.pagination = Some(Pagination::range(offset, limit));
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of a read. Failures leave `data` empty and set `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub data: Vec<Row>,
    pub count: u64,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub has_more: bool,
    pub error: Option<CacheError>,
}

impl QueryResponse {
    fn from_page(page: &Page, pagination: Pagination) -> Self {
        let window = pagination.window();
        let page_size = window.limit;
        let total_pages = (page.count as usize).div_ceil(page_size);
        Self {
            data: page.data.clone(),
            count: page.count,
            page: pagination.page_number(),
            page_size,
            total_pages,
            has_more: (window.offset.saturating_add(page.data.len()) as u64) < page.count,
            error: None,
        }
    }

    fn empty(pagination: Pagination) -> Self {
        Self::from_page(
            &Page {
                data: Vec::new(),
                count: 0,
            },
            pagination,
        )
    }

    fn failed(pagination: Pagination, error: CacheError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(pagination)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResponse {
    pub success: bool,
    pub data: Option<Vec<Row>>,
    pub error: Option<CacheError>,
    /// Records written before any failure. These are not rolled back.
    pub committed: usize,
}

impl MutationResponse {
    fn succeeded(data: Vec<Row>) -> Self {
        Self {
            success: true,
            committed: data.len(),
            data: Some(data),
            error: None,
        }
    }

    fn failed(error: CacheError, committed: usize) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            committed,
        }
    }
}

/// Options for [`OptimizedApiService::bulk_insert`]
#[derive(Debug, Clone, Default)]
pub struct BulkInsertOptions {
    /// Records per insert call; the configured default when `None`
    pub batch_size: Option<usize>,
    /// Tags to invalidate afterwards; the resource when `None`
    pub invalidate_tags: Option<Vec<String>>,
}

/// Options for [`OptimizedApiService::update`] and [`OptimizedApiService::delete`]
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Tags to invalidate afterwards; `resource` and `resource:id` when `None`
    pub invalidate_tags: Option<Vec<String>>,
}

/// A child resource fetched by [`OptimizedApiService::get_related_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Key in the returned map
    pub name: String,
    pub resource: String,
    /// Column of `resource` holding the parent id
    pub foreign_key: String,
}

impl Relation {
    pub fn new(resource: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            name: resource.clone(),
            resource,
            foreign_key: foreign_key.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Tag carried by cache entries that read a single row by id.
pub fn id_tag(resource: &str, id: &Value) -> String {
    match id {
        Value::String(s) => format!("{}:{}", resource, s),
        other => format!("{}:{}", resource, other),
    }
}

/// Caching, batching data-access service.
#[derive(Clone)]
pub struct OptimizedApiService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Arc<dyn BackingStore>,
    cache: CacheManager<Page>,
    batcher: RequestBatcher,
    policy: Arc<dyn BatchPolicy>,
    config: ServiceConfig,
}

/// Builder for [`OptimizedApiService`]
pub struct ServiceBuilder {
    store: Arc<dyn BackingStore>,
    durable: Option<Arc<dyn DurableStore>>,
    policy: Arc<dyn BatchPolicy>,
    config: ServiceConfig,
}

impl ServiceBuilder {
    pub fn durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn policy(mut self, policy: impl BatchPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> OptimizedApiService {
        let cache = CacheManager::new(self.config.cache.clone(), self.durable);
        let batcher = RequestBatcher::new(Arc::clone(&self.store), self.config.batch.clone());
        OptimizedApiService {
            inner: Arc::new(ServiceInner {
                store: self.store,
                cache,
                batcher,
                policy: self.policy,
                config: self.config,
            }),
        }
    }
}

impl OptimizedApiService {
    pub fn builder(store: Arc<dyn BackingStore>) -> ServiceBuilder {
        ServiceBuilder {
            store,
            durable: None,
            policy: Arc::new(HeuristicBatchPolicy::default()),
            config: ServiceConfig::default(),
        }
    }

    /// Service with the default policy and configuration, memory-only cache.
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Read a page of `resource`.
    pub async fn query(&self, resource: &str, options: QueryOptions) -> QueryResponse {
        let pagination = options
            .pagination
            .unwrap_or(Pagination::page(1, self.inner.config.default_page_size));
        let shape = QueryShape {
            resource: resource.to_owned(),
            select: options.select,
            filters: options.filters,
            order: options.order_by,
            window: pagination.window(),
        };
        let priority = options.priority;

        let result = if options.cache {
            let key = shape.cache_key();
            let get_options = GetOptions {
                ttl: options.ttl,
                tags: entry_tags(&shape, options.tags),
                force_refresh: options.force_refresh,
                dedup: true,
            };
            match self
                .inner
                .cache
                .get(&key, || self.fetch_page(&shape, priority), get_options)
                .await
            {
                Ok(page) => Ok(page),
                Err(e) if e.is_cache_layer() => {
                    warn!("Cache layer error for {}: {}. Fetching directly.", key, e);
                    self.fetch_direct(&shape).await.map(Arc::new)
                }
                Err(e) => Err(e),
            }
        } else {
            self.fetch_page(&shape, priority).await.map(Arc::new)
        };

        match result {
            Ok(page) => QueryResponse::from_page(&page, pagination),
            Err(e) => {
                error!("Query on {} failed: {}", resource, e);
                QueryResponse::failed(pagination, e)
            }
        }
    }

    /// Case-insensitive substring search on one column.
    ///
    /// Terms shorter than the configured minimum return an empty response
    /// without touching the cache or the store.
    pub async fn search(
        &self,
        resource: &str,
        column: &str,
        term: &str,
        options: QueryOptions,
    ) -> QueryResponse {
        let term = term.trim();
        if term.chars().count() < self.inner.config.search_min_len {
            let pagination = options
                .pagination
                .unwrap_or(Pagination::page(1, self.inner.config.default_page_size));
            return QueryResponse::empty(pagination);
        }

        let options = options
            .filter(column, FilterValue::like(format!("%{}%", term)))
            .tag(format!("search:{}:{}", resource, column));
        self.query(resource, options).await
    }

    /// Insert `records` in chunks, sequentially.
    ///
    /// A failing chunk stops the insert. Chunks already written stay written;
    /// `committed` in the response says how many records that is.
    pub async fn bulk_insert(
        &self,
        resource: &str,
        records: Vec<Row>,
        options: BulkInsertOptions,
    ) -> MutationResponse {
        let batch_size = options
            .batch_size
            .unwrap_or(self.inner.config.bulk_batch_size)
            .max(1);
        let tags = options
            .invalidate_tags
            .unwrap_or_else(|| vec![resource.to_owned()]);

        let mut inserted = Vec::with_capacity(records.len());
        let mut committed = 0;
        for chunk in records.chunks(batch_size) {
            match self.inner.store.insert(resource, chunk).await {
                Ok(rows) => {
                    committed += chunk.len();
                    inserted.extend(rows);
                }
                Err(e) => {
                    error!(
                        "Bulk insert into {} failed after {} records: {}",
                        resource, committed, e
                    );
                    if committed > 0 {
                        self.invalidate_cache(Invalidation::Tags(tags)).await;
                    }
                    return MutationResponse::failed(e.into(), committed);
                }
            }
        }

        debug!("Inserted {} records into {}", committed, resource);
        self.invalidate_cache(Invalidation::Tags(tags)).await;
        MutationResponse::succeeded(inserted)
    }

    /// Update one row by id.
    pub async fn update(
        &self,
        resource: &str,
        id: impl Into<Value>,
        changes: Row,
        options: UpdateOptions,
    ) -> MutationResponse {
        let id = id.into();
        match self.inner.store.update(resource, &id, &changes).await {
            Ok(rows) => {
                self.invalidate_after_write(resource, &id, options).await;
                MutationResponse::succeeded(rows)
            }
            Err(e) => {
                error!("Update of {} in {} failed: {}", id, resource, e);
                MutationResponse::failed(e.into(), 0)
            }
        }
    }

    /// Delete one row by id.
    pub async fn delete(
        &self,
        resource: &str,
        id: impl Into<Value>,
        options: UpdateOptions,
    ) -> MutationResponse {
        let id = id.into();
        match self.inner.store.delete(resource, &id).await {
            Ok(()) => {
                self.invalidate_after_write(resource, &id, options).await;
                MutationResponse::succeeded(Vec::new())
            }
            Err(e) => {
                error!("Delete of {} in {} failed: {}", id, resource, e);
                MutationResponse::failed(e.into(), 0)
            }
        }
    }

    /// Fetch every relation of one parent row concurrently.
    ///
    /// A relation that fails to load maps to an empty list.
    pub async fn get_related_data(
        &self,
        resource: &str,
        id: impl Into<Value>,
        relations: &[Relation],
    ) -> HashMap<String, Vec<Row>> {
        let id = id.into();
        let parent_tag = &id_tag(resource, &id);

        let loads = relations.iter().map(|relation| {
            let options = QueryOptions::default()
                .filter(&relation.foreign_key, FilterValue::Eq(id.clone()))
                .range(0, RELATED_ROWS_LIMIT)
                .tag(parent_tag.clone());
            async move {
                let response = self.query(&relation.resource, options).await;
                if let Some(e) = &response.error {
                    warn!(
                        "Related data {} for {} failed to load: {}",
                        relation.name, parent_tag, e
                    );
                }
                (relation.name.clone(), response.data)
            }
        });

        join_all(loads).await.into_iter().collect()
    }

    pub async fn invalidate_cache(&self, target: Invalidation) -> usize {
        self.inner.cache.invalidate(target).await
    }

    pub async fn clear_caches(&self) {
        self.inner.cache.clear().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.inner.batcher.stats()
    }

    /// Start the periodic expiry sweep at the configured interval.
    pub fn spawn_cleanup(&self) -> CleanupTask {
        self.inner
            .cache
            .spawn_cleanup(self.inner.config.cache.cleanup_interval)
    }

    async fn invalidate_after_write(&self, resource: &str, id: &Value, options: UpdateOptions) {
        let tags = options
            .invalidate_tags
            .unwrap_or_else(|| vec![resource.to_owned(), id_tag(resource, id)]);
        self.invalidate_cache(Invalidation::Tags(tags)).await;
    }

    async fn fetch_page(&self, shape: &QueryShape, priority: Priority) -> Result<Page, CacheError> {
        if !self.inner.policy.should_batch(shape) {
            return self.fetch_direct(shape).await;
        }

        // Ordering happens here, so the order columns must come back
        let select = shape
            .select
            .with_columns(shape.order.iter().map(|o| &o.column));
        let mut rows = self
            .inner
            .batcher
            .batch_request(&shape.resource, &select, shape.filters.clone(), priority)
            .await?;
        sort_rows(&mut rows, &shape.order);

        let count = rows.len() as u64;
        let data = shape
            .window
            .apply(rows)
            .into_iter()
            .map(|row| shape.select.project(row))
            .collect();
        Ok(Page { data, count })
    }

    async fn fetch_direct(&self, shape: &QueryShape) -> Result<Page, CacheError> {
        let result = self.inner.store.select(&shape.to_select_query()).await?;
        let count = result
            .count
            .unwrap_or(shape.window.offset.saturating_add(result.rows.len()) as u64);
        Ok(Page {
            data: result.rows,
            count,
        })
    }
}

/// Tags for a query's cache entry: the resource, the row when the query
/// pins `id`, and the caller's own tags.
fn entry_tags(shape: &QueryShape, extra: Vec<String>) -> Vec<String> {
    let mut tags = vec![shape.resource.clone()];
    if let Some(FilterValue::Eq(id)) = shape.filters.get("id") {
        tags.push(id_tag(&shape.resource, id));
    }
    tags.extend(extra);
    tags
}
