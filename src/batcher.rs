//! Time-windowed request batching
//!
//! Point-queries against the same `(resource, selector)` land in one bucket.
//! A bucket moves through `EMPTY → ACCUMULATING → FLUSHING → EMPTY`:
//! - EMPTY: no entry in the bucket map
//! - ACCUMULATING: entry in the map, one scheduled task watching its deadlines
//! - FLUSHING: removed from the map and owned by the task executing it
//!
//! A bucket flushes on whichever comes first: a high-priority arrival, the
//! size limit, the debounce deadline (reset by every arrival), or the hard
//! deadline fixed at first arrival. Flushing merges the members into one
//! set-membership query when their filters line up, and routes each row
//! back to the callers whose filters it satisfies.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::backend::BackingStore;
use crate::query::{FilterValue, Filters, Row, SelectQuery, Selector};
use crate::{BatchConfig, CacheError};

/// Scheduling priority of a batched request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    /// Flush the bucket immediately, taking queued members along
    High,
}

/// Why a bucket was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    HighPriority,
    Full,
    Debounce,
    MaxWait,
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    resource: String,
    selector: Selector,
}

type Responder = oneshot::Sender<Result<Vec<Row>, CacheError>>;

struct BatchRequest {
    id: u64,
    filters: Filters,
    responder: Responder,
}

impl BatchRequest {
    fn accepts(&self, row: &Row) -> bool {
        self.filters
            .iter()
            .all(|(column, filter)| filter.matches(row.get(column)))
    }
}

/// An accumulating bucket.
struct Bucket {
    id: u64,
    requests: Vec<BatchRequest>,
    first_arrival: Instant,
    debounce_deadline: Instant,
}

impl Bucket {
    fn hard_deadline(&self, config: &BatchConfig) -> Instant {
        self.first_arrival + config.max_wait_time
    }

    fn next_deadline(&self, config: &BatchConfig) -> Instant {
        self.debounce_deadline.min(self.hard_deadline(config))
    }

    fn due(&self, now: Instant, config: &BatchConfig) -> Option<FlushReason> {
        if now >= self.hard_deadline(config) {
            Some(FlushReason::MaxWait)
        } else if now >= self.debounce_deadline {
            Some(FlushReason::Debounce)
        } else {
            None
        }
    }
}

/// A drained bucket, owned by whoever executes it.
struct Flush {
    key: BucketKey,
    requests: Vec<BatchRequest>,
    reason: FlushReason,
}

enum Enqueued {
    /// First member: a timer task must be scheduled for the bucket
    Opened(u64),
    Joined,
    Flush(Flush),
}

/// Counters describing batcher activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub requests: u64,
    pub flushes: u64,
    pub combined_queries: u64,
    pub individual_queries: u64,
    /// Callers that went away before their bucket flushed
    pub cancelled: u64,
}

#[derive(Default)]
struct BatchMetrics {
    requests: AtomicU64,
    flushes: AtomicU64,
    combined_queries: AtomicU64,
    individual_queries: AtomicU64,
    cancelled: AtomicU64,
}

/// Groups concurrent point-queries into combined backing-store calls.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    store: Arc<dyn BackingStore>,
    config: BatchConfig,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    next_id: AtomicU64,
    metrics: BatchMetrics,
}

impl RequestBatcher {
    pub fn new(store: Arc<dyn BackingStore>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                store,
                config,
                buckets: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                metrics: BatchMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queue a filtered read and wait for its rows.
    ///
    /// Dropping the returned future before the bucket flushes withdraws the
    /// request without affecting the other members.
    pub async fn batch_request(
        &self,
        resource: &str,
        selector: &Selector,
        filters: Filters,
        priority: Priority,
    ) -> Result<Vec<Row>, CacheError> {
        let (responder, rx) = oneshot::channel();
        let key = BucketKey {
            resource: resource.to_owned(),
            selector: selector.clone(),
        };
        let request = BatchRequest {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            filters,
            responder,
        };
        self.inner.metrics.requests.fetch_add(1, Ordering::Relaxed);

        match self.inner.enqueue(key.clone(), request, priority) {
            Enqueued::Opened(bucket_id) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.run_bucket_timer(key, bucket_id).await });
            }
            Enqueued::Joined => {}
            Enqueued::Flush(flush) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.execute(flush).await });
            }
        }

        rx.await.unwrap_or(Err(CacheError::BatchDropped))
    }

    /// Flush every accumulating bucket now and wait for the results to be
    /// delivered.
    pub async fn flush_all(&self) {
        let drained: Vec<Flush> = self
            .inner
            .lock_buckets()
            .drain()
            .map(|(key, bucket)| Flush {
                key,
                requests: bucket.requests,
                reason: FlushReason::Drain,
            })
            .collect();
        join_all(drained.into_iter().map(|flush| self.inner.execute(flush))).await;
    }

    /// Number of buckets currently accumulating.
    pub fn pending_buckets(&self) -> usize {
        self.inner.lock_buckets().len()
    }

    pub fn stats(&self) -> BatchStats {
        let m = &self.inner.metrics;
        BatchStats {
            requests: m.requests.load(Ordering::Relaxed),
            flushes: m.flushes.load(Ordering::Relaxed),
            combined_queries: m.combined_queries.load(Ordering::Relaxed),
            individual_queries: m.individual_queries.load(Ordering::Relaxed),
            cancelled: m.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl BatcherInner {
    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<BucketKey, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, key: BucketKey, request: BatchRequest, priority: Priority) -> Enqueued {
        let now = Instant::now();
        let mut buckets = self.lock_buckets();

        let (bucket_id, opened, size) = {
            let (bucket, opened) = match buckets.entry(key.clone()) {
                Entry::Occupied(entry) => (entry.into_mut(), false),
                Entry::Vacant(entry) => {
                    let bucket = Bucket {
                        id: request.id,
                        requests: Vec::new(),
                        first_arrival: now,
                        debounce_deadline: now,
                    };
                    (entry.insert(bucket), true)
                }
            };
            bucket.requests.push(request);
            bucket.debounce_deadline = now + self.config.batch_delay;
            (bucket.id, opened, bucket.requests.len())
        };

        let reason = if priority == Priority::High {
            Some(FlushReason::HighPriority)
        } else if size >= self.config.max_batch_size {
            Some(FlushReason::Full)
        } else {
            None
        };

        match reason {
            Some(reason) => match buckets.remove(&key) {
                Some(bucket) => Enqueued::Flush(Flush {
                    key,
                    requests: bucket.requests,
                    reason,
                }),
                None => Enqueued::Joined,
            },
            None if opened => Enqueued::Opened(bucket_id),
            None => Enqueued::Joined,
        }
    }

    /// Next deadline of bucket `bucket_id`, or `None` once it is gone.
    fn next_deadline(&self, key: &BucketKey, bucket_id: u64) -> Option<Instant> {
        self.lock_buckets()
            .get(key)
            .filter(|b| b.id == bucket_id)
            .map(|b| b.next_deadline(&self.config))
    }

    /// Drain bucket `bucket_id` if one of its deadlines has passed. A bucket
    /// that is absent or was replaced is left alone.
    fn take_if_due(&self, key: &BucketKey, bucket_id: u64, now: Instant) -> Option<Flush> {
        let mut buckets = self.lock_buckets();
        let reason = buckets
            .get(key)
            .filter(|b| b.id == bucket_id)
            .and_then(|b| b.due(now, &self.config))?;
        let bucket = buckets.remove(key)?;
        Some(Flush {
            key: key.clone(),
            requests: bucket.requests,
            reason,
        })
    }

    async fn run_bucket_timer(&self, key: BucketKey, bucket_id: u64) {
        while let Some(deadline) = self.next_deadline(&key, bucket_id) {
            tokio::time::sleep_until(deadline).await;
            if let Some(flush) = self.take_if_due(&key, bucket_id, Instant::now()) {
                self.execute(flush).await;
                return;
            }
        }
    }

    async fn execute(&self, flush: Flush) {
        let Flush {
            key,
            requests,
            reason,
        } = flush;
        let queued = requests.len();
        let requests: Vec<BatchRequest> = requests
            .into_iter()
            .filter(|r| !r.responder.is_closed())
            .collect();
        let cancelled = queued - requests.len();
        if cancelled > 0 {
            self.metrics
                .cancelled
                .fetch_add(cancelled as u64, Ordering::Relaxed);
        }
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Flushing batch {}[{}]: {} requests ({:?}, {} cancelled)",
            key.resource,
            key.selector,
            requests.len(),
            reason,
            cancelled
        );

        if requests.len() <= 1 {
            if let Some(request) = requests.into_iter().next() {
                let result = self.run_single(&key, &request.filters).await;
                let _ = request.responder.send(result);
            }
            return;
        }

        match combine_filters(&requests) {
            Some(combined) => self.run_combined(&key, requests, combined).await,
            None => self.run_individually(&key, requests).await,
        }
    }

    async fn run_single(&self, key: &BucketKey, filters: &Filters) -> Result<Vec<Row>, CacheError> {
        self.metrics.individual_queries.fetch_add(1, Ordering::Relaxed);
        let query = SelectQuery::new(&key.resource)
            .select(key.selector.clone())
            .filters(filters.clone());
        match self.store.select(&query).await {
            Ok(result) => Ok(result.rows),
            Err(e) => {
                error!("Batched query on {} failed: {}", key.resource, e);
                Err(CacheError::Backend(e))
            }
        }
    }

    async fn run_individually(&self, key: &BucketKey, requests: Vec<BatchRequest>) {
        debug!(
            "Filters of {} requests on {} do not combine; running individually",
            requests.len(),
            key.resource
        );
        join_all(requests.into_iter().map(|request| async move {
            let result = self.run_single(key, &request.filters).await;
            let _ = request.responder.send(result);
        }))
        .await;
    }

    async fn run_combined(&self, key: &BucketKey, requests: Vec<BatchRequest>, combined: Filters) {
        self.metrics.combined_queries.fetch_add(1, Ordering::Relaxed);
        // Filter columns must come back for rows to be routed
        let select = key.selector.with_columns(combined.keys());
        let query = SelectQuery::new(&key.resource)
            .select(select)
            .filters(combined);

        match self.store.select(&query).await {
            Ok(result) => {
                for request in requests {
                    let rows: Vec<Row> = result
                        .rows
                        .iter()
                        .filter(|row| request.accepts(row))
                        .cloned()
                        .map(|row| key.selector.project(row))
                        .collect();
                    let _ = request.responder.send(Ok(rows));
                }
            }
            Err(e) => {
                error!(
                    "Combined query on {} failed for {} requests: {}",
                    key.resource,
                    requests.len(),
                    e
                );
                let err = CacheError::Backend(e);
                for request in requests {
                    let _ = request.responder.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Merge the filters of several requests into one query.
///
/// Legal only when every request filters on the same columns with equality
/// or set-membership. Each column gets the deduplicated union of values.
fn combine_filters(requests: &[BatchRequest]) -> Option<Filters> {
    let first = requests.first()?;
    let same_columns = requests
        .iter()
        .all(|r| r.filters.keys().eq(first.filters.keys()));
    let combinable = requests
        .iter()
        .flat_map(|r| r.filters.values())
        .all(FilterValue::is_combinable);
    if !same_columns || !combinable {
        return None;
    }

    let mut combined = Filters::new();
    for column in first.filters.keys() {
        let mut values: Vec<Value> = Vec::new();
        for request in requests {
            for value in request.filters[column].values() {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        let filter = if values.len() == 1 {
            FilterValue::Eq(values.remove(0))
        } else {
            FilterValue::In(values)
        };
        combined.insert(column.clone(), filter);
    }
    Some(combined)
}
